//! Ingredient detection service configuration
//!
//! Values come from `config.toml` when present, then environment variables
//! override individual fields. Variables missing from the process
//! environment are also looked up in a local `.env` file. Everything is read
//! once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub device: String,
    /// Longer image side fed to the model, in pixels
    pub image_size: u32,
    pub confidence_threshold: f32,
    pub max_detections: usize,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    /// One class name per line, line index is the class id
    pub labels: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Address the Prometheus exporter listens on. `None` disables telemetry.
    pub connection_string: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file is `Ok(None)`
    pub fn load_optional(path: &str) -> Result<Option<Self>> {
        if !Path::new(path).exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    /// Override fields from process environment variables, then `.env`
    pub fn apply_env(&mut self) -> Result<()> {
        let dotenv = read_dotenv(Path::new(DOTENV_FILE))?;
        self.apply_overrides(|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    /// Override fields from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PORT") {
            self.server.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = lookup("ALLOWED_ORIGINS") {
            self.server.allowed_origins = parse_origins(&v);
        }
        if let Some(v) = lookup("MAX_UPLOAD_BYTES") {
            self.server.max_upload_bytes = parse_var("MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = lookup("INFERENCE_DEVICE") {
            self.inference.device = v.trim().to_string();
        }
        if let Some(v) = lookup("YOLO_IMG_SIZE") {
            self.inference.image_size = parse_var("YOLO_IMG_SIZE", &v)?;
        }
        if let Some(v) = lookup("CONFIDENCE_THRESHOLD") {
            self.inference.confidence_threshold = parse_var("CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MAX_DETECTIONS") {
            self.inference.max_detections = parse_var("MAX_DETECTIONS", &v)?;
        }
        if let Some(v) = lookup("IOU_THRESHOLD") {
            self.inference.iou_threshold = parse_var("IOU_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.models.detector = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("LABELS_PATH") {
            self.models.labels = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("TELEMETRY_CONNECTION_STRING") {
            let v = v.trim();
            self.telemetry.connection_string = (!v.is_empty()).then(|| v.to_string());
        }

        if self.inference.image_size == 0 {
            anyhow::bail!("inference.image_size must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.inference.confidence_threshold) {
            anyhow::bail!(
                "inference.confidence_threshold must be within [0, 1], got {}",
                self.inference.confidence_threshold
            );
        }

        Ok(())
    }
}

const DOTENV_FILE: &str = ".env";

/// Variables declared in a dotenv file. A missing file yields none.
pub fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    match dotenvy::from_path_iter(path) {
        Ok(iter) => iter
            .collect::<Result<HashMap<_, _>, _>>()
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.not_found() => Ok(HashMap::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                allowed_origins: vec![
                    "http://localhost:8000".to_string(),
                    "http://127.0.0.1:8000".to_string(),
                ],
                max_upload_bytes: 10 * 1024 * 1024,
            },
            inference: InferenceConfig {
                device: "CPU".to_string(),
                image_size: 640,
                confidence_threshold: 0.25,
                max_detections: 50,
                iou_threshold: 0.7,
            },
            models: ModelsConfig {
                detector: PathBuf::from("models/best.onnx"),
                labels: PathBuf::from("models/labels.txt"),
            },
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ingredient-service-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.inference.image_size, 640);
        assert_eq!(config.inference.max_detections, 50);
        assert!((config.inference.confidence_threshold - 0.25).abs() < f32::EPSILON);
        assert!(config.telemetry.connection_string.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("MODEL_PATH", "/srv/food.onnx"),
                ("YOLO_IMG_SIZE", "320"),
                ("ALLOWED_ORIGINS", " https://a.example , ,https://b.example"),
                ("TELEMETRY_CONNECTION_STRING", "0.0.0.0:9100"),
            ]))
            .unwrap();

        assert_eq!(config.models.detector, PathBuf::from("/srv/food.onnx"));
        assert_eq!(config.inference.image_size, 320);
        assert_eq!(
            config.server.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.telemetry.connection_string.as_deref(), Some("0.0.0.0:9100"));
    }

    #[test]
    fn test_blank_telemetry_string_disables_telemetry() {
        let mut config = Config::default();
        config.telemetry.connection_string = Some("0.0.0.0:9100".to_string());
        config
            .apply_overrides(lookup(&[("TELEMETRY_CONNECTION_STRING", "  ")]))
            .unwrap();
        assert!(config.telemetry.connection_string.is_none());
    }

    #[test]
    fn test_invalid_override_names_variable() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[("YOLO_IMG_SIZE", "large")]))
            .unwrap_err();
        assert!(err.to_string().contains("YOLO_IMG_SIZE"));
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(lookup(&[("CONFIDENCE_THRESHOLD", "1.5")]))
            .is_err());
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
            [server]
            port = 9000
            allowed_origins = ["https://kitchen.example"]
            max_upload_bytes = 1048576

            [inference]
            device = "GPU"
            image_size = 512
            confidence_threshold = 0.4
            max_detections = 20
            iou_threshold = 0.5

            [models]
            detector = "models/food.xml"
            labels = "models/food.txt"
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.inference.device, "GPU");
        assert!(config.telemetry.connection_string.is_none());
    }

    #[test]
    fn test_load_optional_missing_file() {
        let path = std::env::temp_dir().join("ingredient-service-no-such-config.toml");
        assert!(Config::load_optional(path.to_str().unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_load_optional_reports_syntax_error() {
        let path = scratch_file("broken.toml", "[server\nport = 9000\n");
        let result = Config::load_optional(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_dotenv_feeds_overrides() {
        let path = scratch_file(
            "dotenv",
            "# local settings\nMODEL_PATH=/opt/models/food.onnx\nMAX_DETECTIONS=\"12\"\n",
        );
        let vars = read_dotenv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut config = Config::default();
        config.apply_overrides(|key: &str| vars.get(key).cloned()).unwrap();
        assert_eq!(config.models.detector, PathBuf::from("/opt/models/food.onnx"));
        assert_eq!(config.inference.max_detections, 12);
    }

    #[test]
    fn test_missing_dotenv_is_empty() {
        let path = std::env::temp_dir().join("ingredient-service-no-such.env");
        assert!(read_dotenv(&path).unwrap().is_empty());
    }
}
