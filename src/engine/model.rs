//! Detection model holder
//!
//! The model is loaded once at startup and only read afterwards, so a single
//! `Arc<DetectionModel>` is shared by every request without locking.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{InferenceConfig, ModelsConfig};

use super::detector::OpenVinoDetector;
use super::preprocess::DecodedImage;

/// A single model output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
}

/// Detection policy fixed at startup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Square model input side, in pixels
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl From<&InferenceConfig> for DetectParams {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            input_size: config.image_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// Runtime that turns an image into detections.
///
/// Implementations must be callable from several threads at once and must
/// already apply the confidence threshold and the detection cap.
pub trait DetectionBackend: Send + Sync {
    /// Run the model on one image
    fn detect(&self, image: &DecodedImage, params: &DetectParams) -> Result<Vec<Detection>>;

    /// Optional graph fusion pass, run once before the model is shared
    fn fuse(&mut self) -> Result<()> {
        anyhow::bail!("graph fusion is not supported by this backend")
    }

    fn name(&self) -> &str;
}

/// The process-wide detection model
pub struct DetectionModel {
    backend: Box<dyn DetectionBackend>,
    class_names: Vec<String>,
    params: DetectParams,
}

impl DetectionModel {
    /// Load the OpenVINO detector and its class names from disk
    pub fn load(inference: &InferenceConfig, models: &ModelsConfig) -> Result<Self> {
        let start = Instant::now();
        info!("Loading detection model from: {}", models.detector.display());

        let class_names = load_class_names(&models.labels)?;
        let backend = OpenVinoDetector::load(&models.detector, &inference.device)?;

        let model = Self::with_backend(Box::new(backend), class_names, DetectParams::from(inference));
        info!(
            "Model loaded in {:?}. Inference image size: {}px, {} classes",
            start.elapsed(),
            model.params.input_size,
            model.class_names.len()
        );

        Ok(model)
    }

    /// Wrap an already constructed backend, attempting graph fusion first
    pub fn with_backend(
        mut backend: Box<dyn DetectionBackend>,
        class_names: Vec<String>,
        params: DetectParams,
    ) -> Self {
        match backend.fuse() {
            Ok(()) => info!("Model fused for faster inference."),
            Err(e) => info!("Model fusion not available ({}), using standard model.", e),
        }

        Self {
            backend,
            class_names,
            params,
        }
    }

    /// Run detection on a decoded image.
    ///
    /// Blocking; call from `spawn_blocking`. Backend errors are returned
    /// unchanged.
    pub fn infer(&self, image: &DecodedImage) -> Result<Vec<Detection>> {
        let mut detections = self.backend.detect(image, &self.params)?;

        // Backends already filter; keep the bounds even if one does not
        detections.retain(|d| d.confidence >= self.params.confidence_threshold);
        detections.truncate(self.params.max_detections);

        Ok(detections)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn params(&self) -> &DetectParams {
        &self.params
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

/// Read one class name per line; line index is the class id
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read class names from '{}'", path.display()))?;
    let names = parse_class_names(&content);
    if names.is_empty() {
        anyhow::bail!("Class name file '{}' is empty", path.display());
    }
    Ok(names)
}

fn parse_class_names(content: &str) -> Vec<String> {
    let mut names: Vec<String> = content.lines().map(|line| line.trim().to_string()).collect();
    while names.last().is_some_and(|name| name.is_empty()) {
        names.pop();
    }
    names
}
