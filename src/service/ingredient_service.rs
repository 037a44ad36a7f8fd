//! Ingredient Service - Core business logic
//!
//! Runs decode, inference and reduction for one upload and turns the result
//! into the outcome the API reports.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::engine::{decode_image, reduce, DetectionModel};
use crate::telemetry::InferenceTelemetry;

use super::types::*;

/// Ingredient detection service
pub struct IngredientService {
    model: OnceLock<Arc<DetectionModel>>,
    telemetry: Arc<dyn InferenceTelemetry>,
}

impl IngredientService {
    /// Create a service whose model is installed later
    pub fn new(telemetry: Arc<dyn InferenceTelemetry>) -> Self {
        Self {
            model: OnceLock::new(),
            telemetry,
        }
    }

    /// Create a service with the model already loaded
    pub fn with_model(model: DetectionModel, telemetry: Arc<dyn InferenceTelemetry>) -> Self {
        let service = Self::new(telemetry);
        service.install_model(model);
        service
    }

    /// Make the model available to requests. Only the first call takes effect.
    pub fn install_model(&self, model: DetectionModel) {
        if self.model.set(Arc::new(model)).is_err() {
            warn!("Detection model already installed, ignoring replacement");
        } else {
            info!("Detection model ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }

    /// Detect the ingredients in an uploaded image.
    ///
    /// An invalid image is the only error callers see once the service is
    /// running. `ModelNotLoaded` is limited to the startup window before
    /// `install_model`; it is not counted as an inference outcome. Any other
    /// failure is logged, counted and answered with an empty set.
    pub async fn predict(&self, image_data: Bytes) -> Result<IngredientSet, PredictError> {
        let model = self.model.get().cloned().ok_or(PredictError::ModelNotLoaded)?;

        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || run_pipeline(&model, &image_data))
            .await
            .map_err(PipelineError::from)
            .and_then(|result| result);

        self.settle(result, start.elapsed())
    }

    /// The single place where pipeline results become outcomes
    fn settle(
        &self,
        result: Result<IngredientSet, PipelineError>,
        elapsed: Duration,
    ) -> Result<IngredientSet, PredictError> {
        match result {
            Ok(ingredients) => {
                let duration_ms = elapsed.as_secs_f64() * 1000.0;
                debug!("Detected {} ingredients in {:.1}ms", ingredients.len(), duration_ms);
                self.telemetry.record_success(duration_ms, ingredients.len());
                Ok(ingredients)
            }
            Err(PipelineError::InvalidImage(e)) => {
                debug!("Rejected upload: {}", e);
                self.telemetry.record_error("invalid_image");
                Err(PredictError::InvalidImage(e))
            }
            Err(e) => {
                error!("Prediction failed ({}): {}", e.kind(), e);
                self.telemetry.record_error(e.kind());
                Ok(IngredientSet::new())
            }
        }
    }

    /// Get health status
    pub fn health(&self) -> HealthResult {
        let model = self.model.get();
        HealthResult {
            healthy: model.is_some(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: model.map(|m| m.backend_name().to_string()),
        }
    }
}

/// Decode, infer and reduce on the calling (blocking) thread
fn run_pipeline(model: &DetectionModel, image_data: &[u8]) -> Result<IngredientSet, PipelineError> {
    let image = decode_image(image_data, model.params().input_size)?;
    let detections = model.infer(&image).map_err(PipelineError::Inference)?;
    drop(image);

    Ok(reduce(&detections, model.class_names())?)
}
