//! Service layer types

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;

use crate::engine::{InvalidImage, ReduceError};

pub use crate::engine::IngredientSet;

/// Failure surfaced to callers of `predict`
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Invalid image file")]
    InvalidImage(#[source] InvalidImage),
    #[error("Service Unhealthy: Model not loaded")]
    ModelNotLoaded,
}

/// Failure inside one pipeline run, before it is mapped to an outcome
#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    #[error(transparent)]
    InvalidImage(#[from] InvalidImage),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error("inference worker failed: {0}")]
    Worker(#[from] JoinError),
}

impl PipelineError {
    /// Coarse label used to tag error telemetry
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidImage(_) => "invalid_image",
            PipelineError::Inference(_) => "inference_error",
            PipelineError::Reduce(ReduceError::UnknownClass { .. }) => "unknown_class",
            PipelineError::Worker(e) if e.is_panic() => "worker_panic",
            PipelineError::Worker(_) => "worker_cancelled",
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub version: String,
    pub backend: Option<String>,
}
