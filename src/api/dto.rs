//! REST API request/response data transfer objects

use serde::{Deserialize, Serialize};

/// Predict response
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub ingredients: Vec<String>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub version: String,
    pub backend: String,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(detail: &str, code: &str) -> Self {
        Self {
            detail: detail.to_string(),
            code: code.to_string(),
        }
    }
}
