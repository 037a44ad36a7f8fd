//! Axum REST API handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    routing::{get, post},
    extract::{State, Multipart, DefaultBodyLimit},
    http::{HeaderValue, StatusCode},
    response::Json,
};
use bytes::Bytes;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::ServerConfig;
use crate::service::{IngredientService, PredictError};

use super::dto::*;

/// Multipart field carrying the uploaded image
const UPLOAD_FIELD: &str = "file";

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<IngredientService>,
    pub start_time: Instant,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    Router::new()
        .route("/predict", post(predict_handler))
        // Health endpoints
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(server.max_upload_bytes))
        .layer(cors_layer(&server.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the configured origins, with credentials
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            if origin == "*" {
                warn!("Ignoring wildcard CORS origin; credentials require explicit origins");
                return None;
            }
            HeaderValue::from_str(origin)
                .map_err(|e| warn!("Ignoring invalid CORS origin {:?}: {}", origin, e))
                .ok()
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Detect ingredients in an uploaded image
async fn predict_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    let mut image_data: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (e.status(), Json(ErrorResponse::new(&e.body_text(), "MULTIPART_ERROR")))
    })? {
        let name = field.name().unwrap_or("").to_string();

        if name == UPLOAD_FIELD {
            image_data = Some(field.bytes().await.map_err(|e| {
                (e.status(), Json(ErrorResponse::new(&e.body_text(), "READ_ERROR")))
            })?);
        }
    }

    let image_data = image_data.ok_or_else(|| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("Missing file field", "MISSING_FILE")))
    })?;

    let ingredients = state.service.predict(image_data).await.map_err(|e| match &e {
        PredictError::InvalidImage(_) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "INVALID_IMAGE")))
        }
        PredictError::ModelNotLoaded => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse::new(&e.to_string(), "MODEL_NOT_LOADED")))
        }
    })?;

    Ok(Json(DetectionResponse {
        ingredients: ingredients.into_vec(),
    }))
}

/// Health check
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let health = state.service.health();

    if !health.healthy {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("Service Unhealthy: Model not loaded", "MODEL_NOT_LOADED")),
        ));
    }

    Ok(Json(HealthResponse {
        status: "Healthy".to_string(),
        message: "AI Service is running!".to_string(),
        version: health.version,
        backend: health.backend.unwrap_or_default(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    }))
}
