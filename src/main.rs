//! Food Ingredient Detection Service
//!
//! Detects food ingredients in uploaded images with a YOLO model running on
//! OpenVINO, served over a REST (Axum) API.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ingredient_service::api::rest::{create_rest_router, AppState};
use ingredient_service::config::Config;
use ingredient_service::engine::DetectionModel;
use ingredient_service::service::IngredientService;
use ingredient_service::telemetry::init_telemetry;

/// Endpoint tag attached to inference telemetry
const PREDICT_ENDPOINT: &str = "predict";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Ingredient Detection API v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match Config::load_optional(Config::default_path()) {
        Ok(Some(config)) => config,
        Ok(None) => {
            info!("No {} found, using default config", Config::default_path());
            Config::default()
        }
        Err(e) => {
            warn!("Ignoring {}: {:#}. Using default config", Config::default_path(), e);
            Config::default()
        }
    };
    config.apply_env().context("Invalid environment configuration")?;

    info!("Configuration loaded:");
    info!("  Port: {}", config.server.port);
    info!("  Allowed origins: {}", config.server.allowed_origins.join(", "));
    info!("  Model: {}", config.models.detector.display());
    info!("  Device: {}", config.inference.device);
    info!("  Inference image size: {}px", config.inference.image_size);
    info!(
        "  Confidence threshold: {}, max detections: {}",
        config.inference.confidence_threshold, config.inference.max_detections
    );

    let telemetry = init_telemetry(&config.telemetry, PREDICT_ENDPOINT)?;
    let service = Arc::new(IngredientService::new(telemetry));

    let app_state = Arc::new(AppState {
        service: service.clone(),
        start_time: Instant::now(),
    });
    let rest_router = create_rest_router(app_state, &config.server);

    // Serve health checks while the model loads
    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("REST API listening on http://{}", addr);

    let server = tokio::spawn(async move {
        axum::serve(listener, rest_router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // A missing model is fatal: there is no useful degraded mode
    let inference = config.inference.clone();
    let models = config.models.clone();
    let model = tokio::task::spawn_blocking(move || DetectionModel::load(&inference, &models))
        .await
        .context("Model loading task failed")?
        .map_err(|e| {
            error!("Failed to load detection model: {:#}", e);
            e
        })?;
    service.install_model(model);

    info!("Ingredient Detection API is ready!");
    info!("Health: http://localhost:{}/", config.server.port);

    server.await??;

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, cleaning up...");
}
