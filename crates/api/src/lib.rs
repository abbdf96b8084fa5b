//! Waste Classification API Server
//!
//! REST front end for the inference engine: a status route and a multipart
//! image upload route that answers with the predicted waste category.

use axum::{extract::DefaultBodyLimit, extract::State, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

pub mod config;
mod routes;

pub use self::config::{LogFormat, Settings, SettingsError};
pub use routes::predict::PredictResponse;

use inference_engine::{InferenceEngine, ModelLoader};

/// Message served on `/`
pub const STATUS_MESSAGE: &str = "Waste Classification API is running";

/// Application state shared across handlers; immutable once built
pub struct AppState {
    /// Prediction engine (model may be absent)
    pub engine: InferenceEngine,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(engine: InferenceEngine) -> Self {
        Self {
            engine,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        }
    }
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub model_loaded: bool,
    pub model: Option<String>,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/predict", post(routes::predict::predict))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        message: STATUS_MESSAGE.to_string(),
    })
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let loaded = state.engine.is_loaded();
    Json(HealthResponse {
        status: if loaded { "healthy" } else { "degraded" }.to_string(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        model_loaded: loaded,
        model: state.engine.model_name().map(str::to_string),
    })
}

/// Initialize logging
pub fn init_logging(
    level: Level,
    format: LogFormat,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    match format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    }
}

/// Load the checkpoint once and build the shared state
pub async fn build_state(settings: &Settings) -> anyhow::Result<Arc<AppState>> {
    let labels = settings.class_labels()?;
    let model_path = settings.model_path.clone();

    let report =
        tokio::task::spawn_blocking(move || ModelLoader::default().load(&model_path)).await?;
    if !report.is_loaded() {
        warn!("Serving without a model; /predict will report errors");
    }

    Ok(Arc::new(AppState::new(InferenceEngine::from_report(
        report, labels,
    ))))
}

/// Run the server until ctrl-c
pub async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let addr = settings.socket_addr()?;
    let state = build_state(&settings).await?;
    let app = create_router(state, settings.max_upload_bytes);

    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
