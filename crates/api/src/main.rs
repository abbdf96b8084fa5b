//! Waste Classification API - Main Entry Point

use api::{init_logging, run_server, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_logging(settings.level()?, settings.log_format)?;

    info!("=== Waste Classification API v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Model checkpoint: {}", settings.model_path.display());

    run_server(settings).await
}
