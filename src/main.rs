// Noble Clarity Engine - financial coaching backend
// Main entry point

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use clarity_engine::config::load_config;
use clarity_engine::server::EngineServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = load_config()?;

    EngineServer::new(config)?.serve().await
}
