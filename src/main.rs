use anyhow::Result;
use tracing::info;

use scriptdeck::{EngineConfig, ExecutionEngine};

#[tokio::main]
async fn main() -> Result<()> {
    scriptdeck::logging::init();

    let config = EngineConfig::load("scriptdeck.toml").await?;
    let engine = ExecutionEngine::new(config).await?;
    engine.scheduler().start().await;
    info!("scriptdeck daemon running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    engine.scheduler().stop().await;
    Ok(())
}
