//! Standalone peer: accepts pools, answers registration and echo calls

use brivas_appconn::telemetry::{init_tracing, TelemetryConfig};
use brivas_appconn::{AppServer, ServerConfig, TaskRegistry};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("appconn-peer", &TelemetryConfig::from_env())?;

    let config = ServerConfig::from_env()?;
    let server = AppServer::bind(config, Arc::new(TaskRegistry::new())).await?;
    info!(address = %server.local_addr()?, version = brivas_appconn::VERSION, "Starting appconn peer");

    let runner = server.clone();
    let accept_loop = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await;
    accept_loop.await??;
    Ok(())
}
