use std::sync::Arc;

use anyhow::{Context, Result};
use beach_buoy::config::{Cli, ServerConfig};
use beach_buoy::rtc::RtcPeerFactory;
use beach_buoy::server::{self, AppConfig};
use beach_buoy::telemetry::Telemetry;
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        ws_path = %config.ws_path,
        ice_servers = ?config.session.rtc.ice_server_urls(),
        ping_interval_secs = config.session.ping_interval.as_secs(),
        "starting beach-buoy"
    );

    let factory = RtcPeerFactory::new().context("failed to build webrtc api")?;
    let router = server::router(
        AppConfig {
            ws_path: config.ws_path.clone(),
            session: config.session.clone(),
            document_root: config.document_root.clone(),
        },
        Arc::new(factory),
        telemetry.metrics_handle(),
    );

    let listener = server::bind(config.listen_addr).await?;
    info!("beach-buoy listening on {}", config.listen_addr);

    server::serve(listener, router, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
