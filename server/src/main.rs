use std::sync::Arc;

use anyhow::Context;
use fwd_ws::transport::HttpPartnerTransport;
use fwd_ws::{AppState, FwdConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = FwdConfig::load().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("fwd_ws={}", config.server.log_level))),
        )
        .init();

    // wss:// dials need a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let transport = HttpPartnerTransport::new(&config.partner)?;
    let app = AppState::start(&config, Arc::new(transport));
    app.controller
        .resume(config.relay.connect_on_start.clone())
        .await;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("🔀 WebSocket forwarder listening on {}", listener.local_addr()?);

    axum::serve(listener, fwd_ws::router(app)).await?;
    Ok(())
}
