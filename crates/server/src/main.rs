use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rtcast_server::config::ServerConfig;
use rtcast_server::media::MediaSourceManager;
use rtcast_server::rtc::{DtlsContext, TransportConfig, TransportManager};
use rtcast_server::signaling::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = ServerConfig::load(&config_path).context("failed to load config")?;
    info!(?config, "starting rtcast");

    let dtls = Arc::new(DtlsContext::new().context("failed to initialize dtls")?);
    let sources = Arc::new(MediaSourceManager::new(config.enable_gop_cache));
    let transports = TransportManager::start(sources.clone());

    let state = AppState {
        sources: sources.clone(),
        transports: transports.clone(),
        dtls,
        transport_config: Arc::new(TransportConfig {
            ip: config.ip,
            announced_ip: config.announced_ip.clone(),
            min_port: config.webrtc_min_port,
            max_port: config.webrtc_max_port,
        }),
    };

    let addr = SocketAddr::new(config.ip, config.signaling_server_port);
    signaling::serve(state, addr, shutdown_signal())
        .await
        .context("signaling server failed")?;

    info!("shutting down");
    sources.stop_all();
    transports.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
