use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use websocket_tunnel::config::load_config;
use websocket_tunnel::tunnel::{TunnelConfig, handle_connection};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    let tunnel = Arc::new(TunnelConfig::from_config(&config)?);
    info!(
        config_file = "config.toml",
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        location = %tunnel.location,
        tls = tunnel.tls.is_some(),
        "Configuration loaded"
    );

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        listen_addr = %addr,
        "Tunnel client listening"
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let tunnel = Arc::clone(&tunnel);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &tunnel).await {
                        error!(client_addr = %peer, error = %e, "Session failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
