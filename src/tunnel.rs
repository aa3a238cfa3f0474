use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_tungstenite::{
    WebSocketStream, client_async,
    tungstenite::{
        Error as TungsteniteError, Message,
        client::IntoClientRequest,
        error::ProtocolError,
        http::{HeaderValue, header::ORIGIN},
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, TargetConfig};
use crate::proxy;
use crate::stream::TransportStream;
use crate::tls::{TlsContext, build_tls_context};

pub const BUFFER_SIZE: usize = 8192;

/// Origin header sent with every WebSocket upgrade.
pub const WS_ORIGIN: &str = "http://localhost/";

/// Immutable per-process tunnel configuration, built once before the
/// listener starts and shared read-only between sessions.
pub struct TunnelConfig {
    /// Upstream WebSocket location; also the dial target for the proxy layer.
    pub location: Url,
    pub tls: Option<TlsContext>,
}

impl TunnelConfig {
    /// The presence of TLS settings decides the `ws`/`wss` scheme.
    pub fn from_config(config: &Config) -> Result<Self> {
        let tls = config
            .tls
            .as_ref()
            .map(|settings| build_tls_context(settings, &config.target.host))
            .transpose()?;
        let location = ws_location(&config.target, tls.is_some())?;
        Ok(Self { location, tls })
    }
}

fn ws_location(target: &TargetConfig, tls_enabled: bool) -> Result<Url> {
    let scheme = if tls_enabled { "wss" } else { "ws" };
    Url::parse(&format!("{scheme}://{}:{}", target.host, target.port))
        .with_context(|| format!("Invalid target {}:{}", target.host, target.port))
}

/// Establishes the upstream stream: proxied dial, optional TLS wrap, then
/// the WebSocket upgrade. Whatever was opened is dropped on failure.
pub async fn connect_upstream(config: &TunnelConfig) -> Result<WebSocketStream<TransportStream>> {
    let tcp = proxy::dial(&config.location)
        .await
        .with_context(|| format!("Failed to reach upstream {}", config.location))?;

    let transport = match &config.tls {
        Some(tls) => {
            let tls_stream = tls
                .connector
                .connect(tls.server_name.clone(), tcp)
                .await
                .context("TLS handshake with upstream failed")?;
            TransportStream::Tls(Box::new(tls_stream))
        }
        None => TransportStream::Plain(tcp),
    };

    let mut request = config
        .location
        .as_str()
        .into_client_request()
        .context("Failed to build WebSocket upgrade request")?;
    request
        .headers_mut()
        .insert(ORIGIN, HeaderValue::from_static(WS_ORIGIN));

    let (websocket, _response) = client_async(request, transport)
        .await
        .context("WebSocket upgrade with upstream failed")?;
    Ok(websocket)
}

#[tracing::instrument(skip(stream, config), fields(client_addr = %stream.peer_addr().map_or_else(|_| "unknown".to_string(), |addr| addr.to_string())))]
pub async fn handle_connection(stream: TcpStream, config: &TunnelConfig) -> Result<()> {
    let websocket = connect_upstream(config).await?;
    info!(location = %config.location, "Connected to upstream");

    relay(websocket, stream).await;
    info!("Tunnel session closed");
    Ok(())
}

/// Pumps bytes in both directions until both directions have ended, then
/// closes both connections. A failure on one direction never cuts off the
/// other direction's in-flight data: each pump half-closes the write side it
/// owns when its source ends, and the orchestrator always waits for both.
pub async fn relay(websocket: WebSocketStream<TransportStream>, local: TcpStream) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (mut local_reader, mut local_writer) = local.into_split();

    // Sized for exactly the two pump outcomes; the only synchronization
    // between the pumps and the orchestrator.
    let (done_tx, mut done_rx) = mpsc::channel::<(&'static str, Result<()>)>(2);

    let tx = done_tx.clone();
    tokio::spawn(async move {
        let result = pump_local_to_upstream(&mut local_reader, &mut ws_sender).await;
        // Signal end-of-output to the upstream while its own data keeps
        // draining through the other pump.
        if let Err(e) = ws_sender.close().await {
            debug!(error = %e, "Upstream write half-close failed");
        }
        let _ = tx.send(("local_to_upstream", result)).await;
    });

    tokio::spawn(async move {
        let result = pump_upstream_to_local(&mut ws_receiver, &mut local_writer).await;
        if let Err(e) = local_writer.shutdown().await {
            debug!(error = %e, "Local write half-close failed");
        }
        let _ = done_tx.send(("upstream_to_local", result)).await;
    });

    for _ in 0..2 {
        match done_rx.recv().await {
            Some((direction, Ok(()))) => debug!(direction, "Relay direction finished"),
            Some((direction, Err(e))) => error!(direction, error = %e, "Relay direction failed"),
            None => break,
        }
    }
    // Both pumps have reported; the halves they owned are gone with them,
    // so both connections are closed no matter how the directions ended.
}

async fn pump_local_to_upstream(
    reader: &mut OwnedReadHalf,
    sender: &mut SplitSink<WebSocketStream<TransportStream>, Message>,
) -> Result<()> {
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .context("Failed to read from local connection")?;
        if n == 0 {
            debug!("Local peer finished sending");
            return Ok(());
        }
        debug!(bytes = n, "Forwarding data from local to upstream");
        sender
            .send(Message::Binary(buffer[..n].to_vec().into()))
            .await
            .context("Failed to forward local data to upstream")?;
    }
}

async fn pump_upstream_to_local(
    receiver: &mut SplitStream<WebSocketStream<TransportStream>>,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                debug!(bytes = data.len(), "Forwarding data from upstream to local");
                writer
                    .write_all(&data)
                    .await
                    .context("Failed to write upstream data to local connection")?;
            }
            Ok(Message::Text(_)) => {
                warn!("Dropping text message (binary only)");
            }
            Ok(Message::Close(_)) => {
                debug!("Upstream finished sending");
                return Ok(());
            }
            Ok(_) => {}
            Err(
                TungsteniteError::ConnectionClosed
                | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            ) => {
                debug!("Upstream disconnected");
                return Ok(());
            }
            Err(e) => return Err(e).context("WebSocket error on upstream connection"),
        }
    }
    Ok(())
}
