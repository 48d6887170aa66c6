//! WebSocket Transport
//!
//! One socket per session, split into a receive half and a send half that
//! run as independent loops. Outbound frames go through an unbounded FIFO
//! queue ([`Outbox`]); the input throttler already bounds the rate.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClientConfig;
use crate::network::protocol::ClientRequest;

/// Connected socket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the socket, owned by the send loop.
pub type WsSink = SplitSink<WsStream, Message>;

/// Read half of the socket, owned by the receive loop.
pub type WsSource = SplitStream<WsStream>;

/// Text payload the server sends to ask for a polite close.
pub const CLOSE_REQUEST: &str = "close";

/// Transport errors. All of them are fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Backend URL cannot be turned into a socket URL.
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// TLS connector setup failed.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Handshake or I/O failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server closed the connection.
    #[error("Connection closed by server")]
    ClosedByServer,

    /// The transport already terminated.
    #[error("Transport closed")]
    Closed,

    /// Outbound request could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// OUTBOUND QUEUE
// =============================================================================

/// Item of the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Text frame, sent verbatim.
    Text(String),
    /// Close frame; the send loop stops after it.
    Close,
}

/// Receiving end of the outbound queue.
pub type OutboxReceiver = mpsc::UnboundedReceiver<Outgoing>;

/// Cloneable handle that enqueues frames for the send loop.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    /// Create a queue and its receiving end.
    pub fn channel() -> (Outbox, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { tx }, rx)
    }

    /// Enqueue a request wrapped in the namespace envelope.
    pub fn send(&self, request: &ClientRequest) -> Result<(), TransportError> {
        let frame = request.to_frame()?;
        debug!("Enqueue {}", request.kind());
        self.push(Outgoing::Text(frame))
    }

    /// Enqueue a verbatim text frame.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.push(Outgoing::Text(text.into()))
    }

    /// Enqueue a close frame.
    pub fn close(&self) -> Result<(), TransportError> {
        self.push(Outgoing::Close)
    }

    /// Whether the send loop has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, item: Outgoing) -> Result<(), TransportError> {
        self.tx.send(item).map_err(|_| TransportError::Closed)
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Socket URL for a backend base URL: `https` becomes `wss`, `http` becomes `ws`.
pub fn ws_url(config: &ClientConfig, token: &str) -> Result<Url, TransportError> {
    let base = config.socket_base();
    let mut url = Url::parse(base).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("token", token)
        .append_pair("type", "pong");
    Ok(url)
}

/// Open the session socket with the access token.
#[instrument(skip(config, token))]
pub async fn connect(config: &ClientConfig, token: &str) -> Result<(WsSink, WsSource), TransportError> {
    let url = ws_url(config, token)?;
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()?;

    let (ws, _response) = connect_async_tls_with_config(
        url.as_str(),
        None,
        false,
        Some(Connector::NativeTls(connector)),
    )
    .await?;

    info!("Connected to {}://{}{}", url.scheme(), url.host_str().unwrap_or_default(), url.path());
    Ok(ws.split())
}

// =============================================================================
// LOOPS
// =============================================================================

/// Forward inbound text frames until the connection ends.
///
/// Never returns `Ok` while the socket is alive: a close frame, a `"close"`
/// request, end of stream or a transport error all end the session.
pub async fn receive_loop(
    mut source: WsSource,
    outbox: Outbox,
    inbound: mpsc::UnboundedSender<String>,
) -> Result<(), TransportError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if text == CLOSE_REQUEST {
                    info!("Server requested close");
                    let _ = outbox.close();
                    return Err(TransportError::ClosedByServer);
                }
                if inbound.send(text).is_err() {
                    debug!("Inbound consumer gone");
                    return Err(TransportError::Closed);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                warn!("Server closed the connection: {:?}", frame);
                return Err(TransportError::ClosedByServer);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket receive error: {}", e);
                return Err(TransportError::WebSocket(e));
            }
            None => {
                warn!("WebSocket stream ended");
                return Err(TransportError::ClosedByServer);
            }
        }
    }
}

/// Drain the outbound queue in FIFO order.
///
/// Returns `Ok` after a close frame or once every [`Outbox`] is dropped.
pub async fn send_loop(mut sink: WsSink, mut outbound: OutboxReceiver) -> Result<(), TransportError> {
    while let Some(item) = outbound.recv().await {
        match item {
            Outgoing::Text(text) => sink.send(Message::Text(text)).await?,
            Outgoing::Close => {
                sink.send(Message::Close(None)).await?;
                debug!("Close frame sent");
                return Ok(());
            }
        }
    }
    Ok(())
}
