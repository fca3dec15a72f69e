//! Streaming transport seam.
//!
//! [`WsConnector`] opens real sockets with tokio-tungstenite.
//! [`MemoryConnector`] is an in-process stand-in whose peer side is driven
//! by the caller, used by tests and offline demos.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};

/// Build the streaming URL: `base?token=<bearer>`.
pub fn stream_url(base: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// An open, receive-only streaming connection.
pub trait Transport: Send {
    /// Next text frame. `None` once the peer closed the connection.
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<String>>>;

    /// Close from our side.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Opens transports.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn Transport>>>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite connector with a connect timeout.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn Transport>>> {
        let timeout = self.connect_timeout;
        async move {
            let (stream, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| ClientError::Timeout(timeout))?
                .map_err(ClientError::from)?;
            Ok::<Box<dyn Transport>, ClientError>(Box::new(WsTransport { stream }))
        }
        .boxed()
    }
}

struct WsTransport {
    stream: WsStream,
}

impl Transport for WsTransport {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<String>>> {
        async move {
            loop {
                let Some(msg) = self.stream.next().await else {
                    return None;
                };
                match msg {
                    Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => return Some(Ok(text)),
                        Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        debug!(?frame, "server closed stream");
                        return None;
                    }
                    // Ping replies are queued by tungstenite and flushed on the next read.
                    Ok(_) => {}
                    Err(e) => return Some(Err(ClientError::from(e))),
                }
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            match self.stream.close(None).await {
                Ok(()) => Ok::<(), ClientError>(()),
                Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
                | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
                Err(e) => Err(ClientError::from(e)),
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

enum PeerMsg {
    Text(String),
    Close,
}

/// Server side of one in-memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    url: Url,
    tx: mpsc::UnboundedSender<PeerMsg>,
    closed_by_client: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Push a text frame to the client. Returns false if the client is gone.
    pub fn send_text(&self, frame: impl Into<String>) -> bool {
        self.tx.send(PeerMsg::Text(frame.into())).is_ok()
    }

    /// Simulate the server dropping the connection.
    pub fn disconnect(&self) {
        let _ = self.tx.send(PeerMsg::Close);
    }

    /// Whether the client side called `close`.
    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }

    /// Whether the client side has dropped its end.
    pub fn is_gone(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct MemoryInner {
    peers: Vec<MemoryPeer>,
    attempts: usize,
    failures_pending: u32,
    refuse_all: bool,
}

/// Connector that hands out in-memory transports.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut g) = self.inner.lock() {
            g.failures_pending = n;
        }
    }

    /// Refuse every connection attempt until called again with `false`.
    pub fn refuse_all(&self, refuse: bool) {
        if let Ok(mut g) = self.inner.lock() {
            g.refuse_all = refuse;
        }
    }

    /// Number of connect calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.inner.lock().map(|g| g.attempts).unwrap_or(0)
    }

    /// Number of connections successfully opened.
    pub fn connections(&self) -> usize {
        self.inner.lock().map(|g| g.peers.len()).unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<MemoryPeer> {
        self.inner.lock().map(|g| g.peers.clone()).unwrap_or_default()
    }

    pub fn latest_peer(&self) -> Option<MemoryPeer> {
        self.inner.lock().ok().and_then(|g| g.peers.last().cloned())
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn Transport>>> {
        let outcome = match self.inner.lock() {
            Ok(mut g) => {
                g.attempts += 1;
                if g.refuse_all || g.failures_pending > 0 {
                    g.failures_pending = g.failures_pending.saturating_sub(1);
                    Err(ClientError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "memory connector refused",
                    )))
                } else {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let closed_by_client = Arc::new(AtomicBool::new(false));
                    g.peers.push(MemoryPeer { url, tx, closed_by_client: Arc::clone(&closed_by_client) });
                    Ok(Box::new(MemoryTransport { rx, closed_by_client }) as Box<dyn Transport>)
                }
            }
            Err(_) => Err(ClientError::Io(std::io::Error::other("memory connector poisoned"))),
        };
        futures_util::future::ready(outcome).boxed()
    }
}

struct MemoryTransport {
    rx: mpsc::UnboundedReceiver<PeerMsg>,
    closed_by_client: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<Result<String>>> {
        async move {
            match self.rx.recv().await {
                Some(PeerMsg::Text(text)) => Some(Ok::<String, ClientError>(text)),
                Some(PeerMsg::Close) | None => None,
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.closed_by_client.store(true, Ordering::SeqCst);
        self.rx.close();
        futures_util::future::ready(Ok(())).boxed()
    }
}
