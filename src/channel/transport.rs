//! Duplex text-frame transports.
//!
//! A [`Transport`] opens [`Connection`]s; each connection is a write half
//! ([`FrameSink`]) and a read half ([`FrameStream`]) that the channel
//! driver polls independently.
//!
//! - [`WebSocketTransport`] speaks WebSocket via `tokio-tungstenite`.
//! - [`MemoryTransport`] pairs with a [`MemoryAcceptor`] in the same
//!   process; the acceptor plays the server.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    /// The peer went away without an orderly close.
    #[error("connection lost")]
    Lost,

    #[error("no heartbeat reply within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Orderly close. Errors are not interesting at this point and are
    /// swallowed by implementations.
    async fn close(&mut self);
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame. `Ok(None)` is an orderly close by the peer; an
    /// abnormal end is an error.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
}

pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

// ═══════════════════════════════════════════════════════════════════════
// WebSocket
// ═══════════════════════════════════════════════════════════════════════

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client transport for `ws://` and `wss://` URLs.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok(Connection {
            sink: Box::new(WsSink { inner: sink }),
            stream: Box::new(WsFrames { inner: stream }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
        let _ = self.inner.close().await;
    }
}

struct WsFrames {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map(Some)
                        .map_err(|e| TransportError::Receive(e.to_string()));
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Protocol-level ping/pong is answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                None => return Err(TransportError::Lost),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-process
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum Frame {
    Text(String),
    Close,
}

/// In-process transport. Every successful `connect` hands a
/// [`MemoryPeer`] to the paired [`MemoryAcceptor`].
#[derive(Clone)]
pub struct MemoryTransport {
    incoming: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    connect_delay_ms: Arc<AtomicU64>,
}

pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: tx,
                refusing: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
                connect_delay_ms: Arc::new(AtomicU64::new(0)),
            },
            MemoryAcceptor { incoming: rx },
        )
    }

    /// While refusing, every `connect` fails as if the server were down.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Make every `connect` take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.incoming
            .send(MemoryPeer {
                tx: to_client,
                rx: from_client,
            })
            .map_err(|_| TransportError::Connect("acceptor is gone".to_string()))?;
        Ok(Connection {
            sink: Box::new(MemorySink { tx: to_server }),
            stream: Box::new(MemoryFrames { rx: from_server }),
        })
    }
}

impl MemoryAcceptor {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// Server end of one in-process connection. Dropping it without
/// [`close`](MemoryPeer::close) looks like a network failure to the client.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Send a frame to the client. Returns `false` once the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.tx.send(Frame::Text(frame.into())).is_ok()
    }

    /// Next frame from the client; `None` once it closed or vanished.
    pub async fn recv(&mut self) -> Option<String> {
        match self.rx.recv().await {
            Some(Frame::Text(text)) => Some(text),
            Some(Frame::Close) | None => None,
        }
    }

    /// Close the connection in an orderly way.
    pub fn close(self) {
        let _ = self.tx.send(Frame::Close);
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Text(frame))
            .map_err(|_| TransportError::Send("peer is gone".to_string()))
    }

    async fn close(&mut self) {
        let _ = self.tx.send(Frame::Close);
    }
}

struct MemoryFrames {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for MemoryFrames {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(Frame::Text(text)) => Ok(Some(text)),
            Some(Frame::Close) => Ok(None),
            None => Err(TransportError::Lost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (transport, mut acceptor) = MemoryTransport::pair();
        let mut conn = transport.connect().await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();

        conn.sink.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));
        assert!(peer.send("world"));
        assert_eq!(conn.stream.recv().await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_orderly_close_vs_drop() {
        let (transport, mut acceptor) = MemoryTransport::pair();

        let mut conn = transport.connect().await.unwrap();
        acceptor.accept().await.unwrap().close();
        assert_eq!(conn.stream.recv().await, Ok(None));

        let mut conn = transport.connect().await.unwrap();
        drop(acceptor.accept().await.unwrap());
        assert_eq!(conn.stream.recv().await, Err(TransportError::Lost));
    }

    #[tokio::test]
    async fn test_refusing() {
        let (transport, _acceptor) = MemoryTransport::pair();
        transport.set_refusing(true);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connect(_))
        ));
        assert_eq!(transport.connect_attempts(), 1);
    }
}
