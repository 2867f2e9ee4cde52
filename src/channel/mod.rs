//! Resilient duplex message channel.
//!
//! [`ResilientChannel`] wraps a [`Transport`] and keeps a logical channel
//! alive across network failures:
//!
//! ```text
//!                 connect()
//!  Disconnected ────────────▶ Connecting ──ok──▶ Connected
//!       ▲                        │                  │
//!       │ disconnect() /         │ fail             │ abnormal drop /
//!       │ orderly remote close   ▼                  │ heartbeat timeout
//!       └──────────────────  Reconnecting ◀─────────┘
//!                                │
//!                                │ max_retries consecutive failures
//!                                ▼
//!                             Offline ──reconnect()──▶ Connecting
//! ```
//!
//! All socket I/O happens on one driver task per channel. Handles talk to
//! it through a command queue and a small shared state block guarded by a
//! `parking_lot` mutex that is never held across an `.await`.
//!
//! While no session is live, [`send`](ResilientChannel::send) parks
//! payloads in a bounded [`OutboundQueue`]; the queue is handed to the
//! next session, oldest first, before any newer payload. Payloads a dying
//! session accepted but never wrote go back to the head of the queue, so
//! delivery is at-least-once.

mod backoff;
mod queue;
mod transport;

pub use backoff::BackoffPolicy;
pub use queue::{OutboundQueue, QueueEntry};
pub use transport::{
    Connection, FrameSink, FrameStream, MemoryAcceptor, MemoryPeer, MemoryTransport, Transport,
    TransportError, WebSocketTransport,
};

use std::sync::Arc;
use std::time::Duration;

use ingest_relay_core::events::{SubscriberList, SubscriptionId};
use ingest_relay_core::models::ChannelState;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Heartbeat probe sent by the channel.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;
/// Heartbeat reply expected from the peer.
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
        }
    }
}

/// What [`ResilientChannel::send`] did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live session.
    Sent,
    /// Parked until the next session.
    Queued,
    /// Parked, and the oldest queued payload was evicted to make room.
    QueuedEvicting(String),
}

#[derive(Debug)]
enum Command {
    Connect,
    Reconnect,
    Disconnect(String),
}

struct Inner {
    state: ChannelState,
    queue: OutboundQueue,
    /// Feed of the live session, present only while `Connected`.
    live: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ChannelState>,
    state_subscribers: SubscriberList<ChannelState>,
    message_subscribers: SubscriberList<String>,
}

impl Shared {
    /// Record a new state and notify subscribers outside the lock.
    fn set_state(&self, state: ChannelState) {
        let changed = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.state, state) != state
        };
        if changed {
            self.announce(state);
        }
    }

    fn announce(&self, state: ChannelState) {
        info!(%state, "channel state changed");
        self.state_tx.send_replace(state);
        self.state_subscribers.dispatch(&state);
    }
}

/// Handle to a resilient channel. Cheap to clone; the driver task stops
/// when the last handle is dropped.
#[derive(Clone)]
pub struct ResilientChannel {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ResilientChannel {
    /// Create the channel and spawn its driver on the current tokio
    /// runtime. No connection is attempted until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, options: ChannelOptions) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ChannelState::Disconnected,
                queue: OutboundQueue::new(options.queue_capacity),
                live: None,
            }),
            state_tx,
            state_subscribers: SubscriberList::with_prefix("state"),
            message_subscribers: SubscriberList::with_prefix("message"),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: shared.clone(),
            transport,
            options,
            commands: rx,
        };
        tokio::spawn(driver.run());
        Self { shared, commands }
    }

    /// Start connecting. No-op while a connection is up or being retried.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Manual reconnect: resets the retry budget and connects again, also
    /// from `Offline`. A live session is replaced.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Close cleanly. No automatic reconnection follows.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Disconnect(reason.into()));
    }

    /// Send a payload, or queue it while no session is live. Never blocks.
    pub fn send(&self, payload: impl Into<String>) -> SendOutcome {
        let payload = payload.into();
        let mut inner = self.shared.inner.lock();
        let payload = match &inner.live {
            Some(tx) => match tx.send(payload) {
                Ok(()) => return SendOutcome::Sent,
                Err(mpsc::error::SendError(payload)) => payload,
            },
            None => payload,
        };
        match inner.queue.push(payload) {
            None => SendOutcome::Queued,
            Some(evicted) => {
                debug!("outbound queue full; dropped oldest payload");
                SendOutcome::QueuedEvicting(evicted.payload)
            }
        }
    }

    pub fn on_state_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChannelState) + Send + Sync + 'static,
    {
        self.shared.state_subscribers.subscribe(callback)
    }

    /// Subscribe to inbound frames. Heartbeat replies are not delivered.
    pub fn on_message<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.shared.message_subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.shared.state_subscribers.unsubscribe(id) || self.shared.message_subscribers.unsubscribe(id)
    }

    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().state
    }

    /// Number of payloads waiting for a session.
    pub fn queued(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Payloads evicted by the queue bound so far.
    pub fn dropped(&self) -> u64 {
        self.shared.inner.lock().queue.dropped()
    }

    /// A receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the channel reaches `target`.
    pub async fn wait_for(&self, target: ChannelState) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|s| *s == target).await;
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════

/// How a live session ended.
enum SessionEnd {
    /// `disconnect()` was called.
    Closed(String),
    /// The peer closed in an orderly way.
    RemoteClosed,
    /// Transport error or heartbeat timeout.
    Failed(TransportError),
    /// `reconnect()` was called while connected.
    Restart,
    /// Every handle is gone.
    Shutdown,
}

/// What to do after the backoff wait.
enum RetryDecision {
    Retry,
    /// Manual reconnect during the wait; the retry budget starts over.
    RetryFresh,
    Stop,
    Shutdown,
}

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            // Idle until asked to connect.
            match self.commands.recv().await {
                None => return,
                Some(Command::Connect) | Some(Command::Reconnect) => {}
                Some(Command::Disconnect(_)) => continue,
            }
            self.shared.set_state(ChannelState::Connecting);
            if self.connect_loop().await {
                return;
            }
        }
    }

    /// Keep a session up until a clean stop. Returns `true` on shutdown.
    async fn connect_loop(&mut self) -> bool {
        let mut failures: u32 = 0;
        loop {
            let transport = self.transport.clone();
            let attempt = transport.connect();
            tokio::pin!(attempt);
            // A repeated connect() waits on the attempt already in flight;
            // reconnect() abandons it and starts a fresh one.
            let connected = loop {
                tokio::select! {
                    result = &mut attempt => break Some(result),
                    cmd = self.commands.recv() => match cmd {
                        None => return true,
                        Some(Command::Disconnect(reason)) => {
                            info!(%reason, "disconnect requested while connecting");
                            self.shared.set_state(ChannelState::Disconnected);
                            return false;
                        }
                        Some(Command::Reconnect) => {
                            failures = 0;
                            break None;
                        }
                        Some(Command::Connect) => {}
                    },
                }
            };
            let Some(result) = connected else {
                continue;
            };

            let err = match result {
                Ok(conn) => {
                    failures = 0;
                    match self.session(conn).await {
                        SessionEnd::Shutdown => return true,
                        SessionEnd::Closed(reason) => {
                            info!(%reason, "channel closed");
                            self.shared.set_state(ChannelState::Disconnected);
                            return false;
                        }
                        SessionEnd::RemoteClosed => {
                            info!("peer closed the channel");
                            self.shared.set_state(ChannelState::Disconnected);
                            return false;
                        }
                        SessionEnd::Restart => {
                            self.shared.set_state(ChannelState::Connecting);
                            continue;
                        }
                        SessionEnd::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };

            failures += 1;
            warn!(error = %err, failures, "channel connection failed");
            if self.options.backoff.exhausted(failures) {
                warn!(failures, "retry budget spent; channel offline");
                self.shared.set_state(ChannelState::Offline);
                return false;
            }
            self.shared.set_state(ChannelState::Reconnecting);
            match self.wait_before_retry(failures).await {
                RetryDecision::Retry => {}
                RetryDecision::RetryFresh => failures = 0,
                RetryDecision::Stop => return false,
                RetryDecision::Shutdown => return true,
            }
        }
    }

    async fn wait_before_retry(&mut self, attempt: u32) -> RetryDecision {
        let delay = self.options.backoff.delay_for(attempt);
        debug!(?delay, attempt, "waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return RetryDecision::Retry,
                cmd = self.commands.recv() => match cmd {
                    None => return RetryDecision::Shutdown,
                    Some(Command::Disconnect(reason)) => {
                        info!(%reason, "disconnect requested while reconnecting");
                        self.shared.set_state(ChannelState::Disconnected);
                        return RetryDecision::Stop;
                    }
                    Some(Command::Reconnect) => {
                        self.shared.set_state(ChannelState::Connecting);
                        return RetryDecision::RetryFresh;
                    }
                    Some(Command::Connect) => {}
                },
            }
        }
    }

    async fn session(&mut self, conn: Connection) -> SessionEnd {
        let Connection {
            mut sink,
            mut stream,
        } = conn;
        let (tx, mut outbound) = mpsc::unbounded_channel::<String>();

        // Flush the backlog and go live in one step so that every later
        // send() lands behind it.
        let backlog = {
            let mut inner = self.shared.inner.lock();
            let backlog = inner.queue.drain();
            for entry in &backlog {
                let _ = tx.send(entry.payload.clone());
            }
            inner.live = Some(tx);
            inner.state = ChannelState::Connected;
            backlog.len()
        };
        self.shared.announce(ChannelState::Connected);
        if backlog > 0 {
            info!(backlog, "flushing queued payloads");
        }

        let interval = self.options.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_sent: Option<Instant> = None;
        let mut unsent: Option<String> = None;

        let end = loop {
            let deadline = ping_sent.map(|t| t + self.options.heartbeat_timeout);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None => {
                        sink.close().await;
                        break SessionEnd::Shutdown;
                    }
                    Some(Command::Disconnect(reason)) => {
                        sink.close().await;
                        break SessionEnd::Closed(reason);
                    }
                    Some(Command::Reconnect) => {
                        sink.close().await;
                        break SessionEnd::Restart;
                    }
                    Some(Command::Connect) => {}
                },
                Some(payload) = outbound.recv() => {
                    if let Err(err) = sink.send(payload.clone()).await {
                        unsent = Some(payload);
                        break SessionEnd::Failed(err);
                    }
                }
                frame = stream.recv() => match frame {
                    Ok(Some(text)) => {
                        ping_sent = None;
                        if !is_pong(&text) {
                            self.shared.message_subscribers.dispatch(&text);
                        }
                    }
                    Ok(None) => break SessionEnd::RemoteClosed,
                    Err(err) => break SessionEnd::Failed(err),
                },
                _ = heartbeat.tick() => {
                    if ping_sent.is_none() {
                        if let Err(err) = sink.send(PING_FRAME.to_string()).await {
                            break SessionEnd::Failed(err);
                        }
                        ping_sent = Some(Instant::now());
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    break SessionEnd::Failed(TransportError::HeartbeatTimeout(self.options.heartbeat_timeout));
                }
            }
        };

        // Go dark first, then collect whatever the session never wrote.
        let mut inner = self.shared.inner.lock();
        inner.live = None;
        let mut pending: Vec<String> = unsent.into_iter().collect();
        while let Ok(payload) = outbound.try_recv() {
            pending.push(payload);
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "requeueing unsent payloads");
            inner.queue.requeue_front(pending);
        }
        end
    }
}

fn is_pong(frame: &str) -> bool {
    frame.contains("pong")
        && serde_json::from_str::<serde_json::Value>(frame)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "pong"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_pong() {
        assert!(is_pong(PONG_FRAME));
        assert!(is_pong(r#"{ "type" : "pong", "ts": 1 }"#));
        assert!(!is_pong(r#"{"type":"status","message":"pong"}"#));
        assert!(!is_pong("pong"));
    }

    #[tokio::test]
    async fn test_send_queues_while_disconnected() {
        let (transport, _acceptor) = MemoryTransport::pair();
        let channel = ResilientChannel::new(Arc::new(transport), ChannelOptions::default());
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(channel.send("a"), SendOutcome::Queued);
        assert_eq!(channel.send("b"), SendOutcome::Queued);
        assert_eq!(channel.queued(), 2);
    }

    #[tokio::test]
    async fn test_queue_bound_evicts_oldest() {
        let (transport, _acceptor) = MemoryTransport::pair();
        let options = ChannelOptions {
            queue_capacity: 2,
            ..Default::default()
        };
        let channel = ResilientChannel::new(Arc::new(transport), options);
        channel.send("1");
        channel.send("2");
        assert_eq!(channel.send("3"), SendOutcome::QueuedEvicting("1".to_string()));
        assert_eq!(channel.queued(), 2);
        assert_eq!(channel.dropped(), 1);
    }
}
