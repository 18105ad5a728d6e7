//! Signaling channel
//!
//! A duplex link to the signaling server carrying correlated commands,
//! fire-and-forget events, and server notifications. The channel owns the
//! reconnect policy: a link that never opened fails after the retry budget,
//! an established link that drops is reconnected silently, and a close with
//! the server's removal code is final.

mod backoff;
mod websocket;

pub use backoff::{RetryPolicy, RetryState};
pub use websocket::WsConnector;

use async_trait::async_trait;
use huddle_protocol::{
    ClientEvent, CommandKind, InboundFrame, OutboundFrame, REMOVED_BY_SERVER_CLOSE_CODE,
    ServerNotification,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};

use crate::error::{EngineError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One frame read from a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Text(String),
    /// The link ended, with the close code if the peer sent one
    Closed(Option<u16>),
}

/// An open duplex connection to the signaling server
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next inbound frame. Must be cancel-safe.
    async fn recv(&mut self) -> LinkFrame;

    async fn close(&mut self);
}

/// Opens connections to a signaling URL
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// Why the channel closed for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally
    Client,
    /// The server closed with the removal code
    RemovedByServer,
    /// Every attempt of the retry budget failed
    RetriesExhausted,
}

impl CloseReason {
    pub fn into_error(self) -> EngineError {
        match self {
            CloseReason::Client => EngineError::NotConnected,
            CloseReason::RemovedByServer => EngineError::TransportClosedByPeer,
            CloseReason::RetriesExhausted => {
                EngineError::TransportFailure("retry budget exhausted".to_string())
            }
        }
    }
}

/// Link lifecycle and inbound notifications
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connecting { attempt: u32 },
    /// First successful connection
    Open,
    Failed { attempt: u32 },
    /// An established link dropped; a silent reconnect follows
    Disconnected,
    /// Link re-established after `Disconnected`
    Reconnected,
    Notification(ServerNotification),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed(CloseReason),
}

/// Options for a signaling channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

type PendingRequest = (CommandKind, oneshot::Sender<Result<Value>>);

enum LinkEnd {
    ClientClosed,
    Removed,
    Dropped,
}

/// Handle to a signaling channel. Clones share the same link.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    options: ChannelOptions,
    connector: Arc<dyn Connector>,
    /// Present only while a link is open
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
    /// Lossless feeds handed out by `listen`
    listeners: std::sync::Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    link: watch::Sender<LinkState>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl SignalingChannel {
    pub fn new(options: ChannelOptions, connector: Arc<dyn Connector>) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link, _) = watch::channel(LinkState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(ChannelInner {
                options,
                connector,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                listeners: std::sync::Mutex::new(Vec::new()),
                link,
                shutdown,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to link events and notifications.
    /// Subscribe before `connect` to observe the first attempt.
    /// A receiver that falls behind loses the oldest events; use
    /// [`listen`](Self::listen) where every notification matters.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Ordered feed of every event from now on. Never lags.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn state(&self) -> LinkState {
        *self.inner.link.borrow()
    }

    /// Start the connection driver and wait until the first link opens
    pub async fn connect(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState(
                "signaling channel already started".to_string(),
            ));
        }

        let mut link = self.inner.link.subscribe();
        tokio::spawn(run(self.inner.clone()));

        let state = link
            .wait_for(|s| matches!(s, LinkState::Open | LinkState::Closed(_)))
            .await
            .map(|s| *s)
            .map_err(|_| EngineError::TransportFailure("signaling driver stopped".to_string()))?;

        match state {
            LinkState::Closed(reason) => Err(reason.into_error()),
            _ => Ok(()),
        }
    }

    /// Send a command and wait for its correlated response
    pub async fn request(&self, command: CommandKind, data: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = OutboundFrame::Command {
            id,
            event: command.as_str().to_string(),
            data,
        };
        let text = serde_json::to_string(&frame)?;
        let (tx, rx) = oneshot::channel();

        {
            let outbound = self.inner.outbound.lock().await;
            let Some(sender) = outbound.as_ref() else {
                return Err(EngineError::NotConnected);
            };
            self.inner.pending.lock().await.insert(id, (command, tx));
            if sender.send(text).is_err() {
                self.inner.pending.lock().await.remove(&id);
                return Err(EngineError::NotConnected);
            }
        }

        tracing::debug!("Sent command {} (id {})", command, id);

        match tokio::time::timeout(self.inner.options.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::TransportFailure(format!(
                "{} dropped before a response arrived",
                command
            ))),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                tracing::warn!("Command {} (id {}) timed out", command, id);
                Err(EngineError::Timeout(format!("{} response", command)))
            }
        }
    }

    /// Send a fire-and-forget event
    pub async fn emit(&self, event: ClientEvent, data: Value) -> Result<()> {
        let frame = OutboundFrame::Event {
            event: event.as_str().to_string(),
            data,
        };
        let text = serde_json::to_string(&frame)?;

        let outbound = self.inner.outbound.lock().await;
        let sender = outbound.as_ref().ok_or(EngineError::NotConnected)?;
        sender.send(text).map_err(|_| EngineError::NotConnected)
    }

    /// Close the channel permanently. Pending commands fail.
    pub async fn close(&self) {
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.finish(CloseReason::Client).await;
            return;
        }

        self.inner.shutdown.send_replace(true);
        let mut link = self.inner.link.subscribe();
        let _ = link.wait_for(|s| matches!(s, LinkState::Closed(_))).await;
    }
}

/// Connection driver: connects, retries, and reconnects until closed
async fn run(inner: Arc<ChannelInner>) {
    let mut retry = RetryState::default();
    let mut shutdown = inner.shutdown.subscribe();

    let reason = loop {
        if *shutdown.borrow() {
            break CloseReason::Client;
        }

        let attempt = retry.attempt + 1;
        inner.link.send_replace(if retry.ever_connected {
            LinkState::Reconnecting
        } else {
            LinkState::Connecting
        });
        inner.emit(ChannelEvent::Connecting { attempt });
        tracing::debug!("Connecting to signaling server, attempt {}", attempt);

        let connected = tokio::select! {
            result = inner.connector.connect(&inner.options.url) => Some(result),
            _ = closing(&mut shutdown) => None,
        };

        let Some(connected) = connected else {
            break CloseReason::Client;
        };

        match connected {
            Ok(connection) => {
                let reconnect = retry.ever_connected;
                retry.record_success();

                match inner.drive(connection, reconnect, &mut shutdown).await {
                    LinkEnd::ClientClosed => break CloseReason::Client,
                    LinkEnd::Removed => {
                        tracing::info!("Signaling connection closed by server, not retrying");
                        break CloseReason::RemovedByServer;
                    }
                    LinkEnd::Dropped => {
                        tracing::warn!("Signaling connection dropped, reconnecting");
                        inner.emit(ChannelEvent::Disconnected);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Signaling connect attempt {} failed: {}", attempt, e);
                inner.emit(ChannelEvent::Failed { attempt });

                let Some(delay) = retry.record_failure(&inner.options.retry) else {
                    tracing::error!("Signaling retry budget exhausted after {} attempts", attempt);
                    break CloseReason::RetriesExhausted;
                };

                let stopped = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = closing(&mut shutdown) => true,
                };
                if stopped {
                    break CloseReason::Client;
                }
            }
        }
    };

    inner.finish(reason).await;
}

/// Resolves once `close()` was requested
async fn closing(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

impl ChannelInner {
    fn emit(&self, event: ChannelEvent) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn drive(
        &self,
        mut connection: Box<dyn Connection>,
        reconnect: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock().await = Some(tx);
        self.link.send_replace(LinkState::Open);
        self.emit(if reconnect {
            ChannelEvent::Reconnected
        } else {
            ChannelEvent::Open
        });
        tracing::info!("Signaling connection open");

        let end = loop {
            tokio::select! {
                _ = closing(shutdown) => {
                    // Flush what was queued before the close
                    while let Ok(text) = rx.try_recv() {
                        if connection.send(text).await.is_err() {
                            break;
                        }
                    }
                    connection.close().await;
                    break LinkEnd::ClientClosed;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = connection.send(text).await {
                        tracing::error!("Failed to send signaling frame: {}", e);
                        break LinkEnd::Dropped;
                    }
                }
                frame = connection.recv() => match frame {
                    LinkFrame::Text(text) => self.handle_text(&text).await,
                    LinkFrame::Closed(Some(REMOVED_BY_SERVER_CLOSE_CODE)) => break LinkEnd::Removed,
                    LinkFrame::Closed(code) => {
                        tracing::debug!("Signaling link closed with code {:?}", code);
                        break LinkEnd::Dropped;
                    }
                },
            }
        };

        *self.outbound.lock().await = None;
        self.fail_pending(|| EngineError::TransportFailure("signaling link lost".to_string()))
            .await;
        end
    }

    async fn handle_text(&self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to parse signaling frame: {}", e);
                return;
            }
        };

        match frame {
            InboundFrame::Response { id, data } => {
                if let Some((_, tx)) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(Ok(data));
                } else {
                    tracing::debug!("Response for unknown command id {}", id);
                }
            }
            InboundFrame::Failure { id, error } => {
                if let Some((command, tx)) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(Err(EngineError::Rejected {
                        command: command.to_string(),
                        code: error.code,
                        message: error.message,
                    }));
                } else {
                    tracing::debug!("Error for unknown command id {}: {}", id, error.message);
                }
            }
            InboundFrame::Notification { event, data } => {
                match ServerNotification::decode(&event, data) {
                    Ok(notification) => self.emit(ChannelEvent::Notification(notification)),
                    Err(e) => tracing::warn!("Malformed {} notification: {}", event, e),
                }
            }
        }
    }

    async fn fail_pending(&self, error: impl Fn() -> EngineError) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (id, (command, tx)) in drained {
            tracing::debug!("Failing pending command {} (id {})", command, id);
            let _ = tx.send(Err(error()));
        }
    }

    async fn finish(&self, reason: CloseReason) {
        *self.outbound.lock().await = None;
        self.fail_pending(|| reason.into_error()).await;
        self.link.send_replace(LinkState::Closed(reason));
        self.emit(ChannelEvent::Closed(reason));
        tracing::info!("Signaling channel closed: {:?}", reason);
    }
}
