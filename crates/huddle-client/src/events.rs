//! Engine events
//!
//! Everything observable about a session is published on an [`EventBus`].
//! Subscribers that fall behind lose the oldest events.

use huddle_protocol::{Attributes, PublishedStream};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::media::RemoteTrack;
use crate::state::{SessionState, StreamRef};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(SessionState),

    PeerConnected { peer_id: String },
    PeerUpdated { peer_id: String },
    /// The peer stays in the roster
    PeerRemoved { peer_id: String },

    /// A remote peer announced a stream we may subscribe to
    StreamAvailable { peer_id: String, stream: PublishedStream },
    StreamUnavailable { peer_id: String, stream_id: String },

    StreamPublished(StreamRef),
    StreamUnpublished(StreamRef),
    StreamSubscribed(StreamRef),
    StreamUnsubscribed(StreamRef),
    /// Remote media arrived for a subscribed stream
    MediaBound { stream_id: String, track: RemoteTrack },

    AudioMuted { stream_id: String, muted: bool },
    VideoMuted { stream_id: String, muted: bool },
    AttributesChanged { stream_id: String, attributes: Attributes },
    AudioLevel { stream_id: String, level: f32 },

    /// Track replacement failed; the previous track is back in place
    RenegotiationFailed { stream_id: String, error: String },

    Message(Value),

    /// Signaling link dropped; reconnecting in the background
    Reconnecting,
    /// Signaling link back and room rejoined
    Reconnected,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(EngineEvent::Reconnecting);

        assert!(matches!(a.recv().await.unwrap(), EngineEvent::Reconnecting));
        assert!(matches!(b.recv().await.unwrap(), EngineEvent::Reconnecting));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        bus.publish(EngineEvent::Message(Value::Null));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.publish(EngineEvent::Reconnected);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }
}
