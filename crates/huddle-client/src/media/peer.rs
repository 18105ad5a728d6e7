//! Peer connection seam
//!
//! The negotiation engine drives peer connections through these traits.
//! [`super::rtc`] implements them with webrtc-rs.

use async_trait::async_trait;
use huddle_protocol::{IceServer, IceTransportPolicy, MediaKind};
use std::sync::Arc;
use webrtc::track::track_remote::TrackRemote;

use super::stream::MediaTrack;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

/// Handle to a sender attached to a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Receive intent for backends that express it as offer options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

/// A remote track delivered by a peer connection
#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Backend track to read RTP from; absent for synthetic tracks
    pub handle: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

pub type TrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_sender(&self, track: &MediaTrack) -> Result<SenderId>;

    async fn remove_sender(&self, sender: SenderId) -> Result<()>;

    /// Swap the track on an existing sender. Needs no renegotiation.
    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()>;

    /// Add a receive-only transceiver
    async fn add_receiver(&self, kind: MediaKind) -> Result<()>;

    async fn create_offer(&self, options: OfferOptions) -> Result<String>;

    /// Apply a local offer. Returns the SDP to send, which may differ from
    /// the input once candidates are gathered.
    async fn set_local_description(&self, sdp: &str) -> Result<String>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    /// Discard an applied local offer and return to stable
    async fn rollback(&self) -> Result<()>;

    /// Register the remote track callback. Replaces any earlier handler.
    fn on_track(&self, handler: TrackHandler);

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Resolves once the connection is closed
    async fn closed(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &PeerConfig) -> Result<Arc<dyn PeerConnection>>;
}
