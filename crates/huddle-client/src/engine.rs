//! Session engine
//!
//! The public entry point: joins a room over the signaling channel, keeps
//! the roster current from server notifications, and runs publish and
//! subscribe negotiations. Operations on the same stream are serialized;
//! operations on different streams run concurrently.

use futures_util::future::join_all;
use huddle_protocol::{
    Attributes, AttributesUpdate, ClientEvent, CommandKind, Configure, JoinRequest, JoinResponse,
    MediaKind, PeerInfo, ServerNotification,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

use crate::capabilities::PlatformCapabilities;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::media::{
    LocalStream, MediaDevices, MediaTrack, PeerConfig, PeerConnectionFactory, RemoteTrack,
    TrackHandler,
};
use crate::negotiation::{NegotiationEngine, PublishedMedia, SubscribedMedia};
use crate::queue::SerializerMap;
use crate::signaling::{
    ChannelEvent, ChannelOptions, CloseReason, Connector, SignalingChannel, WsConnector,
};
use crate::state::{RoomSession, Session, SessionState, StreamDirection, StreamRef};
use crate::token;

/// Handle to a room session. Clones share the same session.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

/// Signaling resources created by `join`
struct Link {
    channel: SignalingChannel,
    negotiation: Arc<NegotiationEngine>,
    join: JoinRequest,
}

struct EngineInner {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    peers: Arc<dyn PeerConnectionFactory>,
    capabilities: PlatformCapabilities,
    session: RwLock<Session>,
    room: RwLock<RoomSession>,
    link: RwLock<Option<Link>>,
    published: Mutex<HashMap<String, PublishedMedia>>,
    /// Keyed by publisher stream id
    subscribed: Mutex<HashMap<String, SubscribedMedia>>,
    /// Remote tracks that arrived before their subscription committed.
    /// Locked only while `room` is write-locked.
    unbound: std::sync::Mutex<HashMap<String, Vec<RemoteTrack>>>,
    serializers: SerializerMap<String>,
    events: EventBus,
}

fn publish_key(stream_id: &str) -> String {
    format!("publish:{}", stream_id)
}

fn subscribe_key(stream_id: &str) -> String {
    format!("subscribe:{}", stream_id)
}

/// The server authenticates the link by its `token` query parameter
fn signaling_url(base: &str, token: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", base, separator, token)
}

impl SessionEngine {
    /// Engine connecting over WebSocket
    pub fn new(
        config: EngineConfig,
        peers: Arc<dyn PeerConnectionFactory>,
        capabilities: PlatformCapabilities,
    ) -> Self {
        Self::with_connector(config, Arc::new(WsConnector), peers, capabilities)
    }

    pub fn with_connector(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        peers: Arc<dyn PeerConnectionFactory>,
        capabilities: PlatformCapabilities,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                connector,
                peers,
                capabilities,
                session: RwLock::new(Session::default()),
                room: RwLock::new(RoomSession::default()),
                link: RwLock::new(None),
                published: Mutex::new(HashMap::new()),
                subscribed: Mutex::new(HashMap::new()),
                unbound: std::sync::Mutex::new(HashMap::new()),
                serializers: SerializerMap::new(),
                events: EventBus::new(),
            }),
        }
    }

    /// Join the room named in `token`.
    ///
    /// Resolves once the server has answered `join`. On failure the engine
    /// ends up `Disconnected` and cannot be reused.
    pub async fn join(&self, token: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.session.read().await.state != SessionState::New {
            return Err(EngineError::InvalidState("join requires a new engine".to_string()));
        }

        let claims = token::decode_claims(token)?;
        let url = inner
            .config
            .signaling_url
            .clone()
            .or_else(|| claims.signaling_url.clone())
            .ok_or_else(|| {
                EngineError::InvalidArgument("no signaling url in config or token".to_string())
            })?;

        {
            let mut session = inner.session.write().await;
            if session.state != SessionState::New {
                return Err(EngineError::InvalidState("join requires a new engine".to_string()));
            }
            session.transition(SessionState::Connecting)?;
            session.local_user_id = Some(claims.user.clone());
            session.room = Some(claims.room.clone());
            session.ice_servers = if inner.config.ice_servers.is_empty() {
                claims.ice_servers.clone()
            } else {
                inner.config.ice_servers.clone()
            };
            session.ice_transport_policy = inner
                .config
                .ice_transport_policy
                .unwrap_or(claims.ice_transport_policy);
        }
        inner
            .events
            .publish(EngineEvent::StateChanged(SessionState::Connecting));
        *inner.room.write().await = RoomSession::new(&claims.user, &claims.room);

        let channel = SignalingChannel::new(
            ChannelOptions {
                url: signaling_url(&url, token),
                retry: inner.config.retry,
                request_timeout: inner.config.request_timeout(),
            },
            inner.connector.clone(),
        );
        let channel_events = channel.listen();
        let negotiation = Arc::new(NegotiationEngine::new(
            Arc::new(channel.clone()),
            inner.peers.clone(),
            inner.capabilities,
        ));
        let join = JoinRequest {
            appkey: claims.appkey.clone(),
            room: claims.room.clone(),
            user: claims.user.clone(),
            token: token.to_string(),
            planb: inner.capabilities.plan_b(),
            sdp: None,
        };
        *inner.link.write().await = Some(Link {
            channel: channel.clone(),
            negotiation,
            join: join.clone(),
        });
        tokio::spawn(watch_channel(Arc::downgrade(inner), channel_events));

        tracing::info!("Joining room {} as {}", claims.room, claims.user);

        let joined = async {
            channel.connect().await?;
            let response = channel
                .request(CommandKind::Join, serde_json::to_value(&join)?)
                .await?;
            Ok::<JoinResponse, EngineError>(serde_json::from_value(response)?)
        }
        .await;

        let response = match joined {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Failed to join room {}: {}", claims.room, e);
                inner.shutdown().await;
                return Err(e);
            }
        };

        let remote: Vec<PeerInfo> = response
            .room
            .peers
            .iter()
            .filter(|peer| peer.peer_id != claims.user)
            .cloned()
            .collect();
        inner.room.write().await.merge_roster(response.room);

        if inner.set_state(SessionState::Connected).await.is_err() {
            return Err(EngineError::NotConnected);
        }
        tracing::info!("Joined room {} with {} other peer(s)", claims.room, remote.len());

        for peer in remote {
            inner.events.publish(EngineEvent::PeerConnected {
                peer_id: peer.peer_id.clone(),
            });
            for stream in peer.streams {
                inner.events.publish(EngineEvent::StreamAvailable {
                    peer_id: peer.peer_id.clone(),
                    stream,
                });
            }
        }

        Ok(())
    }

    /// Leave the room and release every stream. Idempotent.
    pub async fn leave(&self) -> Result<()> {
        let state = self.state().await;
        if state == SessionState::Disconnected {
            return Ok(());
        }

        if state == SessionState::Connected {
            if let Some(channel) = self.inner.channel().await {
                if let Err(e) = channel.request(CommandKind::Leave, Value::Object(Default::default())).await {
                    tracing::warn!("Leave was not acknowledged: {}", e);
                }
            }
        }

        self.inner.shutdown().await;
        tracing::info!("Left room {}", self.inner.room.read().await.room());
        Ok(())
    }

    /// Publish a local stream. Publishing an already published stream id
    /// returns the existing ref.
    pub async fn publish(&self, stream: LocalStream) -> Result<StreamRef> {
        self.inner.ensure_connected().await?;
        let key = publish_key(&stream.stream_id);
        self.inner
            .serializers
            .enqueue(key, self.inner.publish_serialized(stream))
            .await
    }

    /// Stop publishing. Unknown stream ids are a no-op.
    pub async fn unpublish(&self, stream_id: &str) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner
            .serializers
            .enqueue(publish_key(stream_id), self.inner.unpublish_serialized(stream_id))
            .await
    }

    /// Subscribe to a remote stream. Concurrent or repeated calls for the
    /// same stream yield one subscription.
    pub async fn subscribe(&self, stream_id: &str) -> Result<StreamRef> {
        self.inner.ensure_connected().await?;
        if stream_id.is_empty() {
            return Err(EngineError::InvalidArgument("stream id is empty".to_string()));
        }
        self.inner
            .serializers
            .enqueue(subscribe_key(stream_id), self.inner.subscribe_serialized(stream_id))
            .await
    }

    /// Drop a subscription. Unknown stream ids are a no-op.
    pub async fn unsubscribe(&self, stream_id: &str) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner
            .serializers
            .enqueue(subscribe_key(stream_id), self.inner.unsubscribe_serialized(stream_id))
            .await
    }

    /// Replace the track of `track.kind` on a published stream
    pub async fn replace_track(&self, stream_id: &str, track: MediaTrack) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner
            .serializers
            .enqueue(
                publish_key(stream_id),
                self.inner.replace_track_serialized(stream_id, track),
            )
            .await
    }

    /// Capture from another input device and swap it into a published stream
    pub async fn switch_device(
        &self,
        devices: &MediaDevices,
        stream_id: &str,
        kind: MediaKind,
        device: Option<String>,
    ) -> Result<()> {
        self.inner.ensure_connected().await?;
        let track = devices.acquire_track(kind, device).await?;
        self.replace_track(stream_id, track).await
    }

    pub async fn mute_audio(&self, stream_id: &str, muted: bool) -> Result<()> {
        self.inner.set_muted(stream_id, MediaKind::Audio, muted).await
    }

    pub async fn mute_video(&self, stream_id: &str, muted: bool) -> Result<()> {
        self.inner.set_muted(stream_id, MediaKind::Video, muted).await
    }

    /// Replace the attributes of a published stream and tell the room
    pub async fn set_attributes(&self, stream_id: &str, attributes: Attributes) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_connected().await?;

        {
            let mut room = inner.room.write().await;
            if room.local_stream(stream_id).is_none() {
                return Err(EngineError::InvalidArgument(format!(
                    "stream {} is not published",
                    stream_id
                )));
            }
            room.update_attributes(stream_id, &attributes);
        }

        let update = AttributesUpdate {
            stream_id: stream_id.to_string(),
            attributes,
        };
        inner
            .emit(ClientEvent::Attributes, serde_json::to_value(update)?)
            .await
    }

    /// Broadcast an application message to the room
    pub async fn send_message(&self, data: Value) -> Result<()> {
        self.inner.ensure_connected().await?;
        self.inner.emit(ClientEvent::Message, data).await
    }

    pub async fn state(&self) -> SessionState {
        self.inner.session.read().await.state
    }

    pub async fn session(&self) -> Session {
        self.inner.session.read().await.clone()
    }

    /// Every peer seen since joining, including removed ones
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner.room.read().await.peers()
    }

    pub async fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.inner.room.read().await.peer(peer_id).cloned()
    }

    pub async fn peer_for_stream(&self, stream_id: &str) -> Option<String> {
        self.inner
            .room
            .read()
            .await
            .peer_for_stream(stream_id)
            .map(str::to_string)
    }

    pub async fn streams(&self) -> Vec<StreamRef> {
        self.inner.room.read().await.streams_snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.inner.capabilities
    }
}

impl EngineInner {
    async fn set_state(&self, next: SessionState) -> Result<bool> {
        let changed = self.session.write().await.transition(next)?;
        if changed {
            tracing::info!("Session {}", next);
            self.events.publish(EngineEvent::StateChanged(next));
        }
        Ok(changed)
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.session.read().await.state != SessionState::Connected {
            return Err(EngineError::NotConnected);
        }
        Ok(())
    }

    async fn channel(&self) -> Option<SignalingChannel> {
        self.link.read().await.as_ref().map(|link| link.channel.clone())
    }

    async fn emit(&self, event: ClientEvent, data: Value) -> Result<()> {
        let channel = self.channel().await.ok_or(EngineError::NotConnected)?;
        channel.emit(event, data).await
    }

    async fn negotiation(&self) -> Result<(Arc<NegotiationEngine>, PeerConfig)> {
        let negotiation = self
            .link
            .read()
            .await
            .as_ref()
            .map(|link| link.negotiation.clone())
            .ok_or(EngineError::NotConnected)?;

        let session = self.session.read().await;
        let config = PeerConfig {
            ice_servers: session.ice_servers.clone(),
            ice_transport_policy: session.ice_transport_policy,
        };
        Ok((negotiation, config))
    }

    async fn publish_serialized(&self, stream: LocalStream) -> Result<StreamRef> {
        self.ensure_connected().await?;

        let local_peer_id = {
            let room = self.room.read().await;
            if let Some(existing) = room.local_stream(&stream.stream_id) {
                tracing::debug!("Stream {} already published", stream.stream_id);
                return Ok(existing.clone());
            }
            room.local_peer_id().to_string()
        };

        let (negotiation, config) = self.negotiation().await?;
        let media = negotiation.publish(&stream, &config).await?;
        let stream_ref = StreamRef::local(&stream.stream_id, local_peer_id, stream.attributes.clone());

        // Holding the session lock keeps shutdown from draining before we insert
        let session = self.session.read().await;
        if session.state != SessionState::Connected {
            drop(session);
            if let Err(e) = media.peer().close().await {
                tracing::debug!("Error closing peer connection: {}", e);
            }
            return Err(EngineError::NotConnected);
        }
        self.published
            .lock()
            .await
            .insert(stream.stream_id.clone(), media);
        self.room.write().await.insert_stream(stream_ref.clone());
        drop(session);

        self.events
            .publish(EngineEvent::StreamPublished(stream_ref.clone()));
        Ok(stream_ref)
    }

    async fn unpublish_serialized(&self, stream_id: &str) -> Result<()> {
        let Some(media) = self.published.lock().await.remove(stream_id) else {
            tracing::debug!("Stream {} is not published", stream_id);
            return Ok(());
        };

        let result = match self.negotiation().await {
            Ok((negotiation, _)) => negotiation.unpublish(media).await,
            Err(e) => {
                let _ = media.peer().close().await;
                Err(e)
            }
        };

        let removed = {
            let mut room = self.room.write().await;
            let owner = room.local_peer_id().to_string();
            room.remove_stream(&owner, stream_id)
        };
        if let Some(stream_ref) = removed {
            self.events.publish(EngineEvent::StreamUnpublished(stream_ref));
        }
        result
    }

    async fn subscribe_serialized(self: &Arc<Self>, stream_id: &str) -> Result<StreamRef> {
        self.ensure_connected().await?;

        let (owner, roster_attributes) = {
            let room = self.room.read().await;
            if let Some(existing) = room.remote_stream(stream_id) {
                tracing::debug!("Already subscribed to {}", stream_id);
                return Ok(existing.clone());
            }
            let owner = room.peer_for_stream(stream_id).ok_or_else(|| {
                EngineError::InvalidArgument(format!("unknown stream {}", stream_id))
            })?;
            if owner == room.local_peer_id() {
                return Err(EngineError::InvalidArgument(format!(
                    "stream {} is our own",
                    stream_id
                )));
            }
            (
                owner.to_string(),
                room.published_attributes(stream_id).cloned().unwrap_or_default(),
            )
        };

        let (negotiation, config) = self.negotiation().await?;
        let handler = self.track_handler(stream_id);
        let media = match negotiation.subscribe(stream_id, &config, handler).await {
            Ok(media) => media,
            Err(e) => {
                let _room = self.room.write().await;
                self.unbound_tracks().remove(stream_id);
                return Err(e);
            }
        };

        let attributes = if media.attributes.is_empty() {
            roster_attributes
        } else {
            media.attributes.clone()
        };
        let mut stream_ref = StreamRef::remote(
            stream_id,
            owner,
            attributes,
            media.subscriber_stream_id.clone(),
        );

        let session = self.session.read().await;
        if session.state != SessionState::Connected {
            drop(session);
            if let Err(e) = media.peer().close().await {
                tracing::debug!("Error closing peer connection: {}", e);
            }
            return Err(EngineError::NotConnected);
        }
        self.subscribed
            .lock()
            .await
            .insert(stream_id.to_string(), media);
        let early_tracks = {
            let mut room = self.room.write().await;
            let early_tracks = self.unbound_tracks().remove(stream_id).unwrap_or_default();
            stream_ref.media_bound = !early_tracks.is_empty();
            room.insert_stream(stream_ref.clone());
            early_tracks
        };
        drop(session);

        self.events
            .publish(EngineEvent::StreamSubscribed(stream_ref.clone()));
        for track in early_tracks {
            self.events.publish(EngineEvent::MediaBound {
                stream_id: stream_id.to_string(),
                track,
            });
        }
        Ok(stream_ref)
    }

    async fn unsubscribe_serialized(&self, stream_id: &str) -> Result<()> {
        let Some(media) = self.subscribed.lock().await.remove(stream_id) else {
            tracing::debug!("Not subscribed to {}", stream_id);
            return Ok(());
        };

        let result = match self.negotiation().await {
            Ok((negotiation, _)) => negotiation.unsubscribe(media).await,
            Err(e) => {
                let _ = media.peer().close().await;
                Err(e)
            }
        };

        self.remove_remote_ref(stream_id).await;
        result
    }

    async fn replace_track_serialized(&self, stream_id: &str, track: MediaTrack) -> Result<()> {
        let Some(mut media) = self.published.lock().await.remove(stream_id) else {
            return Err(EngineError::InvalidArgument(format!(
                "stream {} is not published",
                stream_id
            )));
        };

        let result = match self.negotiation().await {
            Ok((negotiation, _)) => negotiation.renegotiate(&mut media, track).await,
            Err(e) => Err(e),
        };

        let session = self.session.read().await;
        if session.state == SessionState::Connected {
            self.published
                .lock()
                .await
                .insert(stream_id.to_string(), media);
        } else if let Err(e) = media.peer().close().await {
            tracing::debug!("Error closing peer connection: {}", e);
        }
        drop(session);

        if let Err(e) = &result {
            self.events.publish(EngineEvent::RenegotiationFailed {
                stream_id: stream_id.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn set_muted(&self, stream_id: &str, kind: MediaKind, muted: bool) -> Result<()> {
        self.ensure_connected().await?;

        {
            let mut room = self.room.write().await;
            let stream = room.find_stream_mut(stream_id).ok_or_else(|| {
                EngineError::InvalidArgument(format!("unknown stream {}", stream_id))
            })?;
            let flag = match kind {
                MediaKind::Audio => &mut stream.audio_muted,
                MediaKind::Video => &mut stream.video_muted,
            };
            if *flag == muted {
                return Ok(());
            }
            *flag = muted;
        }

        let configure = match kind {
            MediaKind::Audio => Configure::audio(stream_id, muted),
            MediaKind::Video => Configure::video(stream_id, muted),
        };
        let sent = self
            .emit(ClientEvent::Configure, serde_json::to_value(configure)?)
            .await;

        if sent.is_err() {
            // Undo so local state matches what the room saw
            if let Some(stream) = self.room.write().await.find_stream_mut(stream_id) {
                match kind {
                    MediaKind::Audio => stream.audio_muted = !muted,
                    MediaKind::Video => stream.video_muted = !muted,
                }
            }
        }
        sent
    }

    fn unbound_tracks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<RemoteTrack>>> {
        self.unbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_handler(self: &Arc<Self>, stream_id: &str) -> TrackHandler {
        let engine = Arc::downgrade(self);
        let stream_id = stream_id.to_string();
        Box::new(move |track: RemoteTrack| {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            let stream_id = stream_id.clone();
            tokio::spawn(async move { inner.bind_track(&stream_id, track).await });
        })
    }

    async fn bind_track(&self, stream_id: &str, track: RemoteTrack) {
        {
            let mut room = self.room.write().await;
            match room.remote_stream_mut(stream_id) {
                Some(stream) => stream.media_bound = true,
                None => {
                    self.unbound_tracks()
                        .entry(stream_id.to_string())
                        .or_default()
                        .push(track);
                    return;
                }
            }
        }

        tracing::debug!("Media bound for stream {}", stream_id);
        self.events.publish(EngineEvent::MediaBound {
            stream_id: stream_id.to_string(),
            track,
        });
    }

    async fn remove_remote_ref(&self, stream_id: &str) {
        let removed = {
            let mut room = self.room.write().await;
            self.unbound_tracks().remove(stream_id);
            let owner = room.remote_stream(stream_id).map(|s| s.owner_peer_id.clone());
            owner.and_then(|owner| room.remove_stream(&owner, stream_id))
        };
        if let Some(stream_ref) = removed {
            self.events
                .publish(EngineEvent::StreamUnsubscribed(stream_ref));
        }
    }

    /// Local teardown of a subscription whose publisher went away
    async fn drop_subscription(&self, stream_id: &str) {
        let Some(media) = self.subscribed.lock().await.remove(stream_id) else {
            return;
        };
        if let Err(e) = media.peer().close().await {
            tracing::debug!("Error closing peer connection: {}", e);
        }
        self.remove_remote_ref(stream_id).await;
    }

    async fn handle_notification(self: &Arc<Self>, notification: ServerNotification) {
        match notification {
            ServerNotification::PeerConnected(peer) => {
                let peer_id = peer.peer_id.clone();
                let streams = peer.streams.clone();
                self.room.write().await.upsert_peer(peer);
                tracing::info!("Peer {} connected", peer_id);
                self.events.publish(EngineEvent::PeerConnected {
                    peer_id: peer_id.clone(),
                });
                for stream in streams {
                    self.events.publish(EngineEvent::StreamAvailable {
                        peer_id: peer_id.clone(),
                        stream,
                    });
                }
            }
            ServerNotification::PeerUpdated(peer) => {
                let peer_id = peer.peer_id.clone();
                self.room.write().await.upsert_peer(peer);
                self.events.publish(EngineEvent::PeerUpdated { peer_id });
            }
            ServerNotification::PeerRemoved(peer) => {
                // The roster entry stays; only observers learn of the removal
                let known = self.room.read().await.mark_peer_removed(&peer.peer_id);
                tracing::info!("Peer {} removed (known: {})", peer.peer_id, known);
                self.events.publish(EngineEvent::PeerRemoved {
                    peer_id: peer.peer_id,
                });
            }
            ServerNotification::StreamPublished { peer, stream } => {
                self.room
                    .write()
                    .await
                    .add_published_stream(&peer.peer_id, stream.clone());
                tracing::debug!("Peer {} published {}", peer.peer_id, stream.stream_id);
                self.events.publish(EngineEvent::StreamAvailable {
                    peer_id: peer.peer_id,
                    stream,
                });
            }
            ServerNotification::StreamUnpublished { peer, stream } => {
                let known = self
                    .room
                    .write()
                    .await
                    .remove_published_stream(&peer.peer_id, &stream.stream_id);
                if !known {
                    tracing::debug!("Ignoring unpublish of unknown stream {}", stream.stream_id);
                    return;
                }

                let inner = self.clone();
                let stream_id = stream.stream_id.clone();
                tokio::spawn(async move {
                    inner
                        .serializers
                        .enqueue(subscribe_key(&stream_id), inner.drop_subscription(&stream_id))
                        .await;
                });

                self.events.publish(EngineEvent::StreamUnavailable {
                    peer_id: peer.peer_id,
                    stream_id: stream.stream_id,
                });
            }
            ServerNotification::Configure(configure) => {
                let video = configure.video == Some(true);
                let applied = {
                    let mut room = self.room.write().await;
                    match room.find_stream_mut(&configure.stream_id) {
                        Some(stream) if video => {
                            stream.video_muted = configure.muting;
                            true
                        }
                        Some(stream) => {
                            stream.audio_muted = configure.muting;
                            true
                        }
                        None => false,
                    }
                };
                if !applied {
                    tracing::debug!("Ignoring configure for unknown stream {}", configure.stream_id);
                    return;
                }

                let event = if video {
                    EngineEvent::VideoMuted {
                        stream_id: configure.stream_id,
                        muted: configure.muting,
                    }
                } else {
                    EngineEvent::AudioMuted {
                        stream_id: configure.stream_id,
                        muted: configure.muting,
                    }
                };
                self.events.publish(event);
            }
            ServerNotification::Attributes(update) => {
                if self
                    .room
                    .write()
                    .await
                    .update_attributes(&update.stream_id, &update.attributes)
                {
                    self.events.publish(EngineEvent::AttributesChanged {
                        stream_id: update.stream_id,
                        attributes: update.attributes,
                    });
                }
            }
            ServerNotification::AudioLevels(levels) => {
                let room = self.room.read().await;
                for level in levels {
                    let known = room.peer_for_stream(&level.stream_id).is_some()
                        || room.local_stream(&level.stream_id).is_some();
                    if known {
                        self.events.publish(EngineEvent::AudioLevel {
                            stream_id: level.stream_id,
                            level: level.level,
                        });
                    }
                }
            }
            ServerNotification::Message(data) => {
                self.events.publish(EngineEvent::Message(data));
            }
            ServerNotification::Unknown { event, .. } => {
                tracing::debug!("Ignoring unknown notification {}", event);
            }
        }
    }

    /// Re-send `join` after a silent reconnect
    async fn rejoin(&self) {
        let link = self
            .link
            .read()
            .await
            .as_ref()
            .map(|link| (link.channel.clone(), link.join.clone()));
        let Some((channel, join)) = link else {
            return;
        };

        let rejoined = async {
            let response = channel
                .request(CommandKind::Join, serde_json::to_value(&join)?)
                .await?;
            Ok::<JoinResponse, EngineError>(serde_json::from_value(response)?)
        }
        .await;

        match rejoined {
            Ok(response) => {
                self.room.write().await.merge_roster(response.room);
                tracing::info!("Rejoined room {}", join.room);

                // The server forgot our publications along with the link
                let stream_ids: Vec<String> = self.published.lock().await.keys().cloned().collect();
                join_all(stream_ids.iter().map(|stream_id| {
                    self.serializers
                        .enqueue(publish_key(stream_id), self.republish_serialized(stream_id))
                }))
                .await;

                self.events.publish(EngineEvent::Reconnected);
            }
            Err(e) => tracing::warn!("Rejoin after reconnect failed: {}", e),
        }
    }

    /// Publish a stream again on a fresh connection. A stream that cannot
    /// be published again is torn down.
    async fn republish_serialized(&self, stream_id: &str) {
        let Some(media) = self.published.lock().await.remove(stream_id) else {
            return;
        };
        let stream = media.local_stream();
        if let Err(e) = media.peer().close().await {
            tracing::debug!("Error closing stale publisher for {}: {}", stream_id, e);
        }

        let republished: Result<PublishedMedia> = async {
            let stream = stream?;
            let (negotiation, config) = self.negotiation().await?;
            negotiation.publish(&stream, &config).await
        }
        .await;

        let session = self.session.read().await;
        match republished {
            Ok(media) if session.state == SessionState::Connected => {
                self.published
                    .lock()
                    .await
                    .insert(stream_id.to_string(), media);
                tracing::info!("Republished stream {}", stream_id);
                return;
            }
            Ok(media) => {
                // Shutdown already released the ref
                drop(session);
                if let Err(e) = media.peer().close().await {
                    tracing::debug!("Error closing peer connection: {}", e);
                }
                return;
            }
            Err(e) => tracing::warn!("Could not republish stream {}: {}", stream_id, e),
        }

        let removed = {
            let mut room = self.room.write().await;
            let owner = room.local_peer_id().to_string();
            room.remove_stream(&owner, stream_id)
        };
        drop(session);
        if let Some(stream_ref) = removed {
            self.events.publish(EngineEvent::StreamUnpublished(stream_ref));
        }
    }

    /// Move to `Disconnected` and release everything. Idempotent.
    async fn shutdown(&self) {
        if !matches!(self.set_state(SessionState::Disconnected).await, Ok(true)) {
            return;
        }

        if let Some(channel) = self.channel().await {
            channel.close().await;
        }

        let published: Vec<_> = self.published.lock().await.drain().collect();
        for (stream_id, media) in published {
            if let Err(e) = media.peer().close().await {
                tracing::debug!("Error closing publisher for {}: {}", stream_id, e);
            }
        }
        let subscribed: Vec<_> = self.subscribed.lock().await.drain().collect();
        for (stream_id, media) in subscribed {
            if let Err(e) = media.peer().close().await {
                tracing::debug!("Error closing subscriber for {}: {}", stream_id, e);
            }
        }

        let streams = {
            let mut room = self.room.write().await;
            self.unbound_tracks().clear();
            room.clear_streams()
        };
        for stream in streams {
            self.events.publish(match stream.direction {
                StreamDirection::Local => EngineEvent::StreamUnpublished(stream),
                StreamDirection::Remote => EngineEvent::StreamUnsubscribed(stream),
            });
        }
    }
}

/// Follows channel events for the lifetime of the link
async fn watch_channel(
    engine: Weak<EngineInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };

        match event {
            ChannelEvent::Notification(notification) => {
                inner.handle_notification(notification).await;
            }
            ChannelEvent::Disconnected => {
                if inner.session.read().await.state == SessionState::Connected {
                    inner.events.publish(EngineEvent::Reconnecting);
                }
            }
            ChannelEvent::Reconnected => {
                if inner.session.read().await.state == SessionState::Connected {
                    inner.rejoin().await;
                }
            }
            ChannelEvent::Closed(reason) => {
                if reason != CloseReason::Client {
                    tracing::warn!("Signaling closed: {}", reason.into_error());
                }
                inner.shutdown().await;
                break;
            }
            ChannelEvent::Connecting { attempt } => {
                tracing::trace!("Signaling connect attempt {}", attempt);
            }
            ChannelEvent::Open | ChannelEvent::Failed { .. } => {}
        }
    }
}
