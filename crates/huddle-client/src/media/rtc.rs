//! webrtc-rs backed peer connections

use async_trait::async_trait;
use huddle_protocol::{IceTransportPolicy, MediaKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::peer::{
    OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory, RemoteTrack, SenderId,
    TrackHandler,
};
use super::stream::MediaTrack;
use crate::error::{EngineError, Result};

/// Builds peer connections from one shared webrtc-rs API
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self, config: &PeerConfig) -> Result<Arc<dyn PeerConnection>> {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy: match config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        Ok(Arc::new(RtcPeerConnection::new(pc)))
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
    closed: Arc<watch::Sender<bool>>,
}

impl RtcPeerConnection {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let closed = Arc::new(watch::Sender::new(false));

        let closed_flag = closed.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("Peer connection state: {}", state);
            if state == RTCPeerConnectionState::Closed {
                closed_flag.send_replace(true);
            }
            Box::pin(async {})
        }));

        Self {
            pc,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            closed,
        }
    }

    async fn has_transceiver(&self, kind: RTPCodecType) -> bool {
        self.pc
            .get_transceivers()
            .await
            .iter()
            .any(|transceiver| transceiver.kind() == kind)
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_sender(&self, track: &MediaTrack) -> Result<SenderId> {
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                track.local(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().await.insert(id, transceiver.sender().await);
        tracing::debug!("Added {} sender for track {}", track.kind, track.id);
        Ok(id)
    }

    async fn remove_sender(&self, sender: SenderId) -> Result<()> {
        let Some(rtp_sender) = self.senders.lock().await.remove(&sender) else {
            return Err(EngineError::InvalidArgument(format!(
                "unknown sender {}",
                sender.0
            )));
        };
        self.pc.remove_track(&rtp_sender).await?;
        Ok(())
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        let Some(rtp_sender) = self.senders.lock().await.get(&sender).cloned() else {
            return Err(EngineError::InvalidArgument(format!(
                "unknown sender {}",
                sender.0
            )));
        };
        rtp_sender.replace_track(Some(track.local())).await?;
        tracing::debug!("Sender {} now carries track {}", sender.0, track.id);
        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<String> {
        // webrtc-rs has no offer-to-receive options; emulate them
        for (wanted, kind) in [
            (options.receive_audio, MediaKind::Audio),
            (options.receive_video, MediaKind::Video),
        ] {
            if wanted && !self.has_transceiver(codec_type(kind)).await {
                self.add_receiver(kind).await?;
            }
        }

        let offer = self.pc.create_offer(None).await?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;

        // The signaling server does not take trickled candidates
        let _ = gathered.recv().await;

        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| EngineError::NegotiationFailure("local description missing".to_string()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let Some(pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let remote = RemoteTrack {
                track_id: track.id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind,
                handle: Some(track),
            };
            tracing::debug!("Remote {} track {} arrived", remote.kind, remote.track_id);
            handler(remote);
            Box::pin(async {})
        }));
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.senders.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
