//! Per-stream offer/answer negotiation
//!
//! Every published or subscribed stream gets its own peer connection. Each
//! operation runs as a [`NegotiationTransaction`]: create the connection,
//! attach tracks, generate and apply the local offer, send the command, apply
//! the answer. Every step races the connection's close signal, so a
//! connection closed mid-transaction fails the transaction instead of
//! hanging it.

use async_trait::async_trait;
use huddle_protocol::{
    Attributes, CommandKind, MediaKind, PublishRequest, PublishStream, SdpResponse,
    SubscribeRequest, SubscribeResponse, SubscribeStream, UnpublishRequest, UnsubscribeRequest,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::capabilities::PlatformCapabilities;
use crate::error::{EngineError, Result};
use crate::media::{
    LocalStream, MediaTrack, OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory,
    SenderId, TrackHandler,
};
use crate::signaling::SignalingChannel;

/// Command path to the signaling server
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn request(&self, command: CommandKind, data: Value) -> Result<Value>;
}

#[async_trait]
impl Signaling for SignalingChannel {
    async fn request(&self, command: CommandKind, data: Value) -> Result<Value> {
        SignalingChannel::request(self, command, data).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Publish,
    Unpublish,
    Subscribe,
    Unsubscribe,
    Renegotiate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Created,
    /// Local offer generated and applied
    OfferSent,
    /// Command in flight
    AnswerPending,
    Committed,
    Failed,
}

#[derive(Debug)]
pub struct NegotiationTransaction {
    pub kind: TransactionKind,
    pub stream_id: String,
    pub phase: TransactionPhase,
    pub local_description: Option<String>,
    pub remote_description: Option<String>,
}

impl NegotiationTransaction {
    fn new(kind: TransactionKind, stream_id: &str) -> Self {
        tracing::debug!("{:?} {}: created", kind, stream_id);
        Self {
            kind,
            stream_id: stream_id.to_string(),
            phase: TransactionPhase::Created,
            local_description: None,
            remote_description: None,
        }
    }

    fn advance(&mut self, phase: TransactionPhase) {
        tracing::debug!(
            "{:?} {}: {:?} -> {:?}",
            self.kind,
            self.stream_id,
            self.phase,
            phase
        );
        self.phase = phase;
    }

    fn fail(&mut self, error: &EngineError) {
        tracing::warn!(
            "{:?} {} failed in {:?}: {}",
            self.kind,
            self.stream_id,
            self.phase,
            error
        );
        self.phase = TransactionPhase::Failed;
    }
}

#[derive(Debug, Clone)]
struct SentTrack {
    sender: SenderId,
    track: MediaTrack,
}

/// A committed publication and the connection carrying it
pub struct PublishedMedia {
    pub stream_id: String,
    peer: Arc<dyn PeerConnection>,
    request: PublishStream,
    tracks: HashMap<MediaKind, SentTrack>,
}

impl PublishedMedia {
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.get(&kind).map(|sent| &sent.track)
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    /// The stream as currently sent, for publishing it again
    pub fn local_stream(&self) -> Result<LocalStream> {
        let mut stream = LocalStream::new(
            self.stream_id.clone(),
            self.track(MediaKind::Audio).cloned(),
            self.track(MediaKind::Video).cloned(),
        )?
        .with_attributes(self.request.attributes.clone());
        stream.bitrate = self.request.bitrate;
        Ok(stream)
    }
}

/// A committed subscription and the connection carrying it
pub struct SubscribedMedia {
    pub publisher_stream_id: String,
    pub subscriber_stream_id: String,
    pub attributes: Attributes,
    peer: Arc<dyn PeerConnection>,
}

impl SubscribedMedia {
    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }
}

pub struct NegotiationEngine {
    signaling: Arc<dyn Signaling>,
    peers: Arc<dyn PeerConnectionFactory>,
    capabilities: PlatformCapabilities,
}

impl NegotiationEngine {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        peers: Arc<dyn PeerConnectionFactory>,
        capabilities: PlatformCapabilities,
    ) -> Self {
        Self {
            signaling,
            peers,
            capabilities,
        }
    }

    /// Publish `stream` on a new send-only connection
    pub async fn publish(&self, stream: &LocalStream, config: &PeerConfig) -> Result<PublishedMedia> {
        let mut txn = NegotiationTransaction::new(TransactionKind::Publish, &stream.stream_id);
        let peer = self.peers.create(config).await?;

        let request = PublishStream {
            stream_id: stream.stream_id.clone(),
            bitrate: stream.bitrate,
            attributes: stream.attributes.clone(),
        };

        let result = guarded(
            peer.as_ref(),
            self.run_publish(&mut txn, peer.as_ref(), stream, &request),
        )
        .await;

        match result {
            Ok(tracks) => {
                txn.advance(TransactionPhase::Committed);
                tracing::info!("Published stream {}", stream.stream_id);
                Ok(PublishedMedia {
                    stream_id: stream.stream_id.clone(),
                    peer,
                    request,
                    tracks,
                })
            }
            Err(e) => {
                txn.fail(&e);
                close_quietly(peer.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn run_publish(
        &self,
        txn: &mut NegotiationTransaction,
        peer: &dyn PeerConnection,
        stream: &LocalStream,
        request: &PublishStream,
    ) -> Result<HashMap<MediaKind, SentTrack>> {
        let mut tracks = HashMap::new();
        for track in stream.tracks() {
            let sender = peer.add_sender(track).await.map_err(sdp_error)?;
            tracks.insert(
                track.kind,
                SentTrack {
                    sender,
                    track: track.clone(),
                },
            );
        }

        self.publish_round_trip(txn, peer, request).await?;
        Ok(tracks)
    }

    /// Offer, `publish` command, answer
    async fn publish_round_trip(
        &self,
        txn: &mut NegotiationTransaction,
        peer: &dyn PeerConnection,
        request: &PublishStream,
    ) -> Result<()> {
        let response = self
            .exchange(txn, peer, OfferOptions::default(), CommandKind::Publish, |sdp| {
                serde_json::to_value(PublishRequest {
                    sdp,
                    stream: request.clone(),
                })
            })
            .await?;

        let response: SdpResponse = serde_json::from_value(response)?;
        apply_answer(txn, peer, response.sdp).await
    }

    /// Detach and close, then tell the server
    pub async fn unpublish(&self, media: PublishedMedia) -> Result<()> {
        let mut txn = NegotiationTransaction::new(TransactionKind::Unpublish, &media.stream_id);

        for (kind, sent) in &media.tracks {
            if let Err(e) = media.peer.remove_sender(sent.sender).await {
                tracing::debug!("Failed to detach {} sender: {}", kind, e);
            }
        }
        close_quietly(media.peer.as_ref()).await;

        txn.advance(TransactionPhase::AnswerPending);
        let data = serde_json::to_value(UnpublishRequest {
            stream_id: media.stream_id.clone(),
        })?;

        match self.signaling.request(CommandKind::Unpublish, data).await {
            Ok(_) => {
                txn.advance(TransactionPhase::Committed);
                tracing::info!("Unpublished stream {}", media.stream_id);
                Ok(())
            }
            Err(e) => {
                txn.fail(&e);
                Err(e)
            }
        }
    }

    /// Subscribe to a remote stream on a new receive-only connection.
    /// `on_track` is registered before the offer is generated.
    pub async fn subscribe(
        &self,
        publisher_stream_id: &str,
        config: &PeerConfig,
        on_track: TrackHandler,
    ) -> Result<SubscribedMedia> {
        let mut txn = NegotiationTransaction::new(TransactionKind::Subscribe, publisher_stream_id);
        let peer = self.peers.create(config).await?;
        peer.on_track(on_track);

        let result = guarded(
            peer.as_ref(),
            self.run_subscribe(&mut txn, peer.as_ref(), publisher_stream_id),
        )
        .await;

        match result {
            Ok(response) => {
                txn.advance(TransactionPhase::Committed);
                let subscriber_stream_id = response
                    .stream
                    .subscriber_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                tracing::info!(
                    "Subscribed to stream {} as {}",
                    publisher_stream_id,
                    subscriber_stream_id
                );
                Ok(SubscribedMedia {
                    publisher_stream_id: publisher_stream_id.to_string(),
                    subscriber_stream_id,
                    attributes: response.stream.attributes,
                    peer,
                })
            }
            Err(e) => {
                txn.fail(&e);
                close_quietly(peer.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn run_subscribe(
        &self,
        txn: &mut NegotiationTransaction,
        peer: &dyn PeerConnection,
        publisher_stream_id: &str,
    ) -> Result<SubscribeResponse> {
        let options = if self.capabilities.explicit_receive_transceivers {
            peer.add_receiver(MediaKind::Audio).await.map_err(sdp_error)?;
            peer.add_receiver(MediaKind::Video).await.map_err(sdp_error)?;
            OfferOptions::default()
        } else {
            OfferOptions {
                receive_audio: true,
                receive_video: true,
            }
        };

        let response = self
            .exchange(txn, peer, options, CommandKind::Subscribe, |sdp| {
                serde_json::to_value(SubscribeRequest {
                    sdp,
                    stream: SubscribeStream {
                        publisher_id: publisher_stream_id.to_string(),
                    },
                })
            })
            .await?;

        let response: SubscribeResponse = serde_json::from_value(response)?;
        apply_answer(txn, peer, response.sdp.clone()).await?;
        Ok(response)
    }

    /// Tell the server, then close. Local teardown happens even if the
    /// command fails; the command's error is returned.
    pub async fn unsubscribe(&self, media: SubscribedMedia) -> Result<()> {
        let mut txn =
            NegotiationTransaction::new(TransactionKind::Unsubscribe, &media.publisher_stream_id);

        txn.advance(TransactionPhase::AnswerPending);
        let data = serde_json::to_value(UnsubscribeRequest {
            publisher_stream_id: media.publisher_stream_id.clone(),
            subscriber_stream_id: media.subscriber_stream_id.clone(),
        })?;
        let result = self.signaling.request(CommandKind::Unsubscribe, data).await;

        close_quietly(media.peer.as_ref()).await;
        txn.advance(TransactionPhase::Committed);

        if let Err(e) = &result {
            tracing::warn!(
                "Unsubscribe from {} not acknowledged: {}",
                media.publisher_stream_id,
                e
            );
        }
        result.map(|_| ())
    }

    /// Swap the published track of `track.kind` and renegotiate.
    /// An existing sender keeps its transceiver and only changes track.
    /// On failure the offer is rolled back and the previous track put back
    /// on the same sender.
    pub async fn renegotiate(&self, media: &mut PublishedMedia, track: MediaTrack) -> Result<()> {
        let mut txn = NegotiationTransaction::new(TransactionKind::Renegotiate, &media.stream_id);
        let kind = track.kind;
        let peer = media.peer.clone();
        let previous = media.tracks.get(&kind).cloned();

        let mut attached = None;
        let result = guarded(
            peer.as_ref(),
            self.run_renegotiate(
                &mut txn,
                peer.as_ref(),
                &media.request,
                previous.as_ref().map(|sent| sent.sender),
                &track,
                &mut attached,
            ),
        )
        .await;

        match result {
            Ok(()) => {
                txn.advance(TransactionPhase::Committed);
                if let Some(sender) = attached {
                    media.tracks.insert(kind, SentTrack { sender, track });
                }
                tracing::info!("Replaced {} track on stream {}", kind, media.stream_id);
                Ok(())
            }
            Err(e) => {
                txn.fail(&e);
                if txn.local_description.is_some() {
                    if let Err(err) = peer.rollback().await {
                        tracing::debug!("Failed to roll back offer: {}", err);
                    }
                }
                match (attached, previous) {
                    (Some(_), Some(previous)) => {
                        if let Err(err) = peer.replace_track(previous.sender, &previous.track).await {
                            tracing::warn!("Could not restore previous {} track: {}", kind, err);
                        }
                    }
                    (Some(sender), None) => {
                        if let Err(err) = peer.remove_sender(sender).await {
                            tracing::debug!("Failed to detach new {} sender: {}", kind, err);
                        }
                    }
                    (None, _) => {}
                }
                Err(e)
            }
        }
    }

    async fn run_renegotiate(
        &self,
        txn: &mut NegotiationTransaction,
        peer: &dyn PeerConnection,
        request: &PublishStream,
        previous: Option<SenderId>,
        track: &MediaTrack,
        attached: &mut Option<SenderId>,
    ) -> Result<()> {
        let sender = match previous {
            Some(sender) => {
                peer.replace_track(sender, track).await.map_err(sdp_error)?;
                sender
            }
            None => peer.add_sender(track).await.map_err(sdp_error)?,
        };
        *attached = Some(sender);

        self.publish_round_trip(txn, peer, request).await
    }

    /// Generate and apply the local offer, then send `command`
    async fn exchange<F>(
        &self,
        txn: &mut NegotiationTransaction,
        peer: &dyn PeerConnection,
        options: OfferOptions,
        command: CommandKind,
        build: F,
    ) -> Result<Value>
    where
        F: FnOnce(String) -> serde_json::Result<Value> + Send,
    {
        let offer = peer.create_offer(options).await.map_err(sdp_error)?;
        let sdp = peer.set_local_description(&offer).await.map_err(sdp_error)?;
        txn.local_description = Some(sdp.clone());
        txn.advance(TransactionPhase::OfferSent);

        let data = build(sdp)?;
        txn.advance(TransactionPhase::AnswerPending);
        self.signaling.request(command, data).await
    }
}

async fn apply_answer(
    txn: &mut NegotiationTransaction,
    peer: &dyn PeerConnection,
    sdp: String,
) -> Result<()> {
    peer.set_remote_answer(&sdp).await.map_err(sdp_error)?;
    txn.remote_description = Some(sdp);
    Ok(())
}

/// Run `step` unless the connection closes first
async fn guarded<T>(peer: &dyn PeerConnection, step: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = step => result,
        _ = peer.closed() => Err(EngineError::NegotiationFailure(
            "peer connection closed during negotiation".to_string(),
        )),
    }
}

async fn close_quietly(peer: &dyn PeerConnection) {
    if let Err(e) = peer.close().await {
        tracing::debug!("Error closing peer connection: {}", e);
    }
}

/// Backend errors while applying SDP are negotiation failures
fn sdp_error(error: EngineError) -> EngineError {
    match error {
        EngineError::WebRtc(e) => EngineError::NegotiationFailure(e.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::watch;

    /// Offer/answer state as the fake peer sees it
    #[derive(Default)]
    struct Transceivers {
        /// Track id carried by each sender
        senders: HashMap<SenderId, String>,
        /// Senders covered by the last applied answer
        negotiated: HashSet<SenderId>,
        have_local_offer: bool,
    }

    struct FakePeer {
        log: StdMutex<Vec<String>>,
        next_sender: AtomicU64,
        fail_answer: AtomicBool,
        state: StdMutex<Transceivers>,
        closed: watch::Sender<bool>,
    }

    impl FakePeer {
        fn new() -> Self {
            Self {
                log: StdMutex::new(Vec::new()),
                next_sender: AtomicU64::new(1),
                fail_answer: AtomicBool::new(false),
                state: StdMutex::new(Transceivers::default()),
                closed: watch::channel(false).0,
            }
        }

        /// Senders with negotiated media, and the track each one carries
        fn negotiated_tracks(&self) -> HashMap<SenderId, String> {
            let state = self.state.lock().unwrap();
            state
                .senders
                .iter()
                .filter(|(sender, _)| state.negotiated.contains(sender))
                .map(|(sender, track)| (*sender, track.clone()))
                .collect()
        }

        fn is_stable(&self) -> bool {
            !self.state.lock().unwrap().have_local_offer
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn add_sender(&self, track: &MediaTrack) -> Result<SenderId> {
            self.record(format!("add_sender {}", track.kind));
            let sender = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
            self.state
                .lock()
                .unwrap()
                .senders
                .insert(sender, track.id.clone());
            Ok(sender)
        }

        async fn remove_sender(&self, sender: SenderId) -> Result<()> {
            self.record(format!("remove_sender {}", sender.0));
            self.state.lock().unwrap().senders.remove(&sender);
            Ok(())
        }

        async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
            self.record(format!("replace_track {}", sender.0));
            match self.state.lock().unwrap().senders.get_mut(&sender) {
                Some(carried) => {
                    *carried = track.id.clone();
                    Ok(())
                }
                None => Err(EngineError::InvalidArgument("unknown sender".to_string())),
            }
        }

        async fn add_receiver(&self, kind: MediaKind) -> Result<()> {
            self.record(format!("add_receiver {}", kind));
            Ok(())
        }

        async fn create_offer(&self, options: OfferOptions) -> Result<String> {
            self.record(format!("create_offer {:?}", options));
            Ok("v=0 offer".to_string())
        }

        async fn set_local_description(&self, sdp: &str) -> Result<String> {
            self.record("set_local".to_string());
            self.state.lock().unwrap().have_local_offer = true;
            Ok(sdp.to_string())
        }

        async fn set_remote_answer(&self, _sdp: &str) -> Result<()> {
            self.record("set_remote".to_string());
            if self.fail_answer.load(Ordering::SeqCst) {
                return Err(EngineError::NegotiationFailure("bad answer".to_string()));
            }
            let mut state = self.state.lock().unwrap();
            state.have_local_offer = false;
            state.negotiated = state.senders.keys().copied().collect();
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.record("rollback".to_string());
            self.state.lock().unwrap().have_local_offer = false;
            Ok(())
        }

        fn on_track(&self, _handler: TrackHandler) {
            self.record("on_track".to_string());
        }

        async fn close(&self) -> Result<()> {
            self.record("close".to_string());
            self.closed.send_replace(true);
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

    struct FakeFactory {
        peer: Arc<FakePeer>,
    }

    #[async_trait]
    impl PeerConnectionFactory for FakeFactory {
        async fn create(&self, _config: &PeerConfig) -> Result<Arc<dyn PeerConnection>> {
            Ok(self.peer.clone())
        }
    }

    /// Replies from a script; `None` means hang until the peer closes it
    #[derive(Default)]
    struct FakeSignaling {
        replies: StdMutex<VecDeque<Option<Result<Value>>>>,
        sent: StdMutex<Vec<(CommandKind, Value)>>,
        close_on_hang: StdMutex<Option<Arc<FakePeer>>>,
    }

    #[async_trait]
    impl Signaling for FakeSignaling {
        async fn request(&self, command: CommandKind, data: Value) -> Result<Value> {
            self.sent.lock().unwrap().push((command, data));
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Some(result)) => result,
                _ => {
                    let peer = self.close_on_hang.lock().unwrap().clone();
                    if let Some(peer) = peer {
                        peer.close().await?;
                    }
                    std::future::pending().await
                }
            }
        }
    }

    fn setup(
        replies: Vec<Option<Result<Value>>>,
        capabilities: PlatformCapabilities,
    ) -> (NegotiationEngine, Arc<FakePeer>, Arc<FakeSignaling>) {
        let peer = Arc::new(FakePeer::new());
        let signaling = Arc::new(FakeSignaling::default());
        *signaling.replies.lock().unwrap() = replies.into();
        let engine = NegotiationEngine::new(
            signaling.clone(),
            Arc::new(FakeFactory { peer: peer.clone() }),
            capabilities,
        );
        (engine, peer, signaling)
    }

    fn av_stream() -> LocalStream {
        let (audio, _) = MediaTrack::sample(MediaKind::Audio, "s1");
        let (video, _) = MediaTrack::sample(MediaKind::Video, "s1");
        LocalStream::new("s1", Some(audio), Some(video)).unwrap()
    }

    #[tokio::test]
    async fn test_publish_steps_in_order() {
        let (engine, peer, signaling) = setup(
            vec![Some(Ok(json!({"sdp": "v=0 answer"})))],
            PlatformCapabilities::detect(),
        );

        let media = engine
            .publish(&av_stream().with_bitrate(500), &PeerConfig::default())
            .await
            .unwrap();

        assert_eq!(
            peer.log(),
            vec![
                "add_sender audio",
                "add_sender video",
                "create_offer OfferOptions { receive_audio: false, receive_video: false }",
                "set_local",
                "set_remote",
            ]
        );
        let sent = signaling.sent.lock().unwrap();
        assert_eq!(sent[0].0, CommandKind::Publish);
        assert_eq!(sent[0].1["stream"]["streamId"], "s1");
        assert_eq!(sent[0].1["stream"]["bitrate"], 500);
        assert!(media.track(MediaKind::Video).is_some());
    }

    #[tokio::test]
    async fn test_rejected_publish_closes_peer() {
        let (engine, peer, _) = setup(
            vec![Some(Err(EngineError::Rejected {
                command: "publish".to_string(),
                code: 403,
                message: "forbidden".to_string(),
            }))],
            PlatformCapabilities::detect(),
        );

        let result = engine.publish(&av_stream(), &PeerConfig::default()).await;

        assert!(matches!(result, Err(EngineError::Rejected { code: 403, .. })));
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_peer_closed_mid_transaction() {
        let (engine, peer, signaling) = setup(vec![None], PlatformCapabilities::detect());
        *signaling.close_on_hang.lock().unwrap() = Some(peer.clone());

        let result = engine.publish(&av_stream(), &PeerConfig::default()).await;

        assert!(matches!(result, Err(EngineError::NegotiationFailure(_))));
    }

    #[tokio::test]
    async fn test_subscribe_receivers_follow_capabilities() {
        let response = json!({"sdp": "v=0 answer", "stream": {"subscriberId": "sub-9"}});

        let (engine, peer, _) = setup(vec![Some(Ok(response.clone()))], PlatformCapabilities::detect());
        let media = engine
            .subscribe("s2", &PeerConfig::default(), Box::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(media.subscriber_stream_id, "sub-9");
        let log = peer.log();
        assert_eq!(log[0], "on_track");
        assert_eq!(log[1], "add_receiver audio");
        assert_eq!(log[2], "add_receiver video");

        let legacy = PlatformCapabilities {
            unified_plan: false,
            explicit_receive_transceivers: false,
        };
        let (engine, peer, signaling) = setup(vec![Some(Ok(response))], legacy);
        engine
            .subscribe("s2", &PeerConfig::default(), Box::new(|_| {}))
            .await
            .unwrap();
        assert!(!peer.log().iter().any(|entry| entry.starts_with("add_receiver")));
        assert!(peer.log().contains(
            &"create_offer OfferOptions { receive_audio: true, receive_video: true }".to_string()
        ));
        assert_eq!(signaling.sent.lock().unwrap()[0].1["stream"]["publisherId"], "s2");
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down_even_on_error() {
        let (engine, peer, signaling) = setup(
            vec![
                Some(Ok(json!({"sdp": "v=0 answer", "stream": {}}))),
                Some(Err(EngineError::NotConnected)),
            ],
            PlatformCapabilities::detect(),
        );
        let media = engine
            .subscribe("s2", &PeerConfig::default(), Box::new(|_| {}))
            .await
            .unwrap();
        let subscriber_id = media.subscriber_stream_id.clone();

        let result = engine.unsubscribe(media).await;

        assert!(matches!(result, Err(EngineError::NotConnected)));
        assert!(peer.is_closed());
        let sent = signaling.sent.lock().unwrap();
        assert_eq!(sent[1].0, CommandKind::Unsubscribe);
        assert_eq!(sent[1].1["subscriberStreamId"], subscriber_id.as_str());
    }

    #[tokio::test]
    async fn test_failed_renegotiation_restores_track() {
        let (engine, peer, _) = setup(
            vec![
                Some(Ok(json!({"sdp": "v=0 answer"}))),
                Some(Ok(json!({"sdp": "v=0 answer"}))),
            ],
            PlatformCapabilities::detect(),
        );
        let stream = av_stream();
        let original_video = stream.video.clone().unwrap();
        let mut media = engine.publish(&stream, &PeerConfig::default()).await.unwrap();

        let video_sender = media.tracks[&MediaKind::Video].sender;
        let published_calls = peer.log().len();

        peer.fail_answer.store(true, Ordering::SeqCst);
        let (replacement, _) = MediaTrack::sample(MediaKind::Video, "s1");
        let result = engine.renegotiate(&mut media, replacement).await;

        assert!(matches!(result, Err(EngineError::NegotiationFailure(_))));
        assert_eq!(media.track(MediaKind::Video).unwrap().id, original_video.id);
        assert!(!peer.is_closed());

        // The original track is back on its negotiated sender
        assert_eq!(media.tracks[&MediaKind::Video].sender, video_sender);
        let negotiated = peer.negotiated_tracks();
        assert_eq!(negotiated.get(&video_sender), Some(&original_video.id));
        assert_eq!(negotiated.len(), 2);
        assert!(peer.is_stable());
        let after_failure = &peer.log()[published_calls..];
        assert!(after_failure.contains(&"rollback".to_string()));
        assert!(!after_failure.iter().any(|call| call.starts_with("add_sender")));
    }

    #[tokio::test]
    async fn test_renegotiation_swaps_track() {
        let (engine, peer, signaling) = setup(
            vec![
                Some(Ok(json!({"sdp": "v=0 answer"}))),
                Some(Ok(json!({"sdp": "v=0 answer"}))),
            ],
            PlatformCapabilities::detect(),
        );
        let mut media = engine.publish(&av_stream(), &PeerConfig::default()).await.unwrap();
        let audio_sender = media.tracks[&MediaKind::Audio].sender;

        let (replacement, _) = MediaTrack::sample(MediaKind::Audio, "s1");
        let replacement_id = replacement.id.clone();
        engine.renegotiate(&mut media, replacement).await.unwrap();

        assert_eq!(media.track(MediaKind::Audio).unwrap().id, replacement_id);
        assert_eq!(media.tracks[&MediaKind::Audio].sender, audio_sender);
        assert_eq!(peer.negotiated_tracks().get(&audio_sender), Some(&replacement_id));
        assert!(peer.is_stable());
        let sent = signaling.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, CommandKind::Publish);
    }
}
