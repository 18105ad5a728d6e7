//! Test doubles: an in-memory signaling server and fake peer connections

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_client::error::{EngineError, Result};
use huddle_client::media::{
    MediaTrack, OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory, RemoteTrack,
    SenderId, TrackHandler,
};
use huddle_client::signaling::{Connection, Connector, LinkFrame, RetryPolicy};
use huddle_client::{EngineConfig, EngineEvent, PlatformCapabilities, SessionEngine};
use huddle_protocol::MediaKind;
use jsonwebtoken::{EncodingKey, Header};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

pub const SIGNALING_URL: &str = "wss://sfu.test/ws";

/// Room token for `user` in `room`
pub fn token(user: &str, room: &str) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        &json!({
            "user": user,
            "room": room,
            "appkey": "test-app",
            "wsUrl": SIGNALING_URL,
            "iceServers": [{"urls": "stun:stun.test:3478"}]
        }),
        &EncodingKey::from_secret(b"server-secret"),
    )
    .unwrap()
}

#[derive(Default)]
struct SfuState {
    attempts: u32,
    /// Attempts up to this number are refused
    refuse_first: u32,
    /// Attempts after this number are refused
    refuse_after: Option<u32>,
    room_peers: Vec<Value>,
    commands: Vec<(String, Value)>,
    client_events: Vec<(String, Value)>,
    rejected: HashMap<String, (i32, String)>,
    held: HashSet<String>,
    link: Option<mpsc::UnboundedSender<LinkFrame>>,
    subscriptions: u32,
}

/// Scripted in-memory signaling server
#[derive(Clone, Default)]
pub struct MockSfu {
    state: Arc<Mutex<SfuState>>,
}

impl MockSfu {
    pub fn new() -> Self {
        Self::default()
    }

    /// A peer already in the room when we join
    pub fn with_peer(self, peer_id: &str, streams: &[&str]) -> Self {
        let streams: Vec<Value> = streams
            .iter()
            .map(|id| json!({"streamId": id, "attributes": {}}))
            .collect();
        self.state
            .lock()
            .unwrap()
            .room_peers
            .push(json!({"id": peer_id, "streams": streams}));
        self
    }

    pub fn refuse_first(self, attempts: u32) -> Self {
        self.state.lock().unwrap().refuse_first = attempts;
        self
    }

    pub fn refuse_after(self, attempts: u32) -> Self {
        self.state.lock().unwrap().refuse_after = Some(attempts);
        self
    }

    /// Answer every later `command` with an error frame
    pub fn reject(&self, command: &str, code: i32, message: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(command.to_string(), (code, message.to_string()));
    }

    /// Never answer `command`
    pub fn hold(&self, command: &str) {
        self.state.lock().unwrap().held.insert(command.to_string());
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    pub fn commands(&self, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.state.lock().unwrap().commands.len()
    }

    pub fn client_events(&self, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .client_events
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Push a notification on the current link
    pub fn notify(&self, event: &str, data: Value) {
        let frame = json!({"event": event, "data": data}).to_string();
        if let Some(link) = self.state.lock().unwrap().link.as_ref() {
            let _ = link.send(LinkFrame::Text(frame));
        }
    }

    /// End the current link, optionally with a close code
    pub fn drop_link(&self, code: Option<u16>) {
        if let Some(link) = self.state.lock().unwrap().link.take() {
            let _ = link.send(LinkFrame::Closed(code));
        }
    }

    fn handle(&self, text: &str) {
        let frame: Value = serde_json::from_str(text).unwrap();
        let event = frame["event"].as_str().unwrap_or_default().to_string();
        let data = frame["data"].clone();

        let mut state = self.state.lock().unwrap();
        let Some(id) = frame.get("id").cloned() else {
            state.client_events.push((event, data));
            return;
        };
        state.commands.push((event.clone(), data));

        if state.held.contains(&event) {
            return;
        }
        let reply = if let Some((code, message)) = state.rejected.get(&event) {
            json!({"id": id, "error": {"code": code, "message": message}})
        } else {
            let body = match event.as_str() {
                "join" => json!({"room": {"peers": state.room_peers}}),
                "publish" => json!({"sdp": "v=0 publish-answer"}),
                "subscribe" => {
                    state.subscriptions += 1;
                    json!({
                        "sdp": "v=0 subscribe-answer",
                        "stream": {"subscriberId": format!("sub-{}", state.subscriptions)}
                    })
                }
                _ => json!({}),
            };
            json!({"id": id, "data": body})
        };

        if let Some(link) = state.link.as_ref() {
            let _ = link.send(LinkFrame::Text(reply.to_string()));
        }
    }
}

struct MockConnection {
    sfu: MockSfu,
    incoming: mpsc::UnboundedReceiver<LinkFrame>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sfu.handle(&text);
        Ok(())
    }

    async fn recv(&mut self) -> LinkFrame {
        self.incoming.recv().await.unwrap_or(LinkFrame::Closed(None))
    }

    async fn close(&mut self) {
        self.sfu.state.lock().unwrap().link = None;
    }
}

#[async_trait]
impl Connector for MockSfu {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        assert!(url.starts_with(&format!("{}?token=", SIGNALING_URL)));
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        let attempt = state.attempts;

        let refused = attempt <= state.refuse_first
            || state.refuse_after.is_some_and(|after| attempt > after);
        if refused {
            return Err(EngineError::TransportFailure("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(tx);
        Ok(Box::new(MockConnection {
            sfu: self.clone(),
            incoming: rx,
        }))
    }
}

/// Peer connection that records calls and never touches the network
pub struct FakePeer {
    pub calls: Mutex<Vec<String>>,
    next_sender: AtomicU64,
    fail_answer: Arc<AtomicBool>,
    handler: Mutex<Option<TrackHandler>>,
    closed: watch::Sender<bool>,
}

impl FakePeer {
    fn new(fail_answer: Arc<AtomicBool>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_sender: AtomicU64::new(1),
            fail_answer,
            handler: Mutex::new(None),
            closed: watch::channel(false).0,
        }
    }

    /// Deliver a remote track as if media arrived
    pub fn fire_track(&self, kind: MediaKind, stream_id: &str) {
        let track = RemoteTrack {
            track_id: format!("{}-remote", kind),
            stream_id: stream_id.to_string(),
            kind,
            handle: None,
        };
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(track);
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_sender(&self, track: &MediaTrack) -> Result<SenderId> {
        self.record(format!("add_sender {}", track.kind));
        Ok(SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst)))
    }

    async fn remove_sender(&self, sender: SenderId) -> Result<()> {
        self.record(format!("remove_sender {}", sender.0));
        Ok(())
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<()> {
        self.record(format!("replace_track {} {}", sender.0, track.kind));
        Ok(())
    }

    async fn add_receiver(&self, kind: MediaKind) -> Result<()> {
        self.record(format!("add_receiver {}", kind));
        Ok(())
    }

    async fn create_offer(&self, _options: OfferOptions) -> Result<String> {
        self.record("create_offer".to_string());
        Ok("v=0 offer".to_string())
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String> {
        self.record("set_local".to_string());
        Ok(sdp.to_string())
    }

    async fn set_remote_answer(&self, _sdp: &str) -> Result<()> {
        self.record("set_remote".to_string());
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(EngineError::NegotiationFailure("answer rejected".to_string()));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record("rollback".to_string());
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn close(&self) -> Result<()> {
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

#[derive(Default)]
pub struct FakePeers {
    pub created: Mutex<Vec<Arc<FakePeer>>>,
    pub configs: Mutex<Vec<PeerConfig>>,
    pub fail_answers: Arc<AtomicBool>,
}

impl FakePeers {
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created.lock().unwrap().last().cloned().unwrap()
    }

    pub fn all_closed(&self) -> bool {
        self.created.lock().unwrap().iter().all(|peer| peer.is_closed())
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeers {
    async fn create(&self, config: &PeerConfig) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer::new(self.fail_answers.clone()));
        self.created.lock().unwrap().push(peer.clone());
        self.configs.lock().unwrap().push(config.clone());
        Ok(peer)
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        request_timeout_ms: 2_000,
        retry: RetryPolicy::default(),
        ..Default::default()
    }
}

pub fn engine(sfu: &MockSfu) -> (SessionEngine, Arc<FakePeers>) {
    let peers = Arc::new(FakePeers::default());
    let engine = SessionEngine::with_connector(
        test_config(),
        Arc::new(sfu.clone()),
        peers.clone(),
        PlatformCapabilities::detect(),
    );
    (engine, peers)
}

/// Wait for the first event matching `pred`, failing after five seconds
pub async fn wait_for<F>(events: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Events already queued, without waiting
pub fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
