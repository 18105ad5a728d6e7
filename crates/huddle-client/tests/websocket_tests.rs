//! Session engine over a real WebSocket link
//!
//! Spawns a minimal signaling server on a random port and drives the
//! engine against it with the production connector.

mod common;

use common::{FakePeers, test_config, wait_for};
use futures_util::{SinkExt, StreamExt};
use huddle_client::{EngineEvent, PlatformCapabilities, SessionEngine, SessionState};
use jsonwebtoken::{EncodingKey, Header};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Test signaling server that shuts down when dropped
struct TestServer {
    addr: SocketAddr,
    accepted: Arc<AtomicU32>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    conn = listener.accept() => {
                        let Ok((stream, _)) = conn else { break };
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve(stream));
                    }
                }
            }
        });

        Self {
            addr,
            accepted,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn token(&self, user: &str, room: &str) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            &json!({"user": user, "room": room, "appkey": "test-app", "wsUrl": self.url()}),
            &EncodingKey::from_secret(b"server-secret"),
        )
        .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Answers `join`, announces a peer, and removes the client once it
/// sends a room message
async fn serve(stream: TcpStream) {
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();

        match frame["event"].as_str() {
            Some("join") => {
                let reply = json!({
                    "id": frame["id"],
                    "data": {"room": {"peers": [{"id": "bob", "streams": [{"streamId": "bob-cam"}]}]}}
                });
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();

                let notification = json!({
                    "event": "peerconnected",
                    "data": {"peer": {"id": "carol"}}
                });
                ws.send(Message::Text(notification.to_string().into()))
                    .await
                    .unwrap();
            }
            Some("message") => {
                let close = CloseFrame {
                    code: CloseCode::from(4000),
                    reason: "removed".into(),
                };
                let _ = ws.send(Message::Close(Some(close))).await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_session_over_websocket() {
    let server = TestServer::new().await;
    let engine = SessionEngine::new(
        test_config(),
        Arc::new(FakePeers::default()),
        PlatformCapabilities::detect(),
    );
    let mut events = engine.events();

    tokio::time::timeout(Duration::from_secs(5), engine.join(&server.token("alice", "standup")))
        .await
        .expect("join timed out")
        .expect("join failed");

    assert_eq!(engine.state().await, SessionState::Connected);
    assert_eq!(engine.peer_for_stream("bob-cam").await.as_deref(), Some("bob"));

    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::PeerConnected { peer_id } if peer_id == "carol")
    })
    .await;
    assert!(engine.peer("carol").await.is_some());

    // The server answers a room message with the removal close code
    engine.send_message(json!({"text": "bye"})).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::StateChanged(SessionState::Disconnected))
    })
    .await;

    assert_eq!(engine.state().await, SessionState::Disconnected);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_server_fails_join() {
    // Bind then drop to get a port nothing listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = test_config();
    config.signaling_url = Some(format!("ws://{}/ws", addr));
    config.retry.retries = 1;
    config.retry.min_timeout_ms = 10;

    let engine = SessionEngine::new(
        config,
        Arc::new(FakePeers::default()),
        PlatformCapabilities::detect(),
    );
    let token = common::token("alice", "standup");

    let result = tokio::time::timeout(Duration::from_secs(5), engine.join(&token))
        .await
        .expect("join timed out");

    assert!(result.is_err());
    assert_eq!(engine.state().await, SessionState::Disconnected);
}
