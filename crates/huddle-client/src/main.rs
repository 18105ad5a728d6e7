use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use huddle_client::media::RtcPeerFactory;
use huddle_client::{EngineConfig, EngineEvent, PlatformCapabilities, SessionEngine, SessionState};

const USAGE: &str = "usage: huddle [TOKEN]
       huddle --test-token <URL> <SECRET> <ROOM> <USER>

Without arguments the token is read from HUDDLE_TOKEN.";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let token = resolve_token().await?;
    let config = EngineConfig::load()?;

    let engine = SessionEngine::new(
        config,
        Arc::new(RtcPeerFactory::new()?),
        PlatformCapabilities::detect(),
    );
    let mut events = engine.events();

    engine.join(&token).await?;
    let session = engine.session().await;
    tracing::info!(
        "In room {} as {}, press Ctrl-C to leave",
        session.room.unwrap_or_default(),
        session.local_user_id.unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::StreamAvailable { peer_id, stream }) => {
                    tracing::info!("Stream {} available from {}", stream.stream_id, peer_id);
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.subscribe(&stream.stream_id).await {
                            tracing::warn!("Failed to subscribe to {}: {}", stream.stream_id, e);
                        }
                    });
                }
                Ok(EngineEvent::StateChanged(SessionState::Disconnected)) => {
                    tracing::warn!("Session ended");
                    break;
                }
                Ok(event) => tracing::info!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.leave().await?;
    Ok(())
}

async fn resolve_token() -> Result<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [flag, url, secret, room, user] if flag == "--test-token" => {
            tracing::info!("Requesting test token for {} in {}", user, room);
            Ok(huddle_client::token::fetch_test_token(url, secret, room, user).await?)
        }
        [token] if !token.starts_with('-') => Ok(token.clone()),
        [] => std::env::var("HUDDLE_TOKEN").map_err(|_| anyhow::anyhow!("{}", USAGE)),
        _ => anyhow::bail!("{}", USAGE),
    }
}
