use async_trait::async_trait;
use huddle_protocol::MediaKind;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::stream::MediaTrack;
use crate::error::{EngineError, Result};

/// What to capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
            ..Default::default()
        }
    }

    pub fn only(kind: MediaKind, device: Option<String>) -> Self {
        match kind {
            MediaKind::Audio => Self {
                audio: true,
                audio_device: device,
                ..Default::default()
            },
            MediaKind::Video => Self {
                video: true,
                video_device: device,
                ..Default::default()
            },
        }
    }
}

/// A capture backend producing local tracks
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>>;
}

/// Serializes device acquisition: one capture request at a time
pub struct MediaDevices {
    source: Arc<dyn MediaSource>,
    acquiring: Mutex<()>,
}

impl MediaDevices {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            acquiring: Mutex::new(()),
        }
    }

    /// Acquire tracks for `constraints`
    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>> {
        if !constraints.audio && !constraints.video {
            return Err(EngineError::InvalidArgument(
                "nothing to acquire: audio and video both disabled".to_string(),
            ));
        }

        let _guard = self.acquiring.lock().await;
        tracing::debug!("Acquiring media: {:?}", constraints);
        let tracks = self.source.acquire(constraints).await?;
        tracing::debug!("Acquired {} track(s)", tracks.len());
        Ok(tracks)
    }

    /// Acquire one track of `kind`, e.g. after an input device change
    pub async fn acquire_track(&self, kind: MediaKind, device: Option<String>) -> Result<MediaTrack> {
        self.acquire(&MediaConstraints::only(kind, device))
            .await?
            .into_iter()
            .find(|track| track.kind == kind)
            .ok_or_else(|| EngineError::Media(format!("no {} track was produced", kind)))
    }
}
