use huddle_protocol::{Attributes, MediaKind};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{EngineError, Result};

/// A local media track ready to be sent
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    track: Arc<dyn TrackLocal + Send + Sync>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: track.id().to_string(),
            kind,
            track,
        }
    }

    /// Sample-fed track with the default codec for `kind` (Opus or VP8).
    /// Returns the sample track too so the caller can write media into it.
    pub fn sample(kind: MediaKind, stream_id: &str) -> (Self, Arc<TrackLocalStaticSample>) {
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let sample = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{}-{}", kind, Uuid::new_v4()),
            stream_id.to_string(),
        ));

        (Self::new(kind, sample.clone()), sample)
    }

    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A local stream: at most one audio and one video track
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub stream_id: String,
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
    pub attributes: Attributes,
    /// Requested send bitrate in kbps
    pub bitrate: Option<u32>,
}

impl LocalStream {
    pub fn new(
        stream_id: impl Into<String>,
        audio: Option<MediaTrack>,
        video: Option<MediaTrack>,
    ) -> Result<Self> {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return Err(EngineError::InvalidArgument("stream id is empty".to_string()));
        }
        if audio.is_none() && video.is_none() {
            return Err(EngineError::InvalidArgument(
                "a stream needs an audio or a video track".to_string(),
            ));
        }
        for (track, kind) in [(&audio, MediaKind::Audio), (&video, MediaKind::Video)] {
            if track.as_ref().is_some_and(|t| t.kind != kind) {
                return Err(EngineError::InvalidArgument(format!(
                    "{} slot holds a track of another kind",
                    kind
                )));
            }
        }

        Ok(Self {
            stream_id,
            audio,
            video,
            attributes: Attributes::new(),
            bitrate: None,
        })
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate = Some(kbps);
        self
    }

    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }
}
