use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Attributes, PeerInfo, PublishedStream, RoomInfo};

/// Close code the server uses when it removes a client on purpose.
/// A connection closed with this code is never retried.
pub const REMOVED_BY_SERVER_CLOSE_CODE: u16 = 4000;

/// Frames sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundFrame {
    /// Request expecting exactly one correlated response
    Command { id: u64, event: String, data: Value },

    /// Fire-and-forget event
    Event { event: String, data: Value },
}

/// Frames sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InboundFrame {
    /// A command was rejected
    Failure { id: u64, error: ErrorBody },

    /// A command succeeded
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
    },

    /// Server-initiated notification
    Notification {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Error payload of a rejected command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Transactional commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Join,
    Leave,
    Publish,
    Unpublish,
    Subscribe,
    Unsubscribe,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Join => "join",
            CommandKind::Leave => "leave",
            CommandKind::Publish => "publish",
            CommandKind::Unpublish => "unpublish",
            CommandKind::Subscribe => "subscribe",
            CommandKind::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fire-and-forget events sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Configure,
    Attributes,
    Message,
}

impl ClientEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientEvent::Configure => "configure",
            ClientEvent::Attributes => "attributes",
            ClientEvent::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub appkey: String,
    pub room: String,
    pub user: String,
    pub token: String,
    /// Legacy SDP semantics flag
    #[serde(default)]
    pub planb: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JoinResponse {
    #[serde(default)]
    pub room: RoomInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishStream {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRequest {
    pub sdp: String,
    pub stream: PublishStream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdpResponse {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnpublishRequest {
    pub stream_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeStream {
    pub publisher_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeRequest {
    pub sdp: String,
    pub stream: SubscribeStream,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeResponse {
    pub sdp: String,
    #[serde(default)]
    pub stream: SubscribedStream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub publisher_stream_id: String,
    pub subscriber_stream_id: String,
}

/// Mute state change, in both directions.
/// Exactly one of `audio`/`video` is set to `true` to select the track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    #[serde(alias = "msid")]
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,
    pub muting: bool,
}

impl Configure {
    pub fn audio(stream_id: impl Into<String>, muting: bool) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: Some(true),
            video: None,
            muting,
        }
    }

    pub fn video(stream_id: impl Into<String>, muting: bool) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: None,
            video: Some(true),
            muting,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttributesUpdate {
    #[serde(alias = "msid")]
    pub stream_id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevel {
    #[serde(alias = "msid")]
    pub stream_id: String,
    #[serde(alias = "audioLevel")]
    pub level: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PeerPayload {
    peer: PeerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StreamPayload {
    peer: PeerInfo,
    stream: PublishedStream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct AudioLevelsPayload {
    #[serde(default, alias = "audioLevels")]
    levels: Vec<AudioLevel>,
}

/// Typed server notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    PeerConnected(PeerInfo),
    PeerUpdated(PeerInfo),
    PeerRemoved(PeerInfo),
    StreamPublished { peer: PeerInfo, stream: PublishedStream },
    StreamUnpublished { peer: PeerInfo, stream: PublishedStream },
    Configure(Configure),
    Attributes(AttributesUpdate),
    AudioLevels(Vec<AudioLevel>),
    /// Opaque application payload
    Message(Value),
    /// Event name this client does not understand
    Unknown { event: String, data: Value },
}

impl ServerNotification {
    /// Decode the `data` of a notification frame according to its event name
    pub fn decode(event: &str, data: Value) -> Result<Self, serde_json::Error> {
        let notification = match event {
            "peerconnected" => {
                ServerNotification::PeerConnected(serde_json::from_value::<PeerPayload>(data)?.peer)
            }
            "peerupdated" => {
                ServerNotification::PeerUpdated(serde_json::from_value::<PeerPayload>(data)?.peer)
            }
            "peerremoved" => {
                ServerNotification::PeerRemoved(serde_json::from_value::<PeerPayload>(data)?.peer)
            }
            "streampublished" => {
                let payload: StreamPayload = serde_json::from_value(data)?;
                ServerNotification::StreamPublished {
                    peer: payload.peer,
                    stream: payload.stream,
                }
            }
            "streamunpublished" => {
                let payload: StreamPayload = serde_json::from_value(data)?;
                ServerNotification::StreamUnpublished {
                    peer: payload.peer,
                    stream: payload.stream,
                }
            }
            "configure" => ServerNotification::Configure(serde_json::from_value(data)?),
            "attributes" => ServerNotification::Attributes(serde_json::from_value(data)?),
            "audiolevels" => ServerNotification::AudioLevels(
                serde_json::from_value::<AudioLevelsPayload>(data)?.levels,
            ),
            "message" => ServerNotification::Message(data),
            other => ServerNotification::Unknown {
                event: other.to_string(),
                data,
            },
        };
        Ok(notification)
    }
}
