use serde::{Deserialize, Deserializer, Serialize};

/// Free-form stream attributes set by the publisher
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A stream announced by a peer in the room roster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishedStream {
    pub stream_id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Peer data as carried in roster snapshots and peer notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(alias = "id")]
    pub peer_id: String,
    #[serde(default)]
    pub streams: Vec<PublishedStream>,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            streams: Vec::new(),
        }
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.iter().any(|s| s.stream_id == stream_id)
    }
}

/// Room snapshot returned by `join`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoomInfo {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

/// Media kind of a track or transceiver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// ICE server configuration for WebRTC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Which ICE candidates the peer connection may use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Claims carried by the room access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user: String,
    pub room: String,
    pub appkey: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub ice_transport_policy: IceTransportPolicy,
    #[serde(default, alias = "wsUrl")]
    pub signaling_url: Option<String>,
}

/// `urls` may be a single string or a list
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}
