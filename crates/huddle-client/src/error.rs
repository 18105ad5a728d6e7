use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Operation attempted while the session is not connected, or a command
    /// was issued while the signaling link is down
    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Signaling transport failed (retried internally before surfacing)
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Server closed the connection with the removal code
    #[error("Connection closed by server")]
    TransportClosedByPeer,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Offer/answer generation or SDP application failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    /// Server answered a command with an error frame
    #[error("Command {command} rejected ({code}): {message}")]
    Rejected {
        command: String,
        code: i32,
        message: String,
    },

    #[error("Invalid token: {0}")]
    Token(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
