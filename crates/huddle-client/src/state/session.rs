use huddle_protocol::{IceServer, IceTransportPolicy};

use crate::error::{EngineError, Result};

/// Connection state of a session engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    /// Terminal: a new join needs a new engine
    Disconnected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (New, Connecting)
                | (New, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Identity and connection parameters of the local participant
#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    pub local_user_id: Option<String>,
    pub room: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::New,
            local_user_id: None,
            room: None,
            ice_servers: Vec::new(),
            ice_transport_policy: IceTransportPolicy::All,
        }
    }
}

impl Session {
    /// Move to `next`. Returns `Ok(false)` if already there.
    pub fn transition(&mut self, next: SessionState) -> Result<bool> {
        if self.state == next {
            return Ok(false);
        }
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "cannot move from {} to {}",
                self.state, next
            )));
        }

        tracing::debug!("Session state {} -> {}", self.state, next);
        self.state = next;
        Ok(true)
    }
}
