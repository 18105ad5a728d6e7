//! Huddle client library
//!
//! A room session engine for a selective forwarding media server: a
//! reconnecting signaling channel, the room roster, and per-stream
//! publish/subscribe negotiation behind one [`SessionEngine`].

pub mod capabilities;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod queue;
pub mod signaling;
pub mod state;
pub mod token;

pub use capabilities::PlatformCapabilities;
pub use config::EngineConfig;
pub use engine::SessionEngine;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use state::{SessionState, StreamRef};
