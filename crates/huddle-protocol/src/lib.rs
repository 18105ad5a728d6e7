//! Huddle signaling protocol
//!
//! Wire types shared between the room session engine and a signaling server:
//! command/event envelopes, request and response payloads, and the roster
//! types carried inside them.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
