pub mod room;
pub mod session;

pub use room::{RoomSession, StreamDirection, StreamKey, StreamRef};
pub use session::{Session, SessionState};
