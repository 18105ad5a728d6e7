pub mod devices;
pub mod peer;
pub mod rtc;
pub mod stream;

pub use devices::{MediaConstraints, MediaDevices, MediaSource};
pub use peer::{
    OfferOptions, PeerConfig, PeerConnection, PeerConnectionFactory, RemoteTrack, SenderId,
    TrackHandler,
};
pub use rtc::{RtcPeerConnection, RtcPeerFactory};
pub use stream::{LocalStream, MediaTrack};
