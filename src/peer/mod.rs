//! Peer sessions: media seams, per-participant links, and the manager
//! that drives negotiation over the signaling channel

pub mod link;
pub mod media;
pub mod session;

pub use link::{LinkState, PeerLink};
pub use media::{
    LocalAudioStream, LocalAudioTrack, MediaSource, OpusCaptureSource, RemoteStream,
};
pub use session::{PeerSessionManager, SessionSnapshot};
