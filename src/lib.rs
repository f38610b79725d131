//! Room signaling and WebRTC peer-session engine for the SpeakAz voice
//! chat client
//!
//! This crate is the client-side protocol engine: everything between the
//! backend's room WebSocket and the host's audio playback. It has two
//! cooperating halves:
//!
//! - [`SignalingChannel`] owns the WebSocket to the room namespace. It
//!   serializes JSON envelopes, dispatches inbound messages to type-keyed
//!   handlers, buffers peer-negotiation messages that arrive before their
//!   handler exists, and reconnects with bounded linear backoff.
//! - [`PeerSessionManager`] owns the local capture stream and one
//!   `RTCPeerConnection` per remote participant. It drives the
//!   offer/answer/ICE exchange through the channel and surfaces remote
//!   streams and connection-state changes to the host.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Host UI (rooms, participants, playback)             │
//! │    ↓ callbacks / imperative calls                    │
//! │  PeerSessionManager                                  │
//! │  ├─ MediaSource (microphone seam)                    │
//! │  └─ PeerLink per participant (webrtc)                │
//! │    ↓ envelopes                                       │
//! │  SignalingChannel (JSON over WebSocket)              │
//! │    ↓                                                 │
//! │  SpeakAz backend room namespace                      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Both halves are plain objects constructed by the host — one of each per
//! session, shared via `Arc`, nothing global.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use speakaz_rtc::{OpusCaptureSource, PeerSessionManager, RtcConfig, SignalingChannel};
//!
//! # async fn example() -> speakaz_rtc::Result<()> {
//! let config = RtcConfig {
//!     signaling_url: "wss://api.speakaz.example/ws/rooms".to_string(),
//!     auth_token: Some("jwt".to_string()),
//!     ..Default::default()
//! };
//!
//! let channel = Arc::new(SignalingChannel::new(config.clone())?);
//! channel.start();
//!
//! let session = PeerSessionManager::new(
//!     Arc::clone(&channel),
//!     Arc::new(OpusCaptureSource),
//!     config,
//! );
//!
//! session.on_remote_stream(|user_id, _stream| {
//!     println!("{user_id} is audible");
//! });
//!
//! session.initialize("room-key", "my-user-id").await?;
//! channel.join_room("room-key").await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod peer;
pub mod signaling;

// Re-exports for public API
pub use config::{CaptureConstraints, ReconnectPolicy, RtcConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use peer::{
    LinkState, LocalAudioStream, LocalAudioTrack, MediaSource, OpusCaptureSource, PeerLink,
    PeerSessionManager, RemoteStream, SessionSnapshot,
};
pub use signaling::{
    tags, AudioBitrateChanged, Envelope, EnvelopeHandler, HandlerId, MemoryStats, Participant,
    PendingBuffer, SignalingChannel, SignalingConnector, WsConnector,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
