//! Error types for the SpeakAz RTC engine

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling and peer-session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Microphone capture could not be acquired
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// An operation required the signaling channel but it is not connected
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// An SDP or ICE step of a peer negotiation failed
    #[error("Peer negotiation failed: {0}")]
    PeerNegotiationFailed(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// An async operation completed after its session was torn down
    #[error("Operation canceled: {0}")]
    Canceled(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingUnavailable(_) | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    /// Check if this error aborts a whole session rather than one peer
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::MediaAccessDenied(_) | Error::InvalidConfig(_) | Error::Canceled(_)
        )
    }

    /// Check if this error is scoped to a single peer negotiation
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_) | Error::PeerNegotiationFailed(_) | Error::WebRtcError(_)
        )
    }
}
