//! Room signaling: wire envelopes, the pending buffer, the transport seam,
//! and the channel that ties them together

pub mod buffer;
pub mod channel;
pub mod envelope;
pub mod transport;

pub use buffer::{BufferedEnvelope, PendingBuffer};
pub use channel::{EnvelopeHandler, HandlerId, MemoryStats, SignalingChannel};
pub use envelope::{tags, AudioBitrateChanged, Envelope, Participant, WEBRTC_PREFIX};
pub use transport::{SignalingConnector, TransportSink, TransportStream, WsConnector};
