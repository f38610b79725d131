//! Media seams: local capture and remote streams
//!
//! The engine owns track lifecycles but never touches a microphone itself —
//! platform capture is a host concern behind [`MediaSource`]. The default
//! source hands out a single Opus track that the host's capture loop feeds
//! via [`LocalAudioTrack::write_sample`]; tests substitute sources that
//! fail or stall to exercise the session lifecycle.

use crate::config::CaptureConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// One local audio track plus its mute flag
///
/// The underlying track is shared by reference across every peer
/// connection — one physical capture feeds N links. Muting disables the
/// flag; the sample writer drops frames while disabled rather than
/// stopping the track, so unmuting needs no renegotiation.
pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalAudioTrack {
    /// Wrap an existing local track, initially enabled
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The underlying track, for attaching to peer connections
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Whether samples are currently forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Toggle sample forwarding
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Write one captured sample; silently dropped while disabled
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to write audio sample: {}", e)))
    }
}

/// The local capture stream: the microphone's tracks plus liveness state
pub struct LocalAudioStream {
    id: String,
    tracks: Vec<LocalAudioTrack>,
    active: AtomicBool,
}

impl LocalAudioStream {
    /// Assemble a stream from already-created tracks
    pub fn new(id: impl Into<String>, tracks: Vec<LocalAudioTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            active: AtomicBool::new(true),
        }
    }

    /// Build a stream with a single Opus track, the shape every voice
    /// session uses
    pub fn opus() -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", id),
            format!("stream-{}", id),
        ));
        Self::new(id, vec![LocalAudioTrack::new(track)])
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stream's tracks
    pub fn tracks(&self) -> &[LocalAudioTrack] {
        &self.tracks
    }

    /// Toggle every track's enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    /// Whether any track currently forwards samples
    pub fn is_enabled(&self) -> bool {
        self.tracks.iter().any(LocalAudioTrack::is_enabled)
    }

    /// Whether the stream has not been stopped
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the stream: disable every track and mark it inactive. The
    /// host's capture loop observes this and stops pumping samples.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.set_enabled(false);
    }
}

/// A remote participant's incoming media
///
/// Wraps the remote track surfaced by the peer connection. `stop()` marks
/// the stream inactive; the host's playback path observes the flag (and the
/// deafen flag on the session) and halts output.
pub struct RemoteStream {
    peer_id: String,
    stream_id: String,
    track: Arc<TrackRemote>,
    active: AtomicBool,
}

impl RemoteStream {
    /// Wrap a remote track received from the given participant
    pub fn new(peer_id: impl Into<String>, track: Arc<TrackRemote>) -> Self {
        let stream_id = track.stream_id();
        Self {
            peer_id: peer_id.into(),
            stream_id,
            track,
            active: AtomicBool::new(true),
        }
    }

    /// The participant this stream belongs to
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The remote stream (msid) identifier; may be empty when the sender
    /// did not signal one
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The underlying remote track, for the host's playback reader
    pub fn track(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.track)
    }

    /// Whether playback should continue
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Halt playback of this stream
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Source of the local capture stream
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire the local audio stream, honoring the capture constraints as
    /// far as the platform allows. Denied or missing capture devices
    /// surface as [`Error::MediaAccessDenied`].
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Arc<LocalAudioStream>>;
}

/// Default source: one Opus track fed by the host's capture loop
///
/// The constraints are recorded for the host to apply in its platform
/// capture pipeline; the engine itself only manages the track.
pub struct OpusCaptureSource;

#[async_trait]
impl MediaSource for OpusCaptureSource {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Arc<LocalAudioStream>> {
        debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "Opening local Opus capture stream"
        );
        Ok(Arc::new(LocalAudioStream::opus()))
    }
}
