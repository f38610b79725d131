//! Per-participant peer connection and its lifecycle state

use crate::config::RtcConfig;
use crate::peer::media::LocalAudioStream;
use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Lifecycle state of a peer link
///
/// Mirrors the connection-state machine of the underlying transport:
/// `New → Connecting → Connected → {Disconnected | Failed} → Closed`.
/// The two loss states trigger automatic teardown of the link; there is no
/// automatic retry — a fresh offer has to be initiated externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link created, negotiation not yet started
    New,
    /// Negotiation or transport establishment in progress
    Connecting,
    /// Media is flowing
    Connected,
    /// Transport lost; the link is torn down
    Disconnected,
    /// Establishment failed; the link is torn down
    Failed,
    /// Link closed locally
    Closed,
}

impl LinkState {
    /// Map a transport state change onto the link machine. Returns `None`
    /// for transitions the machine does not track.
    pub fn from_transport(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        }
    }

    /// Whether entering this state must tear the link down
    pub fn triggers_teardown(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Handler invoked after each tracked link-state transition
pub type LinkStateHandler =
    Arc<dyn Fn(LinkState) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One peer connection to one remote participant
///
/// Exclusively owns its `RTCPeerConnection`; the session manager replaces
/// the whole link (closing the old one) when a duplicate is requested for
/// the same participant.
pub struct PeerLink {
    remote_id: String,
    connection_id: String,
    connection: Arc<RTCPeerConnection>,
    state: Arc<RwLock<LinkState>>,
    // Senders retained so the transport does not drop the tracks.
    senders: RwLock<Vec<Arc<RTCRtpSender>>>,
    offer_outstanding: AtomicBool,
}

impl PeerLink {
    /// Create a peer connection for the given remote participant
    pub async fn connect(remote_id: &str, config: &RtcConfig) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(
            remote_id,
            connection_id = %connection_id,
            "Creating peer link"
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)
                .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?,
        );

        Ok(Self {
            remote_id: remote_id.to_string(),
            connection_id,
            connection,
            state: Arc::new(RwLock::new(LinkState::New)),
            senders: RwLock::new(Vec::new()),
            offer_outstanding: AtomicBool::new(false),
        })
    }

    /// The remote participant's id
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// This link instance's id
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The underlying peer connection
    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.connection
    }

    /// Current link state
    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Whether a locally created offer has not yet been answered
    pub fn has_offer_outstanding(&self) -> bool {
        self.offer_outstanding.load(Ordering::SeqCst)
    }

    async fn set_state(&self, new_state: LinkState) {
        let mut state = self.state.write().await;
        if *state != new_state {
            debug!(
                remote_id = %self.remote_id,
                "Peer link transition: {} -> {}",
                *state,
                new_state
            );
            *state = new_state;
        }
    }

    /// Mirror transport state changes into [`LinkState`] and invoke the
    /// handler after each tracked transition
    pub fn watch_state(&self, on_change: LinkStateHandler) {
        let state = Arc::clone(&self.state);
        let remote_id = self.remote_id.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = Arc::clone(&state);
                let on_change = Arc::clone(&on_change);
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let Some(new_state) = LinkState::from_transport(s) else {
                        return;
                    };
                    {
                        let mut guard = state.write().await;
                        if *guard == new_state {
                            return;
                        }
                        debug!(
                            remote_id = %remote_id,
                            "Peer link transition: {} -> {}",
                            *guard,
                            new_state
                        );
                        *guard = new_state;
                    }
                    on_change(new_state).await;
                })
            }));
    }

    /// Register a callback for remote track arrival
    pub fn on_track<F>(&self, handler: F)
    where
        F: Fn(
                Arc<TrackRemote>,
                Arc<RTCRtpReceiver>,
                Arc<RTCRtpTransceiver>,
            ) -> Pin<Box<dyn Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        self.connection.on_track(Box::new(handler));
    }

    /// Register a callback for locally gathered ICE candidates
    pub fn on_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(Option<RTCIceCandidate>) -> Pin<Box<dyn Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        self.connection.on_ice_candidate(Box::new(handler));
    }

    /// Attach every track of the local stream to this connection
    pub async fn attach_local(&self, stream: &LocalAudioStream) -> Result<()> {
        for track in stream.tracks() {
            let sender = self
                .connection
                .add_track(track.track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to add local track: {}", e)))?;
            self.senders.write().await.push(sender);
        }
        debug!(remote_id = %self.remote_id, "Local tracks attached to peer link");
        Ok(())
    }

    /// Create an offer and install it as the local description
    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::PeerNegotiationFailed(format!("Failed to create offer: {}", e)))?;

        self.connection
            .set_local_description(offer)
            .await
            .map_err(|e| {
                Error::PeerNegotiationFailed(format!("Failed to set local description: {}", e))
            })?;

        let local = self.connection.local_description().await.ok_or_else(|| {
            Error::PeerNegotiationFailed("No local description after setting offer".to_string())
        })?;

        self.offer_outstanding.store(true, Ordering::SeqCst);
        self.set_state(LinkState::Connecting).await;
        debug!(remote_id = %self.remote_id, "Created SDP offer");
        Ok(local)
    }

    /// Apply a remote offer and produce the local answer
    pub async fn accept_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(|e| {
                Error::PeerNegotiationFailed(format!("Failed to set remote description: {}", e))
            })?;

        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::PeerNegotiationFailed(format!("Failed to create answer: {}", e)))?;

        self.connection
            .set_local_description(answer)
            .await
            .map_err(|e| {
                Error::PeerNegotiationFailed(format!("Failed to set local description: {}", e))
            })?;

        let local = self.connection.local_description().await.ok_or_else(|| {
            Error::PeerNegotiationFailed("No local description after setting answer".to_string())
        })?;

        self.set_state(LinkState::Connecting).await;
        debug!(remote_id = %self.remote_id, "Created SDP answer");
        Ok(local)
    }

    /// Apply the remote answer to our outstanding offer
    pub async fn accept_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(|e| {
                Error::PeerNegotiationFailed(format!("Failed to set remote description: {}", e))
            })?;
        self.offer_outstanding.store(false, Ordering::SeqCst);
        self.set_state(LinkState::Connecting).await;
        Ok(())
    }

    /// Add a remote ICE candidate
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| {
                Error::PeerNegotiationFailed(format!("Failed to add ICE candidate: {}", e))
            })
    }

    /// Close the link and its connection
    pub async fn close(&self) -> Result<()> {
        self.set_state(LinkState::Closed).await;
        self.connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            LinkState::from_transport(RTCPeerConnectionState::Connected),
            Some(LinkState::Connected)
        );
        assert_eq!(
            LinkState::from_transport(RTCPeerConnectionState::Failed),
            Some(LinkState::Failed)
        );
        assert_eq!(
            LinkState::from_transport(RTCPeerConnectionState::Unspecified),
            None
        );
    }

    #[test]
    fn test_teardown_states() {
        assert!(LinkState::Disconnected.triggers_teardown());
        assert!(LinkState::Failed.triggers_teardown());
        assert!(!LinkState::Connected.triggers_teardown());
        assert!(!LinkState::Closed.triggers_teardown());
    }

    #[test]
    fn test_state_display_matches_wire_names() {
        assert_eq!(LinkState::Connected.to_string(), "connected");
        assert_eq!(LinkState::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn test_link_starts_new() {
        let config = RtcConfig::default();
        let link = PeerLink::connect("peer-1", &config).await.unwrap();
        assert_eq!(link.remote_id(), "peer-1");
        assert_eq!(link.state().await, LinkState::New);
        assert!(!link.has_offer_outstanding());
    }

    #[tokio::test]
    async fn test_create_offer_marks_outstanding() {
        let config = RtcConfig::default();
        let link = PeerLink::connect("peer-1", &config).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert!(!offer.sdp.is_empty());
        assert!(link.has_offer_outstanding());
        assert_eq!(link.state().await, LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_offer_includes_attached_audio() {
        let config = RtcConfig::default();
        let link = PeerLink::connect("peer-1", &config).await.unwrap();
        let stream = LocalAudioStream::opus();
        link.attach_local(&stream).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert!(offer.sdp.contains("audio"));
    }

    #[tokio::test]
    async fn test_close_is_clean() {
        let config = RtcConfig::default();
        let link = PeerLink::connect("peer-1", &config).await.unwrap();
        link.close().await.unwrap();
        assert_eq!(link.state().await, LinkState::Closed);
    }
}
