//! Peer session manager
//!
//! Owns local capture, negotiates one peer link per remote participant
//! through the signaling channel, and surfaces remote audio plus
//! connection-state changes to the host. One instance per "being in a
//! room"; construct it with its signaling channel and media source
//! injected, and share nothing globally.
//!
//! Envelopes from the channel flow through one serial queue, so per-peer
//! offer → answer → candidate order follows arrival order. Messages that
//! arrive before [`initialize`](PeerSessionManager::initialize) completes
//! are parked and drained through the same path once the session is live.

use crate::config::RtcConfig;
use crate::peer::link::{LinkState, PeerLink};
use crate::peer::media::{LocalAudioStream, MediaSource, RemoteStream};
use crate::signaling::channel::{EnvelopeHandler, HandlerId, SignalingChannel};
use crate::signaling::envelope::{tags, Envelope};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::track::track_remote::TrackRemote;

/// Window during which a repeated `participant_left` for the same user is
/// treated as a duplicate delivery and ignored
const LEAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Host callback: a remote participant's stream became available
pub type RemoteStreamHandler = Box<dyn Fn(&str, Arc<RemoteStream>) + Send + Sync>;

/// Host callback: a remote participant's stream went away
pub type RemoteStreamRemovedHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Host callback: a peer link changed state
pub type ConnectionStateHandler = Box<dyn Fn(&str, LinkState) + Send + Sync>;

/// Diagnostic snapshot of the session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Whether the session is live
    pub initialized: bool,
    /// Room this session is scoped to
    pub room_key: Option<String>,
    /// Local user id
    pub user_id: Option<String>,
    /// Whether the local capture stream is held and active
    pub local_stream_active: bool,
    /// Local track count
    pub local_track_count: usize,
    /// Open peer links
    pub peer_count: usize,
    /// Recorded remote streams
    pub remote_stream_count: usize,
    /// Envelopes parked before initialization completed
    pub queued_envelopes: usize,
    /// Whether remote playback is deafened
    pub deafened: bool,
    /// Host callback presence, for debugging wiring problems
    pub has_remote_stream_handler: bool,
    /// See `has_remote_stream_handler`
    pub has_remote_stream_removed_handler: bool,
    /// See `has_remote_stream_handler`
    pub has_connection_state_handler: bool,
}

struct SessionShared {
    initialized: AtomicBool,
    // Bumped on every teardown; async completions compare it to detect
    // that their session was superseded.
    generation: AtomicU64,
    deafened: AtomicBool,
    room_key: Mutex<Option<String>>,
    user_id: Mutex<Option<String>>,
    local: RwLock<Option<Arc<LocalAudioStream>>>,
    peers: RwLock<HashMap<String, Arc<PeerLink>>>,
    remote_streams: RwLock<HashMap<String, Arc<RemoteStream>>>,
    pending: Mutex<VecDeque<Envelope>>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    handler_ids: Mutex<Vec<(&'static str, HandlerId)>>,
    recent_leaves: Mutex<HashMap<String, Instant>>,
    on_remote_stream: std::sync::RwLock<Option<RemoteStreamHandler>>,
    on_remote_stream_removed: std::sync::RwLock<Option<RemoteStreamRemovedHandler>>,
    on_connection_state_change: std::sync::RwLock<Option<ConnectionStateHandler>>,
}

impl SessionShared {
    /// Entry point for envelopes handed over by the signaling channel.
    /// Runs synchronously on the channel's read pump.
    fn enqueue(shared: &Arc<Self>, envelope: Envelope) -> Result<()> {
        if shared.initialized.load(Ordering::SeqCst) {
            return Self::queue_live(shared, envelope);
        }
        let mut pending = shared.pending.lock().unwrap();
        // Re-check under the lock: initialize() drains and flips the flag
        // while holding it, so this cannot race past the drain.
        if shared.initialized.load(Ordering::SeqCst) {
            drop(pending);
            return Self::queue_live(shared, envelope);
        }
        debug!(tag = %envelope.tag, "Session not initialized, parking envelope");
        pending.push_back(envelope);
        Ok(())
    }

    fn queue_live(shared: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let tx = shared.queue_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| Error::SignalingUnavailable("peer session queue closed".to_string())),
            None => Err(Error::SignalingUnavailable(
                "peer session not accepting envelopes".to_string(),
            )),
        }
    }

    async fn record_remote_track(shared: &Arc<Self>, remote_id: &str, track: Arc<TrackRemote>) {
        let stream = Arc::new(RemoteStream::new(remote_id, track));
        if stream.stream_id().is_empty() {
            warn!(remote_id, "Remote track arrived without a stream id");
        }
        shared
            .remote_streams
            .write()
            .await
            .insert(remote_id.to_string(), Arc::clone(&stream));
        debug!(remote_id, stream_id = %stream.stream_id(), "Remote stream recorded");
        if let Some(handler) = shared.on_remote_stream.read().unwrap().as_ref() {
            handler(remote_id, stream);
        }
    }

    /// Tear down one link: close the connection, stop the remote stream,
    /// and tell the host — once.
    async fn remove_peer(shared: &Arc<Self>, remote_id: &str) {
        let link = shared.peers.write().await.remove(remote_id);
        if let Some(link) = &link {
            debug!(remote_id, "Closing peer link");
            if let Err(e) = link.close().await {
                warn!(remote_id, "Error closing peer link: {}", e);
            }
        }

        let stream = shared.remote_streams.write().await.remove(remote_id);
        if let Some(stream) = &stream {
            stream.stop();
        }

        if link.is_some() || stream.is_some() {
            if let Some(handler) = shared.on_remote_stream_removed.read().unwrap().as_ref() {
                handler(remote_id);
            }
        }
    }
}

/// Owns the local capture stream and one peer link per remote participant
#[derive(Clone)]
pub struct PeerSessionManager {
    channel: Arc<SignalingChannel>,
    media: Arc<dyn MediaSource>,
    config: Arc<RtcConfig>,
    shared: Arc<SessionShared>,
}

impl PeerSessionManager {
    /// Create a manager bound to its signaling channel and media source
    pub fn new(
        channel: Arc<SignalingChannel>,
        media: Arc<dyn MediaSource>,
        config: RtcConfig,
    ) -> Self {
        Self {
            channel,
            media,
            config: Arc::new(config),
            shared: Arc::new(SessionShared {
                initialized: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                deafened: AtomicBool::new(false),
                room_key: Mutex::new(None),
                user_id: Mutex::new(None),
                local: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                remote_streams: RwLock::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                queue_tx: Mutex::new(None),
                handler_ids: Mutex::new(Vec::new()),
                recent_leaves: Mutex::new(HashMap::new()),
                on_remote_stream: std::sync::RwLock::new(None),
                on_remote_stream_removed: std::sync::RwLock::new(None),
                on_connection_state_change: std::sync::RwLock::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring the session up for a room: acquire the microphone, register
    /// signaling handlers, then drain everything that arrived early.
    ///
    /// Re-entrant: an already-initialized session is torn down first.
    /// Capture failure is fatal to the attempt and surfaces as
    /// [`Error::MediaAccessDenied`].
    pub async fn initialize(&self, room_key: &str, user_id: &str) -> Result<()> {
        info!(room_key, user_id, "Initializing peer session");

        if self.shared.initialized.load(Ordering::SeqCst) {
            warn!("Peer session already initialized, disconnecting first");
            self.disconnect().await;
        }

        // Defensive: no stale peers, streams, or capture may survive into
        // a fresh session.
        let stale = {
            let peers = self.shared.peers.read().await;
            let streams = self.shared.remote_streams.read().await;
            let local = self.shared.local.read().await;
            !peers.is_empty() || !streams.is_empty() || local.is_some()
        };
        if stale {
            warn!("Stale peer state found before initialization, forcing cleanup");
            self.disconnect().await;
        }

        *self.shared.room_key.lock().unwrap() = Some(room_key.to_string());
        *self.shared.user_id.lock().unwrap() = Some(user_id.to_string());

        let generation = self.shared.generation.load(Ordering::SeqCst);
        let stream = match self.media.open(&self.config.capture).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Local capture failed: {}", e);
                return Err(match e {
                    Error::MediaAccessDenied(_) => e,
                    other => Error::MediaAccessDenied(other.to_string()),
                });
            }
        };

        // A disconnect may have raced the capture acquisition; its result
        // belongs to a dead session and must not leak.
        if self.shared.generation.load(Ordering::SeqCst) != generation {
            warn!("Session torn down during capture acquisition, discarding stream");
            stream.stop();
            return Err(Error::Canceled(
                "initialization superseded by disconnect".to_string(),
            ));
        }
        *self.shared.local.write().await = Some(Arc::clone(&stream));

        let tx = self.spawn_consumer();
        *self.shared.queue_tx.lock().unwrap() = Some(tx);

        if let Err(e) = self.register_signaling_handlers().await {
            error!("Failed to register signaling handlers: {}", e);
            self.release_local().await;
            *self.shared.queue_tx.lock().unwrap() = None;
            return Err(e);
        }

        // Go live and hand the backlog to the consumer in arrival order.
        // Holding the pending lock across the flag flip keeps late
        // handler invocations ordered after the backlog.
        {
            let mut pending = self.shared.pending.lock().unwrap();
            let backlog: Vec<Envelope> = pending.drain(..).collect();
            if !backlog.is_empty() {
                debug!(count = backlog.len(), "Draining parked signaling envelopes");
            }
            for envelope in backlog {
                if let Err(e) = SessionShared::queue_live(&self.shared, envelope) {
                    warn!("Failed to queue parked envelope: {}", e);
                }
            }
            self.shared.initialized.store(true, Ordering::SeqCst);
        }

        info!(room_key, "Peer session initialized");
        Ok(())
    }

    /// Tear everything down: close every link, stop every stream, release
    /// the microphone, unregister handlers, and clear queued state.
    /// Safe to call any number of times.
    pub async fn disconnect(&self) {
        info!("Disconnecting peer session");
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.initialized.store(false, Ordering::SeqCst);

        // Stop accepting envelopes; the consumer ends when the sender drops.
        *self.shared.queue_tx.lock().unwrap() = None;
        self.shared.pending.lock().unwrap().clear();

        let ids: Vec<(&'static str, HandlerId)> =
            self.shared.handler_ids.lock().unwrap().drain(..).collect();
        for (tag, id) in ids {
            self.channel.off(tag, id).await;
        }

        let links: Vec<(String, Arc<PeerLink>)> =
            self.shared.peers.write().await.drain().collect();
        for (remote_id, link) in links {
            debug!(remote_id = %remote_id, "Closing peer link");
            if let Err(e) = link.close().await {
                warn!(remote_id = %remote_id, "Error closing peer link: {}", e);
            }
        }

        let streams: Vec<(String, Arc<RemoteStream>)> =
            self.shared.remote_streams.write().await.drain().collect();
        for (_, stream) in streams {
            stream.stop();
        }

        self.release_local().await;

        *self.shared.on_remote_stream.write().unwrap() = None;
        *self.shared.on_remote_stream_removed.write().unwrap() = None;
        *self.shared.on_connection_state_change.write().unwrap() = None;

        self.shared.recent_leaves.lock().unwrap().clear();
        *self.shared.room_key.lock().unwrap() = None;
        *self.shared.user_id.lock().unwrap() = None;

        info!("Peer session disconnected");
    }

    /// Whether the session is live with a held capture stream
    pub async fn is_ready(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
            && self.shared.local.read().await.is_some()
    }

    /// Diagnostic snapshot
    pub async fn state_snapshot(&self) -> SessionSnapshot {
        let local = self.shared.local.read().await;
        SessionSnapshot {
            initialized: self.shared.initialized.load(Ordering::SeqCst),
            room_key: self.shared.room_key.lock().unwrap().clone(),
            user_id: self.shared.user_id.lock().unwrap().clone(),
            local_stream_active: local.as_ref().is_some_and(|s| s.is_active()),
            local_track_count: local.as_ref().map_or(0, |s| s.tracks().len()),
            peer_count: self.shared.peers.read().await.len(),
            remote_stream_count: self.shared.remote_streams.read().await.len(),
            queued_envelopes: self.shared.pending.lock().unwrap().len(),
            deafened: self.shared.deafened.load(Ordering::SeqCst),
            has_remote_stream_handler: self.shared.on_remote_stream.read().unwrap().is_some(),
            has_remote_stream_removed_handler: self
                .shared
                .on_remote_stream_removed
                .read()
                .unwrap()
                .is_some(),
            has_connection_state_handler: self
                .shared
                .on_connection_state_change
                .read()
                .unwrap()
                .is_some(),
        }
    }

    /// The local capture stream, when held
    pub async fn local_stream(&self) -> Option<Arc<LocalAudioStream>> {
        self.shared.local.read().await.clone()
    }

    /// A remote participant's stream, when present
    pub async fn remote_stream(&self, user_id: &str) -> Option<Arc<RemoteStream>> {
        self.shared.remote_streams.read().await.get(user_id).cloned()
    }

    /// Current state of the link to one participant, when present
    pub async fn link_state(&self, user_id: &str) -> Option<LinkState> {
        let link = self.shared.peers.read().await.get(user_id).cloned()?;
        Some(link.state().await)
    }

    // ------------------------------------------------------------------
    // Host controls
    // ------------------------------------------------------------------

    /// Toggle the microphone without stopping tracks or renegotiating
    pub async fn set_muted(&self, muted: bool) {
        if let Some(local) = self.shared.local.read().await.as_ref() {
            local.set_enabled(!muted);
            info!(muted, "Microphone mute toggled");
        } else {
            debug!(muted, "Mute toggled with no local stream");
        }
    }

    /// Whether the microphone is muted
    pub async fn is_muted(&self) -> bool {
        self.shared
            .local
            .read()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_enabled())
    }

    /// Mute or unmute playback of every remote stream. This is a
    /// device-output flag the host's playback path honors per stream; the
    /// transport keeps flowing.
    pub fn set_deafened(&self, deafened: bool) {
        self.shared.deafened.store(deafened, Ordering::SeqCst);
        info!(deafened, "Remote playback deafen toggled");
    }

    /// Whether remote playback is deafened
    pub fn is_deafened(&self) -> bool {
        self.shared.deafened.load(Ordering::SeqCst)
    }

    /// Register the remote-stream-added callback
    pub fn on_remote_stream<F>(&self, handler: F)
    where
        F: Fn(&str, Arc<RemoteStream>) + Send + Sync + 'static,
    {
        *self.shared.on_remote_stream.write().unwrap() = Some(Box::new(handler));
    }

    /// Register the remote-stream-removed callback
    pub fn on_remote_stream_removed<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.shared.on_remote_stream_removed.write().unwrap() = Some(Box::new(handler));
    }

    /// Register the connection-state-change callback
    pub fn on_connection_state_change<F>(&self, handler: F)
    where
        F: Fn(&str, LinkState) + Send + Sync + 'static,
    {
        *self.shared.on_connection_state_change.write().unwrap() = Some(Box::new(handler));
    }

    /// Send an offer to a participant that is already in the room, e.g.
    /// everyone listed in `room_joined`. Reuses an existing link when one
    /// is open. No-op with a warning when the session is not ready.
    pub async fn create_offer_for_user(&self, user_id: &str) {
        if !self.shared.initialized.load(Ordering::SeqCst)
            || self.shared.local.read().await.is_none()
        {
            warn!(user_id, "Cannot create offer, session not ready");
            return;
        }
        if let Err(e) = self.offer_to(user_id, false).await {
            warn!(user_id, "Failed to create offer: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Signaling intake
    // ------------------------------------------------------------------

    async fn register_signaling_handlers(&self) -> Result<()> {
        const SESSION_TAGS: [&str; 5] = [
            tags::WEBRTC_OFFER,
            tags::WEBRTC_ANSWER,
            tags::WEBRTC_ICE_CANDIDATE,
            tags::PARTICIPANT_JOINED,
            tags::PARTICIPANT_LEFT,
        ];

        for tag in SESSION_TAGS {
            let weak = Arc::downgrade(&self.shared);
            let handler: EnvelopeHandler = Arc::new(move |envelope: &Envelope| {
                let Some(shared) = Weak::upgrade(&weak) else {
                    return Err(Error::SignalingUnavailable(
                        "peer session dropped".to_string(),
                    ));
                };
                SessionShared::enqueue(&shared, envelope.clone())
            });
            let id = self.channel.on(tag, handler).await;
            self.shared.handler_ids.lock().unwrap().push((tag, id));
        }
        debug!("Peer session signaling handlers registered");
        Ok(())
    }

    fn spawn_consumer(&self) -> mpsc::UnboundedSender<Envelope> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                manager.process(envelope).await;
            }
            debug!("Peer session envelope queue drained");
        });
        tx
    }

    async fn process(&self, envelope: Envelope) {
        if !self.shared.initialized.load(Ordering::SeqCst) {
            // Disconnect raced us; drop leftovers instead of leaking them
            // into the next session.
            if self.shared.queue_tx.lock().unwrap().is_some() {
                self.shared.pending.lock().unwrap().push_back(envelope);
            } else {
                debug!(tag = %envelope.tag, "Dropping envelope for torn-down session");
            }
            return;
        }

        match envelope.tag.as_str() {
            tags::WEBRTC_OFFER => self.handle_offer(&envelope).await,
            tags::WEBRTC_ANSWER => self.handle_answer(&envelope).await,
            tags::WEBRTC_ICE_CANDIDATE => self.handle_ice_candidate(&envelope).await,
            tags::PARTICIPANT_JOINED => self.handle_participant_joined(&envelope).await,
            tags::PARTICIPANT_LEFT => self.handle_participant_left(&envelope).await,
            other => warn!(tag = other, "Unexpected envelope routed to peer session"),
        }
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    async fn handle_participant_joined(&self, envelope: &Envelope) {
        let Some(participant) = envelope.joined_participant() else {
            warn!("participant_joined without a usable participant, dropping");
            return;
        };
        let me = self.shared.user_id.lock().unwrap().clone().unwrap_or_default();
        if participant.user_id == me {
            debug!("Ignoring own join event");
            return;
        }

        info!(
            remote_id = %participant.user_id,
            username = %participant.username,
            "Participant joined, sending offer"
        );
        if let Err(e) = self.offer_to(&participant.user_id, true).await {
            warn!(remote_id = %participant.user_id, "Failed to send offer: {}", e);
        }
    }

    async fn handle_participant_left(&self, envelope: &Envelope) {
        let Some(user_id) = envelope.left_user_id() else {
            warn!("participant_left without a user id, dropping");
            return;
        };

        // The backend occasionally delivers the same leave twice in quick
        // succession; treat repeats within the window as duplicates.
        {
            let mut recent = self.shared.recent_leaves.lock().unwrap();
            recent.retain(|_, at| at.elapsed() < LEAVE_DEBOUNCE);
            if recent.contains_key(user_id) {
                debug!(user_id, "Duplicate participant_left, ignoring");
                return;
            }
            recent.insert(user_id.to_string(), Instant::now());
        }

        info!(user_id, "Participant left");
        SessionShared::remove_peer(&self.shared, user_id).await;
    }

    async fn handle_offer(&self, envelope: &Envelope) {
        let Some(offer) = envelope.session_description() else {
            warn!("webrtc_offer without a session description, dropping");
            return;
        };
        let Some(from) = envelope.from_user_id().map(str::to_string) else {
            warn!("webrtc_offer without a sender, dropping");
            return;
        };

        let existing = self.shared.peers.read().await.get(&from).cloned();
        let link = match existing {
            Some(link) if link.has_offer_outstanding() => {
                // Glare: both sides offered at once. The smaller user id
                // keeps its offer; the other side yields and answers.
                let me = self.shared.user_id.lock().unwrap().clone().unwrap_or_default();
                if me.as_str() < from.as_str() {
                    debug!(from = %from, "Offer glare, keeping our own offer");
                    return;
                }
                debug!(from = %from, "Offer glare, yielding to remote offer");
                match self.create_link(&from).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(from = %from, "Failed to rebuild link for remote offer: {}", e);
                        return;
                    }
                }
            }
            Some(link) => link,
            None => match self.create_link(&from).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(from = %from, "Failed to create link for remote offer: {}", e);
                    return;
                }
            },
        };

        let answer = match link.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(from = %from, "Failed to answer offer: {}", e);
                return;
            }
        };

        let room = self.room_key();
        self.send_signal(Envelope::answer(&room, &from, &answer))
            .await;
    }

    async fn handle_answer(&self, envelope: &Envelope) {
        let Some(answer) = envelope.session_description() else {
            warn!("webrtc_answer without a session description, dropping");
            return;
        };
        let Some(from) = envelope.from_user_id() else {
            warn!("webrtc_answer without a sender, dropping");
            return;
        };

        let Some(link) = self.shared.peers.read().await.get(from).cloned() else {
            // Tolerated race: the link went away while the answer was in
            // flight.
            debug!(from, "Answer for unknown peer, ignoring");
            return;
        };
        if let Err(e) = link.accept_answer(answer).await {
            warn!(from, "Failed to apply answer: {}", e);
        }
    }

    async fn handle_ice_candidate(&self, envelope: &Envelope) {
        let Some(candidate) = envelope.ice_candidate_init() else {
            warn!("webrtc_ice_candidate without a candidate, dropping");
            return;
        };
        let Some(from) = envelope.from_user_id() else {
            warn!("webrtc_ice_candidate without a sender, dropping");
            return;
        };

        let Some(link) = self.shared.peers.read().await.get(from).cloned() else {
            debug!(from, "ICE candidate for unknown peer, ignoring");
            return;
        };
        if let Err(e) = link.add_remote_candidate(candidate).await {
            warn!(from, "Failed to add ICE candidate: {}", e);
        }
    }

    /// Offer path shared by `participant_joined` (replace any existing
    /// link) and `create_offer_for_user` (reuse one when open)
    async fn offer_to(&self, remote_id: &str, replace: bool) -> Result<()> {
        let link = if replace {
            self.create_link(remote_id).await?
        } else {
            match self.shared.peers.read().await.get(remote_id).cloned() {
                Some(link) => link,
                None => self.create_link(remote_id).await?,
            }
        };

        let offer = link.create_offer().await?;
        let room = self.room_key();
        self.send_signal(Envelope::offer(&room, remote_id, &offer))
            .await;
        Ok(())
    }

    /// Create a link for a participant, replacing (and closing) any
    /// previous one, attaching local tracks, and wiring its callbacks
    async fn create_link(&self, remote_id: &str) -> Result<Arc<PeerLink>> {
        if let Some(old) = self.shared.peers.write().await.remove(remote_id) {
            warn!(remote_id, "Replacing existing peer link");
            if let Err(e) = old.close().await {
                warn!(remote_id, "Error closing replaced peer link: {}", e);
            }
        }

        let link = Arc::new(PeerLink::connect(remote_id, &self.config).await?);

        if let Some(local) = self.shared.local.read().await.clone() {
            if let Err(e) = link.attach_local(&local).await {
                let _ = link.close().await;
                return Err(e);
            }
        } else {
            warn!(remote_id, "No local stream to attach to peer link");
        }

        self.wire_link(&link);
        self.shared
            .peers
            .write()
            .await
            .insert(remote_id.to_string(), Arc::clone(&link));
        Ok(link)
    }

    fn wire_link(&self, link: &Arc<PeerLink>) {
        let remote_id = link.remote_id().to_string();

        // Each locally gathered candidate goes out immediately, no batching.
        {
            let channel = Arc::clone(&self.channel);
            let room = self.room_key();
            let remote_id = remote_id.clone();
            link.on_ice_candidate(move |candidate| {
                let channel = Arc::clone(&channel);
                let room = room.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(remote_id = %remote_id, "Failed to encode ICE candidate: {}", e);
                            return;
                        }
                    };
                    match Envelope::ice_candidate(&room, &remote_id, &init) {
                        Ok(envelope) => {
                            if channel.is_connected() {
                                channel.send(envelope).await;
                            } else {
                                warn!(
                                    remote_id = %remote_id,
                                    "Signaling unavailable, dropping local ICE candidate"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(remote_id = %remote_id, "Failed to build candidate envelope: {}", e)
                        }
                    }
                })
            });
        }

        // Remote media surfaces as that participant's stream.
        {
            let weak = Arc::downgrade(&self.shared);
            let remote_id = remote_id.clone();
            link.on_track(move |track, _receiver, _transceiver| {
                let weak = weak.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let Some(shared) = Weak::upgrade(&weak) else { return };
                    SessionShared::record_remote_track(&shared, &remote_id, track).await;
                })
            });
        }

        // State changes are forwarded verbatim; loss states also tear the
        // link down.
        {
            let weak = Arc::downgrade(&self.shared);
            let remote_id = remote_id.clone();
            link.watch_state(Arc::new(move |state| {
                let weak = weak.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let Some(shared) = Weak::upgrade(&weak) else { return };
                    if let Some(handler) =
                        shared.on_connection_state_change.read().unwrap().as_ref()
                    {
                        handler(&remote_id, state);
                    }
                    if state.triggers_teardown() {
                        info!(remote_id = %remote_id, %state, "Peer link lost, tearing down");
                        SessionShared::remove_peer(&shared, &remote_id).await;
                    }
                })
            }));
        }
    }

    fn room_key(&self) -> String {
        self.shared
            .room_key
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default()
    }

    async fn send_signal(&self, envelope: Result<Envelope>) {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to build signaling envelope: {}", e);
                return;
            }
        };
        if !self.channel.is_connected() {
            let e = Error::SignalingUnavailable(format!(
                "cannot send {} while signaling is down",
                envelope.tag
            ));
            warn!("{}", e);
            return;
        }
        self.channel.send(envelope).await;
    }

    async fn release_local(&self) {
        if let Some(stream) = self.shared.local.write().await.take() {
            stream.stop();
            debug!("Local capture stream released");
        }
    }
}
