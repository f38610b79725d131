//! Room signaling channel
//!
//! Maintains exactly one logical connection to the room-signaling endpoint,
//! multiplexes inbound envelopes to registered handlers, and provides a
//! resilient join/leave/heartbeat/send surface. The transport is recreated
//! on every reconnect; the handler registry, current room, and pending
//! buffer persist until an explicit full [`disconnect`](SignalingChannel::disconnect).

use crate::config::RtcConfig;
use crate::signaling::buffer::PendingBuffer;
use crate::signaling::envelope::{Envelope, WEBRTC_PREFIX};
use crate::signaling::transport::{SignalingConnector, TransportSink, TransportStream, WsConnector};
use crate::Result;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Handle returned by [`SignalingChannel::on`], used to unregister the
/// handler again with [`SignalingChannel::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Inbound envelope handler
///
/// Handlers run on the channel's read pump in registration order. A
/// returned error is logged and does not stop later handlers.
pub type EnvelopeHandler = Arc<dyn Fn(&Envelope) -> Result<()> + Send + Sync>;

struct RegisteredHandler {
    id: HandlerId,
    handler: EnvelopeHandler,
}

/// Diagnostic snapshot of channel memory use
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Currently buffered unrouted envelopes
    pub buffered_envelopes: usize,
    /// Configured buffer bound
    pub buffer_capacity: usize,
    /// Handlers across all tags
    pub total_handlers: usize,
    /// Handler count per tag
    pub handlers_by_tag: HashMap<String, usize>,
    /// Whether the transport is currently open
    pub connected: bool,
}

struct Shared {
    writer: Mutex<Option<TransportSink>>,
    connected: AtomicBool,
    current_room: std::sync::Mutex<Option<String>>,
    join_request_sent: AtomicBool,
    reconnect_attempts: AtomicU32,
    handlers: RwLock<HashMap<String, Vec<RegisteredHandler>>>,
    pending: Mutex<PendingBuffer>,
    next_handler_id: AtomicU64,
    // Bumped to invalidate the running supervisor/pump/rejoin tasks.
    epoch: watch::Sender<u64>,
    supervisor_active: AtomicBool,
}

/// One logical connection to the backend's room namespace
///
/// Single instance per session; construct it explicitly and share it via
/// `Arc` with the peer session manager and the host UI.
pub struct SignalingChannel {
    config: Arc<RtcConfig>,
    connector: Arc<dyn SignalingConnector>,
    shared: Arc<Shared>,
}

impl SignalingChannel {
    /// Create a channel over the production WebSocket transport
    pub fn new(config: RtcConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Create a channel over a custom transport connector
    pub fn with_connector(
        config: RtcConfig,
        connector: Arc<dyn SignalingConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let (epoch, _) = watch::channel(0u64);
        let pending = PendingBuffer::new(config.buffer_capacity);
        Ok(Self {
            config: Arc::new(config),
            connector,
            shared: Arc::new(Shared {
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                current_room: std::sync::Mutex::new(None),
                join_request_sent: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(pending),
                next_handler_id: AtomicU64::new(1),
                epoch,
                supervisor_active: AtomicBool::new(false),
            }),
        })
    }

    /// Open the transport and keep it open until [`disconnect`](Self::disconnect)
    ///
    /// Without an auth token no connection is attempted; the condition is
    /// logged and the caller is expected to call [`reconnect`](Self::reconnect)
    /// once authenticated.
    pub fn start(&self) {
        self.spawn_supervisor(false);
    }

    /// Tear down the transport and connect fresh, preserving registered
    /// handlers and resetting the attempt counter
    pub async fn reconnect(&self) {
        info!("Manual signaling reconnect requested");
        self.teardown_transport(false).await;
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
        self.spawn_supervisor(true);
    }

    /// Leave the current room, close the transport, and clear all handlers
    /// and buffered state
    pub async fn disconnect(&self) {
        let room = self.shared.current_room.lock().unwrap().clone();
        if let Some(room) = room {
            self.leave_room(&room).await;
        }
        self.teardown_transport(true).await;
    }

    /// Whether the transport is currently open
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The room this channel currently tracks as joined, if any
    pub fn current_room(&self) -> Option<String> {
        self.shared.current_room.lock().unwrap().clone()
    }

    /// Request to join a room
    ///
    /// Idempotent per room key: a second call with the same key while the
    /// first request is outstanding is a no-op. The request is not queued
    /// when the transport is closed; the post-reconnect rejoin path (or the
    /// caller) retries.
    pub async fn join_room(&self, room_key: &str) {
        {
            let mut room = self.shared.current_room.lock().unwrap();
            if self.shared.join_request_sent.load(Ordering::SeqCst)
                && room.as_deref() == Some(room_key)
            {
                warn!(room_key, "Join request already sent, skipping duplicate");
                return;
            }
            if room.as_deref() != Some(room_key) {
                self.shared.join_request_sent.store(false, Ordering::SeqCst);
            }
            *room = Some(room_key.to_string());
        }

        if !self.shared.connected.load(Ordering::SeqCst) {
            warn!(room_key, "Cannot join room, signaling not connected");
            return;
        }
        if Self::send_on(&self.shared, &Envelope::join_room(room_key)).await {
            self.shared.join_request_sent.store(true, Ordering::SeqCst);
        }
    }

    /// Leave a room (best-effort send) and clear the join state when the
    /// key matches the tracked room
    pub async fn leave_room(&self, room_key: &str) {
        if self.shared.connected.load(Ordering::SeqCst) {
            Self::send_on(&self.shared, &Envelope::leave_room(room_key)).await;
        }
        let mut room = self.shared.current_room.lock().unwrap();
        if room.as_deref() == Some(room_key) {
            *room = None;
            self.shared.join_request_sent.store(false, Ordering::SeqCst);
        }
    }

    /// Send a heartbeat for the given room (fire-and-forget)
    pub async fn send_heartbeat(&self, room_key: &str) {
        Self::send_on(&self.shared, &Envelope::heartbeat(room_key)).await;
    }

    /// Send an arbitrary envelope (fire-and-forget, failures logged)
    pub async fn send(&self, envelope: Envelope) {
        Self::send_on(&self.shared, &envelope).await;
    }

    /// Register a handler for an envelope tag
    ///
    /// Handlers for one tag run in registration order. For `webrtc_*` tags
    /// any buffered envelopes of that tag are replayed to the new handler
    /// immediately, in arrival order.
    pub async fn on(&self, tag: &str, handler: EnvelopeHandler) -> HandlerId {
        let id = HandlerId(self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut registry = self.shared.handlers.write().await;
            registry
                .entry(tag.to_string())
                .or_default()
                .push(RegisteredHandler {
                    id,
                    handler: handler.clone(),
                });
        }
        debug!(tag, "Registered signaling handler");

        if tag.starts_with(WEBRTC_PREFIX) {
            let drained = self.shared.pending.lock().await.drain_tag(tag);
            if !drained.is_empty() {
                debug!(tag, count = drained.len(), "Replaying buffered envelopes");
            }
            for envelope in drained {
                if let Err(e) = handler(&envelope) {
                    warn!(tag, "Buffered envelope replay failed: {}", e);
                }
            }
        }
        id
    }

    /// Unregister one handler; no-op if it is not registered
    pub async fn off(&self, tag: &str, id: HandlerId) {
        let mut registry = self.shared.handlers.write().await;
        if let Some(list) = registry.get_mut(tag) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                registry.remove(tag);
            }
        }
    }

    /// Diagnostic snapshot of buffer and handler usage
    pub async fn memory_stats(&self) -> MemoryStats {
        let registry = self.shared.handlers.read().await;
        let handlers_by_tag: HashMap<String, usize> = registry
            .iter()
            .map(|(tag, list)| (tag.clone(), list.len()))
            .collect();
        let total_handlers = handlers_by_tag.values().sum();
        let pending = self.shared.pending.lock().await;
        MemoryStats {
            buffered_envelopes: pending.len(),
            buffer_capacity: pending.capacity(),
            total_handlers,
            handlers_by_tag,
            connected: self.shared.connected.load(Ordering::SeqCst),
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn spawn_supervisor(&self, force: bool) {
        if self.shared.supervisor_active.swap(true, Ordering::SeqCst) && !force {
            debug!("Signaling supervisor already running");
            return;
        }

        let config = Arc::clone(&self.config);
        let connector = Arc::clone(&self.connector);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let mut epoch_rx = shared.epoch.subscribe();
            let my_epoch = *epoch_rx.borrow_and_update();

            loop {
                let Some(url) = config.connection_url() else {
                    warn!("No auth token available, not connecting to signaling");
                    break;
                };

                match connector.connect(&url).await {
                    Ok((sink, stream)) => {
                        info!("Signaling channel connected");
                        shared.reconnect_attempts.store(0, Ordering::SeqCst);
                        *shared.writer.lock().await = Some(sink);
                        shared.connected.store(true, Ordering::SeqCst);

                        Self::spawn_rejoin(&shared, &config, my_epoch);
                        Self::pump(&shared, &config, stream, &mut epoch_rx).await;

                        shared.connected.store(false, Ordering::SeqCst);
                        *shared.writer.lock().await = None;
                        if *epoch_rx.borrow() != my_epoch {
                            return;
                        }
                        info!("Signaling transport closed");
                    }
                    Err(e) => {
                        warn!("Signaling connect failed: {}", e);
                    }
                }

                let attempts = shared.reconnect_attempts.load(Ordering::SeqCst);
                if !config.reconnect.should_retry(attempts) {
                    error!(
                        attempts,
                        "Max signaling reconnection attempts reached, waiting for manual reconnect"
                    );
                    break;
                }
                let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = config.reconnect.delay_for(attempt);
                info!(
                    attempt,
                    max = config.reconnect.max_attempts,
                    ?delay,
                    "Reconnecting to signaling"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = epoch_rx.changed() => return,
                }
                if *epoch_rx.borrow() != my_epoch {
                    return;
                }
            }

            if *epoch_rx.borrow() == my_epoch {
                shared.supervisor_active.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Re-send the join request shortly after a reconnect, giving the
    /// server time to clean up the prior session first.
    fn spawn_rejoin(shared: &Arc<Shared>, config: &Arc<RtcConfig>, my_epoch: u64) {
        let Some(room) = shared.current_room.lock().unwrap().clone() else {
            return;
        };
        info!(room_key = %room, "Rejoining room after reconnect");
        let shared = Arc::clone(shared);
        let delay = config.rejoin_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if *shared.epoch.borrow() != my_epoch {
                return;
            }
            shared.join_request_sent.store(false, Ordering::SeqCst);
            if shared.current_room.lock().unwrap().as_deref() != Some(room.as_str()) {
                return;
            }
            if Self::send_on(&shared, &Envelope::join_room(&room)).await {
                shared.join_request_sent.store(true, Ordering::SeqCst);
            }
        });
    }

    async fn pump(
        shared: &Arc<Shared>,
        config: &Arc<RtcConfig>,
        mut stream: TransportStream,
        epoch_rx: &mut watch::Receiver<u64>,
    ) {
        let start = tokio::time::Instant::now();
        let mut heartbeat =
            tokio::time::interval_at(start + config.heartbeat_interval(), config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut janitor =
            tokio::time::interval_at(start + config.sweep_interval(), config.sweep_interval());
        janitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(text)) => Self::dispatch(shared, &text).await,
                    Some(Err(e)) => {
                        warn!("Signaling transport error: {}", e);
                        return;
                    }
                    None => return,
                },
                _ = heartbeat.tick() => {
                    let room = shared.current_room.lock().unwrap().clone();
                    if let Some(room) = room {
                        Self::send_on(shared, &Envelope::heartbeat(&room)).await;
                    }
                }
                _ = janitor.tick() => Self::janitor_sweep(shared, config).await,
                _ = epoch_rx.changed() => return,
            }
        }
    }

    async fn dispatch(shared: &Arc<Shared>, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed signaling frame: {}", e);
                return;
            }
        };

        let handlers: Vec<EnvelopeHandler> = {
            let registry = shared.handlers.read().await;
            registry
                .get(&envelope.tag)
                .map(|list| list.iter().map(|r| Arc::clone(&r.handler)).collect())
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            if envelope.is_webrtc() {
                let mut pending = shared.pending.lock().await;
                pending.push(envelope);
                debug!(
                    buffered = pending.len(),
                    "No handler yet, buffering peer-negotiation envelope"
                );
            } else {
                debug!(tag = %envelope.tag, "No handler registered, dropping envelope");
            }
            return;
        }

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler(&envelope) {
                warn!(tag = %envelope.tag, index, "Envelope handler failed: {}", e);
            }
        }
    }

    async fn janitor_sweep(shared: &Arc<Shared>, config: &Arc<RtcConfig>) {
        let removed = shared.pending.lock().await.sweep(config.buffer_ttl());
        if removed > 0 {
            info!(removed, "Evicted stale buffered envelopes");
        }
        let registry = shared.handlers.read().await;
        for (tag, list) in registry.iter() {
            if list.len() > config.handler_warn_threshold {
                warn!(
                    tag = %tag,
                    count = list.len(),
                    "Handler list exceeds sanity threshold, possible leak"
                );
            }
        }
    }

    async fn send_on(shared: &Shared, envelope: &Envelope) -> bool {
        let mut writer = shared.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            warn!(tag = %envelope.tag, "Cannot send, signaling transport not connected");
            return false;
        };
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(tag = %envelope.tag, "Failed to encode envelope: {}", e);
                return false;
            }
        };
        match sink.send(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tag = %envelope.tag, "Signaling send failed: {}", e);
                false
            }
        }
    }

    async fn teardown_transport(&self, full: bool) {
        self.shared.epoch.send_modify(|e| *e += 1);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.supervisor_active.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        if full {
            self.shared.handlers.write().await.clear();
            self.shared.pending.lock().await.clear();
            *self.shared.current_room.lock().unwrap() = None;
            self.shared.join_request_sent.store(false, Ordering::SeqCst);
        }
    }
}
