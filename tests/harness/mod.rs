//! In-process signaling fixtures for integration tests
//!
//! Two transport stand-ins plug into [`SignalingChannel`] via its
//! connector seam:
//!
//! - [`ScriptedConnector`] records every frame a channel sends and lets the
//!   test inject inbound frames or drop the transport, for exercising the
//!   channel and a single session in isolation.
//! - [`FakeHub`] speaks the room protocol for several clients at once
//!   (join/leave broadcasts, heartbeat acks, `targetUserId` →
//!   `fromUserId` rewriting), for real two-party negotiation tests.

#![allow(dead_code)]

use futures::StreamExt;
use speakaz_rtc::signaling::transport::{TransportSink, TransportStream};
use speakaz_rtc::{Envelope, Error, Result, RtcConfig, SignalingConnector};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Config tuned for fast tests: authenticated, millisecond backoff
pub fn test_config() -> RtcConfig {
    RtcConfig {
        signaling_url: "ws://localhost:9/ws/rooms".to_string(),
        auth_token: Some("test-token".to_string()),
        reconnect: speakaz_rtc::ReconnectPolicy {
            max_attempts: 5,
            delay_base_ms: 10,
        },
        rejoin_delay_ms: 10,
        ..Default::default()
    }
}

/// Poll `probe` until it returns true or the timeout elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ----------------------------------------------------------------------
// Scripted single-client transport
// ----------------------------------------------------------------------

#[derive(Default)]
struct ScriptedState {
    sent: Mutex<Vec<Envelope>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<String>>>>,
    connects: AtomicUsize,
    fail_connects: AtomicBool,
}

/// Connector whose transports are driven by the test
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<ScriptedState>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the channel has (re)connected
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Make every subsequent connect attempt fail
    pub fn set_fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Frames the channel has sent, in order, across all connections
    pub fn sent(&self) -> Vec<Envelope> {
        self.state.sent.lock().unwrap().clone()
    }

    /// Sent frames with the given tag
    pub fn sent_of(&self, tag: &str) -> Vec<Envelope> {
        self.sent().into_iter().filter(|e| e.tag == tag).collect()
    }

    /// Inject an inbound envelope into the live transport
    pub fn inject(&self, envelope: &Envelope) {
        self.inject_raw(envelope.to_json().unwrap());
    }

    /// Inject a raw inbound frame into the live transport
    pub fn inject_raw(&self, text: String) {
        let inbound = self.state.inbound.lock().unwrap();
        inbound
            .as_ref()
            .expect("no live transport to inject into")
            .send(Ok(text))
            .expect("transport stream closed");
    }

    /// Drop the live transport, as a server-side close would
    pub fn close_transport(&self) {
        self.state.inbound.lock().unwrap().take();
    }
}

#[async_trait::async_trait]
impl SignalingConnector for ScriptedConnector {
    async fn connect(&self, _url: &url::Url) -> Result<(TransportSink, TransportStream)> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connects.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("scripted connect failure".to_string()));
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        *self.state.inbound.lock().unwrap() = Some(in_tx);

        let state = Arc::clone(&self.state);
        let sink: TransportSink = Box::pin(futures::sink::unfold(
            state,
            |state, text: String| async move {
                let envelope = Envelope::from_json(&text)?;
                debug!(tag = %envelope.tag, "Scripted transport captured frame");
                state.sent.lock().unwrap().push(envelope);
                Ok::<_, Error>(state)
            },
        ));

        let stream: TransportStream = UnboundedReceiverStream::new(in_rx).boxed();
        Ok((sink, stream))
    }
}

// ----------------------------------------------------------------------
// Multi-client fake hub
// ----------------------------------------------------------------------

struct HubInner {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<Result<String>>>>,
    rooms: Mutex<HashMap<String, Vec<(String, String)>>>,
}

/// An in-process stand-in for the backend room namespace
#[derive(Clone)]
pub struct FakeHub {
    inner: Arc<HubInner>,
}

impl Default for FakeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A connector that identifies its channel as the given user
    pub fn connector(&self, user_id: &str, username: &str) -> Arc<HubConnector> {
        Arc::new(HubConnector {
            inner: Arc::clone(&self.inner),
            user_id: user_id.to_string(),
            username: username.to_string(),
        })
    }
}

impl HubInner {
    fn deliver(&self, user_id: &str, frame: Value) {
        let clients = self.clients.lock().unwrap();
        if let Some(tx) = clients.get(user_id) {
            let _ = tx.send(Ok(frame.to_string()));
        }
    }

    fn handle_frame(&self, user_id: &str, username: &str, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(_) => return,
        };
        let room_key = envelope.room_key.clone().unwrap_or_default();

        match envelope.tag.as_str() {
            "join_room" => {
                let roster: Vec<(String, String)> = {
                    let mut rooms = self.rooms.lock().unwrap();
                    let members = rooms.entry(room_key.clone()).or_default();
                    if !members.iter().any(|(id, _)| id == user_id) {
                        members.push((user_id.to_string(), username.to_string()));
                    }
                    members.clone()
                };

                let participants: Vec<Value> = roster
                    .iter()
                    .map(|(id, name)| json!({"userId": id, "username": name}))
                    .collect();
                self.deliver(
                    user_id,
                    json!({"type": "room_joined", "participants": participants}),
                );

                for (id, _) in &roster {
                    if id != user_id {
                        self.deliver(
                            id,
                            json!({
                                "type": "participant_joined",
                                "userId": user_id,
                                "username": username,
                            }),
                        );
                    }
                }
            }
            "leave_room" => {
                let remaining: Vec<String> = {
                    let mut rooms = self.rooms.lock().unwrap();
                    if let Some(members) = rooms.get_mut(&room_key) {
                        members.retain(|(id, _)| id != user_id);
                        members.iter().map(|(id, _)| id.clone()).collect()
                    } else {
                        Vec::new()
                    }
                };
                for id in remaining {
                    self.deliver(&id, json!({"type": "participant_left", "userId": user_id}));
                }
            }
            "heartbeat" => {
                self.deliver(user_id, json!({"type": "heartbeat_ack"}));
            }
            tag if tag.starts_with("webrtc_") => {
                let Some(target) = envelope.target_user_id().map(str::to_string) else {
                    return;
                };
                let mut data = match envelope.payload.get("data") {
                    Some(Value::Object(map)) => map.clone(),
                    _ => return,
                };
                data.remove("targetUserId");
                data.insert("fromUserId".to_string(), json!(user_id));
                self.deliver(&target, json!({"type": tag, "data": data}));
            }
            _ => {}
        }
    }
}

/// Connector half of [`FakeHub`]
pub struct HubConnector {
    inner: Arc<HubInner>,
    user_id: String,
    username: String,
}

#[async_trait::async_trait]
impl SignalingConnector for HubConnector {
    async fn connect(&self, _url: &url::Url) -> Result<(TransportSink, TransportStream)> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.inner
            .clients
            .lock()
            .unwrap()
            .insert(self.user_id.clone(), in_tx);

        let ctx = (
            Arc::clone(&self.inner),
            self.user_id.clone(),
            self.username.clone(),
        );
        let sink: TransportSink = Box::pin(futures::sink::unfold(
            ctx,
            |(inner, user_id, username), text: String| async move {
                inner.handle_frame(&user_id, &username, &text);
                Ok::<_, Error>((inner, user_id, username))
            },
        ));

        let stream: TransportStream = UnboundedReceiverStream::new(in_rx).boxed();
        Ok((sink, stream))
    }
}
