//! Signaling envelopes for the room wire protocol
//!
//! Every frame on the room socket is a JSON object with a `type` tag, an
//! optional `roomKey`, and a tag-specific payload. The [`Envelope`] type
//! keeps the payload opaque so the channel can route and buffer messages it
//! does not understand; typed accessors normalize the payload once at this
//! boundary instead of re-deriving field shapes at every use site.
//!
//! The backend is not consistent about payload placement or field casing:
//! peer-negotiation payloads arrive either under `data` or flat on the
//! envelope, and participant objects mix `userId`/`UserId` and
//! `username`/`Username` variants. All of that is absorbed here.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Tag prefix shared by all peer-negotiation envelopes
pub const WEBRTC_PREFIX: &str = "webrtc_";

/// Envelope type tags
pub mod tags {
    pub const JOIN_ROOM: &str = "join_room";
    pub const LEAVE_ROOM: &str = "leave_room";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    pub const ROOM_JOINED: &str = "room_joined";
    pub const PARTICIPANT_JOINED: &str = "participant_joined";
    pub const PARTICIPANT_LEFT: &str = "participant_left";
    pub const JOIN_ROOM_ERROR: &str = "join_room_error";
    pub const AUDIO_BITRATE_CHANGED: &str = "audio_bitrate_changed";
    pub const WEBRTC_OFFER: &str = "webrtc_offer";
    pub const WEBRTC_ANSWER: &str = "webrtc_answer";
    pub const WEBRTC_ICE_CANDIDATE: &str = "webrtc_ice_candidate";
}

/// One signaling message as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Discriminating tag
    #[serde(rename = "type")]
    pub tag: String,

    /// Room this message is scoped to, when room-scoped
    #[serde(rename = "roomKey", skip_serializing_if = "Option::is_none")]
    pub room_key: Option<String>,

    /// Remaining tag-specific fields, kept opaque for routing
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope with no payload beyond the tag and room key
    fn room_scoped(tag: &str, room_key: &str) -> Self {
        Self {
            tag: tag.to_string(),
            room_key: Some(room_key.to_string()),
            payload: Map::new(),
        }
    }

    /// `join_room` request
    pub fn join_room(room_key: &str) -> Self {
        Self::room_scoped(tags::JOIN_ROOM, room_key)
    }

    /// `leave_room` request
    pub fn leave_room(room_key: &str) -> Self {
        Self::room_scoped(tags::LEAVE_ROOM, room_key)
    }

    /// `heartbeat` keep-alive
    pub fn heartbeat(room_key: &str) -> Self {
        Self::room_scoped(tags::HEARTBEAT, room_key)
    }

    /// `webrtc_offer` addressed to one participant
    pub fn offer(
        room_key: &str,
        target_user_id: &str,
        offer: &RTCSessionDescription,
    ) -> Result<Self> {
        Self::signal(tags::WEBRTC_OFFER, room_key, target_user_id, "offer", offer)
    }

    /// `webrtc_answer` addressed to one participant
    pub fn answer(
        room_key: &str,
        target_user_id: &str,
        answer: &RTCSessionDescription,
    ) -> Result<Self> {
        Self::signal(
            tags::WEBRTC_ANSWER,
            room_key,
            target_user_id,
            "answer",
            answer,
        )
    }

    /// `webrtc_ice_candidate` addressed to one participant
    pub fn ice_candidate(
        room_key: &str,
        target_user_id: &str,
        candidate: &RTCIceCandidateInit,
    ) -> Result<Self> {
        Self::signal(
            tags::WEBRTC_ICE_CANDIDATE,
            room_key,
            target_user_id,
            "candidate",
            candidate,
        )
    }

    fn signal<T: Serialize>(
        tag: &str,
        room_key: &str,
        target_user_id: &str,
        key: &str,
        body: &T,
    ) -> Result<Self> {
        let body = serde_json::to_value(body).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize {} payload: {}", tag, e))
        })?;
        let mut data = Map::new();
        data.insert(key.to_string(), body);
        data.insert("targetUserId".to_string(), json!(target_user_id));
        let mut payload = Map::new();
        payload.insert("data".to_string(), Value::Object(data));
        Ok(Self {
            tag: tag.to_string(),
            room_key: Some(room_key.to_string()),
            payload,
        })
    }

    /// Whether this envelope carries a peer-negotiation payload
    pub fn is_webrtc(&self) -> bool {
        self.tag.starts_with(WEBRTC_PREFIX)
    }

    /// Serialize to a wire frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::SerializationError(format!("Failed to serialize envelope: {}", e)))
    }

    /// Parse a wire frame
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::SerializationError(format!("Failed to parse envelope: {}", e)))
    }

    /// The payload object: the `data` sub-object when present, the flat
    /// envelope fields otherwise. Both placements occur on the wire.
    fn payload_object(&self) -> &Map<String, Value> {
        match self.payload.get("data") {
            Some(Value::Object(data)) => data,
            _ => &self.payload,
        }
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload_object().get(key).and_then(Value::as_str)
    }

    /// Sender of a peer-negotiation payload
    pub fn from_user_id(&self) -> Option<&str> {
        self.payload_str("fromUserId")
    }

    /// Addressee of a peer-negotiation payload
    pub fn target_user_id(&self) -> Option<&str> {
        self.payload_str("targetUserId")
    }

    /// Session description carried by a `webrtc_offer`/`webrtc_answer`
    pub fn session_description(&self) -> Option<RTCSessionDescription> {
        let obj = self.payload_object();
        let desc = obj.get("offer").or_else(|| obj.get("answer"))?;
        serde_json::from_value(desc.clone()).ok()
    }

    /// ICE candidate carried by a `webrtc_ice_candidate`
    pub fn ice_candidate_init(&self) -> Option<RTCIceCandidateInit> {
        let candidate = self.payload_object().get("candidate")?;
        serde_json::from_value(candidate.clone()).ok()
    }

    /// The joining participant of a `participant_joined` event
    ///
    /// The server sends either a nested `participant` object or flat
    /// `userId`/`username` fields.
    pub fn joined_participant(&self) -> Option<Participant> {
        match self.payload.get("participant") {
            Some(nested @ Value::Object(_)) => Participant::from_value(nested),
            _ => Participant::from_map(&self.payload),
        }
    }

    /// The departing user id of a `participant_left` event
    pub fn left_user_id(&self) -> Option<&str> {
        self.payload.get("userId").and_then(Value::as_str)
    }

    /// Participant roster of a `room_joined` event, skipping entries the
    /// normalizer rejects
    pub fn room_participants(&self) -> Vec<Participant> {
        self.payload
            .get("participants")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Participant::from_value).collect())
            .unwrap_or_default()
    }

    /// Error text of a `join_room_error`
    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    /// Payload of an `audio_bitrate_changed` event
    pub fn audio_bitrate_change(&self) -> Option<AudioBitrateChanged> {
        Some(AudioBitrateChanged {
            audio_bitrate: self.payload.get("audioBitrate")?.as_u64()? as u32,
            changed_by: self
                .payload
                .get("changedBy")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// A room participant, canonicalized from the server's field variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    /// Stable user identifier
    pub user_id: String,
    /// Display name
    pub username: String,
    /// Whether the participant is muted room-wide
    pub is_muted: bool,
    /// Whether the participant owns the room
    pub is_owner: bool,
    /// Join timestamp as reported by the server
    pub joined_at: Option<String>,
}

impl Participant {
    /// Canonicalize one participant object. Returns `None` when the user id
    /// or username is missing — such entries are dropped at the boundary.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => None,
        }
    }

    fn from_map(map: &Map<String, Value>) -> Option<Self> {
        let user_id = str_field(map, "userId", "UserId")?;
        let username = str_field(map, "username", "Username")?;
        if username.trim().is_empty() {
            return None;
        }
        Some(Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            is_muted: bool_field(map, "isMuted", "IsMuted"),
            is_owner: bool_field(map, "isOwner", "IsOwner"),
            joined_at: str_field(map, "joinedAt", "JoinedAt").map(str::to_string),
        })
    }
}

fn str_field<'a>(map: &'a Map<String, Value>, lower: &str, upper: &str) -> Option<&'a str> {
    map.get(lower)
        .or_else(|| map.get(upper))
        .and_then(Value::as_str)
}

fn bool_field(map: &Map<String, Value>, lower: &str, upper: &str) -> bool {
    map.get(lower)
        .or_else(|| map.get(upper))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Payload of an `audio_bitrate_changed` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioBitrateChanged {
    /// New bitrate in kbps
    pub audio_bitrate: u32,
    /// User who changed it, when reported
    pub changed_by: Option<String>,
}
