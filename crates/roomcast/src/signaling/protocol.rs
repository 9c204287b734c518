//! Room signaling protocol types
//!
//! Socket.IO event names, the typed form of inbound events, and the JSON
//! payload carried by `signal` events (`{"sdp": ..}` or `{"ice": ..}`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Socket.IO event names used by the room server
pub mod events {
    /// Channel connected (local pseudo-event)
    pub const CONNECT: &str = "connect";
    /// Channel disconnected (local pseudo-event)
    pub const DISCONNECT: &str = "disconnect";
    /// Channel or server error
    pub const ERROR: &str = "error";
    /// Chat message, both directions
    pub const MESSAGE: &str = "message";
    /// Roster announcement
    pub const USER_JOINED: &str = "user-joined";
    /// A participant left the room
    pub const USER_LEFT: &str = "user-left";
    /// Remote video mute/unmute
    pub const VIDEO_STATUS_CHANGED: &str = "video-status-changed";
    /// Remote audio mute/unmute
    pub const SOUND_STATUS_CHANGED: &str = "sound-status-changed";
    /// Peer-addressed negotiation payload, both directions
    pub const SIGNAL: &str = "signal";
}

/// SDP message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as exchanged with browsers (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate init dictionary (`{candidate, sdpMid, sdpMLineIndex, usernameFragment}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,

    /// Index of the m-line this candidate belongs to
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,

    /// ICE ufrag
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate for the first m-line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// One decoded negotiation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

#[derive(Serialize)]
struct SdpEnvelope<'a> {
    sdp: &'a SessionDescription,
}

#[derive(Serialize)]
struct IceEnvelope<'a> {
    ice: &'a IceCandidate,
}

impl SignalMessage {
    /// Decode a `signal` payload into every message it carries.
    ///
    /// `sdp` and `ice` are independent fields: each is tried on its own and a
    /// payload carrying both yields both (description first). A malformed
    /// field is logged and skipped without discarding the other one.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object or carries
    /// neither field.
    pub fn decode(payload: &Value) -> Result<Vec<SignalMessage>> {
        let object = payload.as_object().ok_or_else(|| {
            Error::InvalidData(format!("signal payload is not an object: {}", payload))
        })?;

        let mut messages = Vec::with_capacity(2);

        if let Some(sdp) = object.get("sdp").filter(|v| !v.is_null()) {
            match serde_json::from_value::<SessionDescription>(sdp.clone()) {
                Ok(desc) => match desc.sdp_type {
                    SdpType::Offer => messages.push(SignalMessage::Offer(desc)),
                    SdpType::Answer => messages.push(SignalMessage::Answer(desc)),
                    other => warn!("Ignoring unsupported description type {:?}", other),
                },
                Err(e) => warn!("Dropping malformed sdp field: {}", e),
            }
        }

        if let Some(ice) = object.get("ice").filter(|v| !v.is_null()) {
            match serde_json::from_value::<IceCandidate>(ice.clone()) {
                Ok(candidate) => messages.push(SignalMessage::IceCandidate(candidate)),
                Err(e) => warn!("Dropping malformed ice field: {}", e),
            }
        }

        if messages.is_empty() && !object.contains_key("sdp") && !object.contains_key("ice") {
            return Err(Error::InvalidData(
                "signal payload has neither sdp nor ice".to_string(),
            ));
        }

        Ok(messages)
    }

    /// Decode a payload received as a JSON string
    pub fn decode_str(payload: &str) -> Result<Vec<SignalMessage>> {
        let value: Value = serde_json::from_str(payload)?;
        Self::decode(&value)
    }

    /// Encode as the string payload of an outbound `signal` event
    pub fn to_payload(&self) -> Result<String> {
        let json = match self {
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => {
                serde_json::to_string(&SdpEnvelope { sdp: desc })?
            }
            SignalMessage::IceCandidate(candidate) => {
                serde_json::to_string(&IceEnvelope { ice: candidate })?
            }
        };
        Ok(json)
    }
}

/// Only offers and answers travel over the signaling channel
impl TryFrom<SessionDescription> for SignalMessage {
    type Error = Error;

    fn try_from(desc: SessionDescription) -> Result<Self> {
        match desc.sdp_type {
            SdpType::Offer => Ok(SignalMessage::Offer(desc)),
            SdpType::Answer => Ok(SignalMessage::Answer(desc)),
            other => Err(Error::SdpError(format!(
                "{:?} descriptions cannot be signaled",
                other
            ))),
        }
    }
}

/// Mute/unmute notification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStatus {
    /// Participant the status belongs to
    pub id: String,

    /// `true` when the media is enabled
    pub status: bool,
}

/// Chat message body (`message` event)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub message: String,
}

/// Kind of media a status record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Sound,
}

/// Typed inbound signaling event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Channel connected
    Connected,
    /// Channel disconnected
    Disconnected { reason: String },
    /// Channel or server error
    Error { detail: String },
    /// Chat line from a participant
    Chat { from: String, body: ChatMessage },
    /// Roster announcement: `id` joined, `peers` is the full member list
    UserJoined {
        id: String,
        count: Option<u64>,
        peers: Vec<String>,
    },
    /// Participant left
    UserLeft { id: String },
    /// Mute/unmute notification
    MediaStatusChanged { kind: MediaKind, status: MediaStatus },
    /// Negotiation payload from `from`
    Signal { from: String, payload: Value },
}

impl InboundEvent {
    /// Build a typed event from a Socket.IO event name and its arguments
    ///
    /// Returns `Ok(None)` for events the client does not handle.
    ///
    /// # Errors
    ///
    /// Returns an error when a known event carries arguments of the wrong shape.
    pub fn parse(name: &str, args: &[Value]) -> Result<Option<InboundEvent>> {
        let event = match name {
            events::CONNECT => InboundEvent::Connected,
            events::DISCONNECT => InboundEvent::Disconnected {
                reason: args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            },
            events::ERROR => InboundEvent::Error {
                detail: args
                    .first()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
            },
            events::MESSAGE => {
                let from = string_arg(name, args, 0)?;
                // (id, avatar, data) from the server; tolerate (id, data)
                let data = args.get(2).or_else(|| args.get(1)).cloned().unwrap_or(Value::Null);
                let body = serde_json::from_value::<ChatMessage>(data).unwrap_or_default();
                InboundEvent::Chat { from, body }
            }
            events::USER_JOINED => {
                let id = string_arg(name, args, 0)?;
                let count = args.get(1).and_then(Value::as_u64);
                let peers = match args.get(2) {
                    Some(list) => serde_json::from_value::<Vec<String>>(list.clone()).map_err(
                        |e| Error::InvalidData(format!("{}: bad peer list: {}", name, e)),
                    )?,
                    None => Vec::new(),
                };
                InboundEvent::UserJoined { id, count, peers }
            }
            events::USER_LEFT => InboundEvent::UserLeft {
                id: string_arg(name, args, 0)?,
            },
            events::VIDEO_STATUS_CHANGED | events::SOUND_STATUS_CHANGED => {
                let kind = if name == events::VIDEO_STATUS_CHANGED {
                    MediaKind::Video
                } else {
                    MediaKind::Sound
                };
                let record = args.first().cloned().unwrap_or(Value::Null);
                let status = serde_json::from_value::<MediaStatus>(record)
                    .map_err(|e| Error::InvalidData(format!("{}: {}", name, e)))?;
                InboundEvent::MediaStatusChanged { kind, status }
            }
            events::SIGNAL => {
                let from = string_arg(name, args, 0)?;
                let payload = match args.get(1) {
                    Some(Value::String(text)) => serde_json::from_str(text).map_err(|e| {
                        Error::InvalidData(format!("signal from {}: undecodable payload: {}", from, e))
                    })?,
                    Some(object @ Value::Object(_)) => object.clone(),
                    Some(other) => {
                        return Err(Error::InvalidData(format!(
                            "signal from {}: unexpected payload {}",
                            from, other
                        )))
                    }
                    None => {
                        return Err(Error::InvalidData(format!(
                            "signal from {}: missing payload",
                            from
                        )))
                    }
                };
                InboundEvent::Signal { from, payload }
            }
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

fn string_arg(event: &str, args: &[Value], index: usize) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidData(format!("{}: argument {} is not a string", event, index)))
}
