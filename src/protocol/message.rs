//! Wire schema for messages crossing the frame boundary
//!
//! Every message is a JSON object `{ "NEAType": kind, "payload": ..., "v": 1 }`.
//! The kind set is closed for a protocol version: anything that does not decode
//! into one of the variants below is rejected at the transport boundary and
//! never reaches a handler.
//!
//! | kind           | app → host            | host → app                 |
//! |----------------|-----------------------|----------------------------|
//! | `Init`         | no payload            | metadata (becomes `meta`)  |
//! | `StateChanged` | diff object           | diff object                |
//! | `Message`      | any value (broadcast) | any value (broadcast)      |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::diff::{Diff, State};
use super::is_truthy;

pub const KIND_FIELD: &str = "NEAType";
pub const PAYLOAD_FIELD: &str = "payload";
pub const VERSION_FIELD: &str = "v";

/// Version stamped on every outgoing message; an absent `v` is read as this
pub const PROTOCOL_VERSION: u64 = 1;

/// Key inside an `Init` payload carrying the host's existing document
pub const INIT_STATE_FIELD: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Init,
    StateChanged,
    Message,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Init,
        MessageKind::StateChanged,
        MessageKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Init => "Init",
            MessageKind::StateChanged => "StateChanged",
            MessageKind::Message => "Message",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a frame was dropped at the boundary. Never surfaced to callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("frame came from a context other than the counterpart")]
    ForeignSender,

    #[error("frame is not decodable: {0}")]
    Undecodable(String),

    #[error("message is not an object")]
    NotAnObject,

    #[error("message has no truthy `NEAType` discriminant")]
    MissingKind,

    #[error("unknown message kind {0}")]
    UnknownKind(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),

    #[error("{kind} payload is malformed: {reason}")]
    MalformedPayload { kind: MessageKind, reason: String },
}

/// Messages the host sends to the app
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Handshake reply; the payload becomes the session's `meta`
    Init { meta: Value },
    /// Authoritative change pushed by the host
    StateChanged { diff: Diff },
    /// Custom broadcast from the host or another app
    Message { payload: Value },
}

/// Messages the app sends to the host
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Handshake request
    Init,
    /// Local mutation, exactly the diff the caller applied
    StateChanged { diff: Diff },
    /// Custom broadcast
    Message { payload: Value },
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Init { .. } => MessageKind::Init,
            InboundMessage::StateChanged { .. } => MessageKind::StateChanged,
            InboundMessage::Message { .. } => MessageKind::Message,
        }
    }

    pub fn from_wire(data: &Value) -> Result<Self, Rejection> {
        let (kind, payload) = open_envelope(data)?;
        Ok(match kind {
            MessageKind::Init => InboundMessage::Init {
                meta: payload.cloned().unwrap_or(Value::Null),
            },
            MessageKind::StateChanged => InboundMessage::StateChanged {
                diff: decode_diff(kind, payload)?,
            },
            MessageKind::Message => InboundMessage::Message {
                payload: payload.cloned().unwrap_or(Value::Null),
            },
        })
    }

    pub fn to_wire(&self) -> Value {
        match self {
            InboundMessage::Init { meta } => seal(self.kind(), Some(meta.clone())),
            InboundMessage::StateChanged { diff } => {
                seal(self.kind(), Some(Value::from(diff.clone())))
            }
            InboundMessage::Message { payload } => seal(self.kind(), Some(payload.clone())),
        }
    }

    /// Document carried by an `Init` payload, if the host already holds one
    pub fn restored_state(meta: &Value) -> Option<&State> {
        meta.get(INIT_STATE_FIELD).and_then(Value::as_object)
    }
}

impl OutboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundMessage::Init => MessageKind::Init,
            OutboundMessage::StateChanged { .. } => MessageKind::StateChanged,
            OutboundMessage::Message { .. } => MessageKind::Message,
        }
    }

    pub fn from_wire(data: &Value) -> Result<Self, Rejection> {
        let (kind, payload) = open_envelope(data)?;
        Ok(match kind {
            MessageKind::Init => OutboundMessage::Init,
            MessageKind::StateChanged => OutboundMessage::StateChanged {
                diff: decode_diff(kind, payload)?,
            },
            MessageKind::Message => OutboundMessage::Message {
                payload: payload.cloned().unwrap_or(Value::Null),
            },
        })
    }

    pub fn to_wire(&self) -> Value {
        match self {
            OutboundMessage::Init => seal(self.kind(), None),
            OutboundMessage::StateChanged { diff } => {
                seal(self.kind(), Some(Value::from(diff.clone())))
            }
            OutboundMessage::Message { payload } => seal(self.kind(), Some(payload.clone())),
        }
    }
}

fn seal(kind: MessageKind, payload: Option<Value>) -> Value {
    let mut obj = Map::with_capacity(3);
    obj.insert(KIND_FIELD.to_string(), Value::String(kind.as_str().to_string()));
    if let Some(payload) = payload {
        obj.insert(PAYLOAD_FIELD.to_string(), payload);
    }
    obj.insert(VERSION_FIELD.to_string(), Value::from(PROTOCOL_VERSION));
    Value::Object(obj)
}

fn open_envelope(data: &Value) -> Result<(MessageKind, Option<&Value>), Rejection> {
    let obj = data.as_object().ok_or(Rejection::NotAnObject)?;

    let raw_kind = obj
        .get(KIND_FIELD)
        .filter(|kind| is_truthy(kind))
        .ok_or(Rejection::MissingKind)?;
    let kind = raw_kind
        .as_str()
        .and_then(MessageKind::parse)
        .ok_or_else(|| Rejection::UnknownKind(raw_kind.to_string()))?;

    if let Some(version) = obj.get(VERSION_FIELD).filter(|v| !v.is_null()) {
        if version.as_u64() != Some(PROTOCOL_VERSION) {
            return Err(Rejection::UnsupportedVersion(version.to_string()));
        }
    }

    Ok((kind, obj.get(PAYLOAD_FIELD)))
}

fn decode_diff(kind: MessageKind, payload: Option<&Value>) -> Result<Diff, Rejection> {
    match payload {
        Some(Value::Object(map)) => Ok(Diff::from(map.clone())),
        Some(other) => Err(Rejection::MalformedPayload {
            kind,
            reason: format!("expected an object, got {}", crate::error::json_kind(other)),
        }),
        None => Err(Rejection::MalformedPayload {
            kind,
            reason: "missing payload".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_init_reply() {
        let msg = InboundMessage::from_wire(&json!({ "NEAType": "Init", "payload": { "room": "abc" } }))
            .unwrap();
        assert_eq!(msg, InboundMessage::Init { meta: json!({ "room": "abc" }) });
    }

    #[test]
    fn test_init_without_payload_has_null_meta() {
        let msg = InboundMessage::from_wire(&json!({ "NEAType": "Init" })).unwrap();
        assert_eq!(msg, InboundMessage::Init { meta: Value::Null });
    }

    #[test]
    fn test_outbound_wire_shape() {
        assert_eq!(
            OutboundMessage::Init.to_wire(),
            json!({ "NEAType": "Init", "v": 1 })
        );
        let update = OutboundMessage::StateChanged {
            diff: Diff::new().with("count", 1),
        };
        assert_eq!(
            update.to_wire(),
            json!({ "NEAType": "StateChanged", "payload": { "count": 1 }, "v": 1 })
        );
    }

    #[test]
    fn test_rejects_non_objects_and_missing_kind() {
        assert_eq!(
            InboundMessage::from_wire(&json!("Init")),
            Err(Rejection::NotAnObject)
        );
        assert_eq!(
            InboundMessage::from_wire(&json!({ "payload": {} })),
            Err(Rejection::MissingKind)
        );
        assert_eq!(
            InboundMessage::from_wire(&json!({ "NEAType": "", "payload": {} })),
            Err(Rejection::MissingKind)
        );
    }

    #[test]
    fn test_rejects_unknown_kind_and_version() {
        assert!(matches!(
            InboundMessage::from_wire(&json!({ "NEAType": "Teleport" })),
            Err(Rejection::UnknownKind(_))
        ));
        assert!(matches!(
            InboundMessage::from_wire(&json!({ "NEAType": 7 })),
            Err(Rejection::UnknownKind(_))
        ));
        assert!(matches!(
            InboundMessage::from_wire(&json!({ "NEAType": "Init", "v": 2 })),
            Err(Rejection::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_state_changed_needs_object_payload() {
        assert!(matches!(
            InboundMessage::from_wire(&json!({ "NEAType": "StateChanged", "payload": [1] })),
            Err(Rejection::MalformedPayload { kind: MessageKind::StateChanged, .. })
        ));
        assert!(matches!(
            OutboundMessage::from_wire(&json!({ "NEAType": "StateChanged" })),
            Err(Rejection::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_restored_state_from_init_payload() {
        let meta = json!({ "room": "abc", "state": { "count": 4 } });
        let restored = InboundMessage::restored_state(&meta).unwrap();
        assert_eq!(restored.get("count"), Some(&json!(4)));
        assert!(InboundMessage::restored_state(&json!({ "state": 3 })).is_none());
        assert!(InboundMessage::restored_state(&Value::Null).is_none());
    }
}
