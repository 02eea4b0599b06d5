//! Reference counterpart: the host side of the protocol
//!
//! [`HostState`] is transport-agnostic. It answers `Init` with the configured
//! metadata (plus the document, once one exists), keeps the authoritative
//! document, and says what to relay to other apps. [`FramePeer`] drives it
//! over the in-process frame transport for a single embedded child.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::{ContextId, FrameContext, Port};
use crate::protocol::{Diff, InboundMessage, OutboundMessage, State, INIT_STATE_FIELD};

/// What the host does in response to one app message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostResponse {
    /// Sent back to the app that spoke
    pub replies: Vec<InboundMessage>,
    /// Sent to every other connected app
    pub relay: Option<InboundMessage>,
}

#[derive(Debug)]
pub struct HostState {
    meta: Value,
    document: RwLock<Option<State>>,
}

impl HostState {
    pub fn new(meta: Value) -> Self {
        Self {
            meta,
            document: RwLock::new(None),
        }
    }

    /// A host that already holds a document, as after an earlier session
    pub fn with_state(meta: Value, state: State) -> Self {
        Self {
            meta,
            document: RwLock::new(Some(state)),
        }
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn document(&self) -> Option<State> {
        self.document.read().clone()
    }

    pub fn handle(&self, message: OutboundMessage) -> HostResponse {
        match message {
            OutboundMessage::Init => HostResponse {
                replies: vec![InboundMessage::Init {
                    meta: self.init_payload(),
                }],
                relay: None,
            },
            OutboundMessage::StateChanged { diff } => {
                self.apply(&diff);
                HostResponse {
                    replies: Vec::new(),
                    relay: Some(InboundMessage::StateChanged { diff }),
                }
            }
            OutboundMessage::Message { payload } => HostResponse {
                replies: Vec::new(),
                relay: Some(InboundMessage::Message { payload }),
            },
        }
    }

    /// Apply an authoritative change; returns the message every app should get
    pub fn push(&self, diff: Diff) -> InboundMessage {
        self.apply(&diff);
        InboundMessage::StateChanged { diff }
    }

    fn apply(&self, diff: &Diff) {
        let mut document = self.document.write();
        diff.apply_to(document.get_or_insert_with(State::new));
    }

    /// Metadata, with the current document under `state` when one exists.
    ///
    /// Non-object metadata is wrapped as `{ "meta": ..., "state": ... }` in
    /// that case so the document still has somewhere to go.
    fn init_payload(&self) -> Value {
        let Some(document) = self.document() else {
            return self.meta.clone();
        };

        let mut payload = match &self.meta {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("meta".to_string(), other.clone());
                map
            }
        };
        payload.insert(INIT_STATE_FIELD.to_string(), Value::Object(document));
        Value::Object(payload)
    }
}

/// Serves one embedded child over the frame transport
pub struct FramePeer {
    host: Arc<HostState>,
    context: ContextId,
    child: Port,
    task: JoinHandle<()>,
}

impl FramePeer {
    /// Start answering `child`, which must be embedded in `host_context`
    pub fn spawn(host_context: &FrameContext, child: &FrameContext, host: Arc<HostState>) -> Self {
        let mut frames = host_context.subscribe();
        let context = host_context.id();
        let child_id = child.id();
        let child_port = child.port();

        let state = host.clone();
        let port = child_port.clone();
        let task = tokio::spawn(async move {
            while let Ok(frame) = frames.recv().await {
                if frame.source != child_id {
                    continue;
                }
                let message = match OutboundMessage::from_wire(&frame.data) {
                    Ok(message) => message,
                    Err(rejection) => {
                        trace!(%rejection, "host dropping frame");
                        continue;
                    }
                };
                debug!(kind = %message.kind(), "host received");
                for reply in state.handle(message).replies {
                    port.post(context, reply.to_wire());
                }
            }
        });

        Self {
            host,
            context,
            child: child_port,
            task,
        }
    }

    pub fn host(&self) -> &Arc<HostState> {
        &self.host
    }

    /// Push an authoritative change to the child
    pub fn push_state(&self, diff: Diff) {
        let message = self.host.push(diff);
        self.child.post(self.context, message.to_wire());
    }

    pub fn send_message(&self, payload: Value) {
        let message = InboundMessage::Message { payload };
        self.child.post(self.context, message.to_wire());
    }
}

impl Drop for FramePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_reply_carries_meta() {
        let host = HostState::new(json!({ "room": "abc" }));
        let response = host.handle(OutboundMessage::Init);
        assert_eq!(
            response.replies,
            vec![InboundMessage::Init {
                meta: json!({ "room": "abc" })
            }]
        );
        assert!(response.relay.is_none());
    }

    #[test]
    fn test_init_reply_includes_existing_document() {
        let host = HostState::new(json!({ "room": "abc" }));
        host.handle(OutboundMessage::StateChanged {
            diff: Diff::new().with("count", 2),
        });

        let response = host.handle(OutboundMessage::Init);
        assert_eq!(
            response.replies,
            vec![InboundMessage::Init {
                meta: json!({ "room": "abc", "state": { "count": 2 } })
            }]
        );
    }

    #[test]
    fn test_non_object_meta_is_wrapped() {
        let host = HostState::with_state(json!("lobby"), Map::new());
        let response = host.handle(OutboundMessage::Init);
        assert_eq!(
            response.replies,
            vec![InboundMessage::Init {
                meta: json!({ "meta": "lobby", "state": {} })
            }]
        );
    }

    #[test]
    fn test_updates_are_applied_and_relayed() {
        let host = HostState::new(Value::Null);
        let diff = Diff::new().with("count", 1);
        let response = host.handle(OutboundMessage::StateChanged { diff: diff.clone() });

        assert!(response.replies.is_empty());
        assert_eq!(response.relay, Some(InboundMessage::StateChanged { diff }));
        assert_eq!(
            Value::Object(host.document().unwrap()),
            json!({ "count": 1 })
        );
    }

    #[test]
    fn test_push_updates_document() {
        let host = HostState::with_state(Value::Null, Map::new());
        let message = host.push(Diff::new().with("count", 5));
        assert_eq!(message.kind(), crate::protocol::MessageKind::StateChanged);
        assert_eq!(host.document().unwrap().get("count"), Some(&json!(5)));
    }
}
