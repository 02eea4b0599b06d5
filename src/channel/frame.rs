//! Default transport: an in-process model of nested frames
//!
//! Each [`FrameContext`] owns a message bus, the equivalent of a window's
//! `message` event. Posting through a [`Port`] stamps the frame with the
//! sender's [`ContextId`], which receivers compare against the single
//! counterpart they expect.

use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{MessageChannel, MessageHandler, Subscription};
use crate::error::{Result, SessionError};
use crate::protocol::{InboundMessage, OutboundMessage, Rejection};

/// Frames buffered per context before slow listeners start lagging
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One delivered message with its sender
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: ContextId,
    pub data: Value,
}

/// Handle for posting into another context's bus
#[derive(Debug, Clone)]
pub struct Port {
    target: ContextId,
    bus: broadcast::Sender<Frame>,
}

impl Port {
    /// The context this port delivers into
    pub fn target(&self) -> ContextId {
        self.target
    }

    /// Post `data` as coming from `source`. Returns false when nobody listens.
    pub fn post(&self, source: ContextId, data: Value) -> bool {
        self.bus.send(Frame { source, data }).is_ok()
    }
}

/// An execution context, optionally embedded in a parent
#[derive(Debug)]
pub struct FrameContext {
    id: ContextId,
    bus: broadcast::Sender<Frame>,
    parent: Option<Port>,
}

impl FrameContext {
    /// A context with no parent, like a top-level window
    pub fn top_level() -> Self {
        Self::with_parent(None)
    }

    /// Create a child context embedded in this one
    pub fn embed(&self) -> FrameContext {
        Self::with_parent(Some(self.port()))
    }

    fn with_parent(parent: Option<Port>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            id: ContextId::new(),
            bus,
            parent,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn parent(&self) -> Option<&Port> {
        self.parent.as_ref()
    }

    pub fn is_embedded(&self) -> bool {
        self.parent.is_some()
    }

    /// Port other contexts use to post into this one
    pub fn port(&self) -> Port {
        Port {
            target: self.id,
            bus: self.bus.clone(),
        }
    }

    /// Observe every frame posted into this context, whoever sent it
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.bus.subscribe()
    }

    /// Post from this context into another one
    pub fn post_to(&self, port: &Port, data: Value) -> bool {
        port.post(self.id, data)
    }
}

/// Accept a frame only if it comes from `expected` and decodes cleanly
pub fn accept_frame(expected: ContextId, frame: Frame) -> Option<InboundMessage> {
    if frame.source != expected {
        trace!(
            source = %frame.source,
            rejection = %Rejection::ForeignSender,
            "dropping frame"
        );
        return None;
    }

    match InboundMessage::from_wire(&frame.data) {
        Ok(message) => {
            debug!(kind = %message.kind(), data = %frame.data, "message from parent");
            Some(message)
        }
        Err(rejection) => {
            trace!(%rejection, "dropping frame");
            None
        }
    }
}

/// Channel from an embedded context to its parent
#[derive(Debug, Clone)]
pub struct PostMessageChannel {
    context: ContextId,
    parent: Port,
    bus: broadcast::Sender<Frame>,
}

impl PostMessageChannel {
    /// Fails with [`SessionError::NotEmbedded`] when `context` has no parent
    pub fn new(context: &FrameContext) -> Result<Self> {
        let parent = context.parent().cloned().ok_or(SessionError::NotEmbedded)?;
        Ok(Self {
            context: context.id(),
            parent,
            bus: context.bus.clone(),
        })
    }

    pub fn counterpart(&self) -> ContextId {
        self.parent.target()
    }
}

impl MessageChannel for PostMessageChannel {
    fn send(&self, message: OutboundMessage) {
        let data = message.to_wire();
        debug!(kind = %message.kind(), data = %data, "message to parent");
        if !self.parent.post(self.context, data) {
            trace!("parent context has no listeners");
        }
    }

    fn listen(&self, handler: MessageHandler) -> Subscription {
        let expected = self.parent.target();
        Subscription::spawn_listener(
            self.bus.subscribe(),
            move |frame| accept_frame(expected, frame),
            handler,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_top_level_context_is_not_embedded() {
        let top = FrameContext::top_level();
        assert!(!top.is_embedded());
        assert!(matches!(
            PostMessageChannel::new(&top),
            Err(SessionError::NotEmbedded)
        ));

        let child = top.embed();
        assert!(child.is_embedded());
        let channel = PostMessageChannel::new(&child).unwrap();
        assert_eq!(channel.counterpart(), top.id());
    }

    #[test]
    fn test_accept_frame_filters_sender_and_shape() {
        let parent = ContextId::new();
        let stranger = ContextId::new();
        let init = json!({ "NEAType": "Init", "payload": { "room": "abc" } });

        assert!(accept_frame(stranger, Frame { source: parent, data: init.clone() }).is_none());
        assert!(accept_frame(parent, Frame { source: parent, data: json!("hi") }).is_none());
        assert!(accept_frame(parent, Frame { source: parent, data: json!({ "payload": 1 }) }).is_none());
        assert_eq!(
            accept_frame(parent, Frame { source: parent, data: init }),
            Some(InboundMessage::Init { meta: json!({ "room": "abc" }) })
        );
    }

    #[tokio::test]
    async fn test_send_reaches_parent_bus() {
        let host = FrameContext::top_level();
        let app = host.embed();
        let mut host_rx = host.subscribe();

        let channel = PostMessageChannel::new(&app).unwrap();
        channel.send(OutboundMessage::Init);

        let frame = host_rx.recv().await.unwrap();
        assert_eq!(frame.source, app.id());
        assert_eq!(frame.data, json!({ "NEAType": "Init", "v": 1 }));
    }

    #[tokio::test]
    async fn test_listen_only_sees_parent_messages() {
        let host = FrameContext::top_level();
        let app = host.embed();
        let stranger = FrameContext::top_level();
        let channel = PostMessageChannel::new(&app).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = channel.listen(Arc::new(move |message| sink.lock().push(message)));

        let update = json!({ "NEAType": "StateChanged", "payload": { "count": 2 } });
        stranger.post_to(&app.port(), update.clone());
        host.post_to(&app.port(), json!({ "payload": { "count": 3 } }));
        host.post_to(&app.port(), update);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), crate::protocol::MessageKind::StateChanged);
    }
}
