//! In-memory transport that records every send
//!
//! Delivery is synchronous: [`MemoryChannel::deliver`] runs each live handler
//! before returning, which makes it the transport of choice for tests and for
//! embedders that bridge messages themselves.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use super::{MessageChannel, MessageHandler, Subscription};
use crate::protocol::{InboundMessage, OutboundMessage, Rejection};

#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    sent: Mutex<Vec<OutboundMessage>>,
    handlers: Mutex<BTreeMap<u64, MessageHandler>>,
    next_id: AtomicU64,
    sent_signal: Notify,
    closed: watch::Sender<bool>,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            sent: Mutex::default(),
            handlers: Mutex::default(),
            next_id: AtomicU64::new(0),
            sent_signal: Notify::new(),
            closed: watch::channel(false).0,
        }
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.inner.sent.lock().clone()
    }

    /// Drain the record of sent messages
    pub fn take_sent(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    pub fn listener_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Hand `message` to every live handler, in registration order
    pub fn deliver(&self, message: InboundMessage) {
        let ids: Vec<u64> = self.inner.handlers.lock().keys().copied().collect();
        for id in ids {
            // Looked up per call so a handler disposed mid-delivery is skipped
            let handler = self.inner.handlers.lock().get(&id).cloned();
            if let Some(handler) = handler {
                handler(message.clone());
            }
        }
    }

    /// Decode raw wire data and deliver it, or report why it was dropped
    pub fn deliver_wire(&self, data: &Value) -> Result<(), Rejection> {
        let message = InboundMessage::from_wire(data)?;
        self.deliver(message);
        Ok(())
    }

    /// Mark the transport as gone; pending [`closed`](MessageChannel::closed)
    /// futures resolve
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    /// Resolve once at least `count` messages have been sent in total
    pub async fn wait_for_sent(&self, count: usize) {
        loop {
            let signal = self.inner.sent_signal.notified();
            if self.inner.sent.lock().len() >= count {
                return;
            }
            signal.await;
        }
    }
}

impl MessageChannel for MemoryChannel {
    fn send(&self, message: OutboundMessage) {
        self.inner.sent.lock().push(message);
        self.inner.sent_signal.notify_waiters();
    }

    fn listen(&self, handler: MessageHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().insert(id, handler);

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.handlers.lock().remove(&id);
            }
        })
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut closed = self.inner.closed.subscribe();
        Box::pin(async move {
            let _ = closed.wait_for(|closed| *closed).await;
        })
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("sent", &self.inner.sent.lock().len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
