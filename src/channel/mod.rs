//! Message channel abstraction
//!
//! A channel delivers tagged messages to the counterpart context and hands
//! accepted messages from it to registered handlers. Transports validate at
//! the boundary: handlers only ever see decoded [`InboundMessage`]s from the
//! expected sender.
//!
//! Three transports ship with the crate:
//! - [`frame::PostMessageChannel`]: the default, in-process frame bus
//! - [`memory::MemoryChannel`]: records sends and delivers synchronously
//! - [`ws::WsChannel`]: a WebSocket connection to a remote host

pub mod frame;
pub mod memory;
pub mod ws;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::protocol::{InboundMessage, OutboundMessage};

pub use frame::{ContextId, Frame, FrameContext, Port, PostMessageChannel};
pub use memory::MemoryChannel;
pub use ws::WsChannel;

/// Callback invoked for every accepted message
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

pub trait MessageChannel: Send + Sync {
    /// Fire-and-forget delivery to the counterpart.
    ///
    /// Messages from one side arrive in send order; nothing is acknowledged.
    fn send(&self, message: OutboundMessage);

    /// Register `handler` for every message accepted from the counterpart.
    ///
    /// Only messages sent after this call returns are guaranteed to reach the
    /// handler.
    fn listen(&self, handler: MessageHandler) -> Subscription;

    /// Resolves once the transport can no longer deliver anything from the
    /// counterpart. Transports that cannot close never resolve.
    fn closed(&self) -> BoxFuture<'static, ()> {
        Box::pin(future::pending())
    }
}

impl<C: MessageChannel + ?Sized> MessageChannel for Arc<C> {
    fn send(&self, message: OutboundMessage) {
        (**self).send(message)
    }

    fn listen(&self, handler: MessageHandler) -> Subscription {
        (**self).listen(handler)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        (**self).closed()
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Disposer for a registered listener
///
/// Once [`dispose`](Subscription::dispose) returns, the handler is not invoked
/// again. Disposing twice is harmless. Dropping the last clone disposes too.
#[derive(Clone)]
#[must_use = "dropping a Subscription disposes the listener"]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    active: Arc<AtomicBool>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl SubscriptionInner {
    fn dispose(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
    }
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Subscription {
    /// Wrap an arbitrary cleanup action, run at most once
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(true)), Box::new(cleanup))
    }

    fn with_flag(active: Arc<AtomicBool>, cleanup: Cleanup) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                active,
                cleanup: Mutex::new(Some(cleanup)),
            }),
        }
    }

    /// Drive `handler` from a broadcast feed on a dedicated task.
    ///
    /// `accept` filters and decodes raw items; returning `None` drops the item.
    /// The receiver is subscribed before this returns, so nothing published
    /// afterwards is missed.
    pub(crate) fn spawn_listener<T, F>(
        mut feed: broadcast::Receiver<T>,
        accept: F,
        handler: MessageHandler,
    ) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Option<InboundMessage> + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(item) => {
                        let Some(message) = accept(item) else {
                            continue;
                        };
                        if !flag.load(Ordering::Acquire) {
                            break;
                        }
                        handler(message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "listener fell behind, messages were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self::with_flag(active, Box::new(move || task.abort()))
    }

    /// Stop future invocations of the handler. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
