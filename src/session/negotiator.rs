//! Handshake: one session per embedded context
//!
//! The app sends `Init` and waits for the host's `Init` reply, whose payload
//! becomes the session's `meta`. The [`SessionRegistry`] holds the resolved
//! session. Every request made after resolution returns it without touching
//! the channel, and requests that overlap in time all converge on whichever
//! session got built first.
//!
//! Phases run `Unstarted -> AwaitingResponse -> Resolved` and never go back.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{Handoff, Session};
use crate::channel::{FrameContext, MessageChannel, PostMessageChannel};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::protocol::{InboundMessage, OutboundMessage};

static GLOBAL_REGISTRY: Lazy<Arc<SessionRegistry>> =
    Lazy::new(|| Arc::new(SessionRegistry::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Unstarted,
    AwaitingResponse,
    Resolved,
}

/// Holds the single session of one execution context
pub struct SessionRegistry {
    slot: Mutex<Option<Session>>,
    published: watch::Sender<Option<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (published, _) = watch::channel(None);
        Self {
            slot: Mutex::new(None),
            published,
        }
    }

    /// Process-wide registry used by [`create_embedded_session`]
    pub fn global() -> Arc<SessionRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    pub fn current(&self) -> Option<Session> {
        self.slot.lock().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.published.subscribe()
    }

    /// Store the session `build` returns, unless one already exists
    fn resolve_with(&self, build: impl FnOnce() -> Session) -> Session {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let session = build();
        *slot = Some(session.clone());
        self.published.send_replace(Some(session.clone()));
        session
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("session", &self.current().map(|s| s.id()))
            .finish()
    }
}

enum Reply {
    Meta(Value),
    Resolved(Session),
}

struct Pending(Arc<AtomicUsize>);

impl Pending {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs the handshake over one channel against one registry
pub struct Negotiator {
    channel: Arc<dyn MessageChannel>,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    pending: Arc<AtomicUsize>,
}

impl Negotiator {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        registry: Arc<SessionRegistry>,
        config: SessionConfig,
    ) -> Self {
        Self {
            channel,
            registry,
            config,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Negotiate over the default transport to `context`'s parent.
    ///
    /// Fails with [`SessionError::NotEmbedded`] right away, before any message
    /// is sent, when `context` has no parent.
    pub fn for_context(
        context: &FrameContext,
        registry: Arc<SessionRegistry>,
        config: SessionConfig,
    ) -> Result<Self> {
        let channel = PostMessageChannel::new(context)?;
        Ok(Self::new(Arc::new(channel), registry, config))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn phase(&self) -> HandshakePhase {
        if self.registry.current().is_some() {
            HandshakePhase::Resolved
        } else if self.pending.load(Ordering::SeqCst) > 0 {
            HandshakePhase::AwaitingResponse
        } else {
            HandshakePhase::Unstarted
        }
    }

    /// Resolve the context's session, negotiating it if needed.
    ///
    /// Dropping the returned future abandons the handshake and disposes its
    /// listener. With `handshake_timeout` set, expiry yields
    /// [`SessionError::HandshakeTimeout`].
    pub async fn connect(&self) -> Result<Session> {
        let mut resolved = self.registry.watch();
        let current = resolved.borrow_and_update().clone();
        if let Some(session) = current {
            debug!(session = %session.id(), "reusing resolved session");
            return Ok(session);
        }

        let _pending = Pending::enter(&self.pending);

        // Listen before sending so the reply cannot slip past. The same
        // listener is handed to the session, so nothing sent after the reply
        // is lost either.
        let (tx, mut replies) = mpsc::unbounded_channel();
        let handoff = Handoff::awaiting(tx);
        let subscription = self.channel.listen(handoff.handler());
        let closed = self.channel.closed();

        self.channel.send(OutboundMessage::Init);
        debug!("Init sent, awaiting host reply");

        let waiting = Self::await_reply(&mut replies, &mut resolved, closed);
        let outcome = match self.config.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(?limit, "handshake timed out");
                    Err(SessionError::HandshakeTimeout(limit))
                }
            },
            None => waiting.await,
        };

        match outcome {
            Ok(Reply::Meta(meta)) => {
                let channel = self.channel.clone();
                let config = &self.config;
                // If another handshake won, the closure and its listener are dropped
                Ok(self.registry.resolve_with(move || {
                    Session::adopt(meta, channel, config, subscription, &handoff)
                }))
            }
            Ok(Reply::Resolved(session)) => {
                subscription.dispose();
                debug!(session = %session.id(), "converged on a concurrently resolved session");
                Ok(session)
            }
            Err(err) => {
                subscription.dispose();
                Err(err)
            }
        }
    }

    async fn await_reply(
        replies: &mut mpsc::UnboundedReceiver<Value>,
        resolved: &mut watch::Receiver<Option<Session>>,
        mut closed: BoxFuture<'static, ()>,
    ) -> Result<Reply> {
        loop {
            tokio::select! {
                reply = replies.recv() => {
                    return reply.map(Reply::Meta).ok_or(SessionError::ChannelClosed);
                }
                changed = resolved.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::ChannelClosed);
                    }
                    let current = resolved.borrow_and_update().clone();
                    if let Some(session) = current {
                        return Ok(Reply::Resolved(session));
                    }
                }
                _ = &mut closed => {
                    warn!("transport closed during the handshake");
                    return Err(SessionError::ChannelClosed);
                }
            }
        }
    }
}

/// Resolve the session of an embedded frame, using the process-wide registry
pub async fn create_embedded_session(
    context: &FrameContext,
    config: SessionConfig,
) -> Result<Session> {
    let negotiator = Negotiator::for_context(context, SessionRegistry::global(), config)?;
    negotiator.connect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::protocol::Diff;
    use serde_json::json;
    use std::time::Duration;

    fn negotiator(channel: &MemoryChannel, config: SessionConfig) -> Arc<Negotiator> {
        Arc::new(Negotiator::new(
            Arc::new(channel.clone()),
            Arc::new(SessionRegistry::new()),
            config,
        ))
    }

    #[tokio::test]
    async fn test_handshake_resolves_with_meta() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());
        assert_eq!(negotiator.phase(), HandshakePhase::Unstarted);

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };

        channel.wait_for_sent(1).await;
        assert_eq!(channel.sent(), vec![OutboundMessage::Init]);
        assert_eq!(negotiator.phase(), HandshakePhase::AwaitingResponse);

        channel.deliver(InboundMessage::Init {
            meta: json!({ "room": "abc" }),
        });
        let session = pending.await.unwrap().unwrap();

        assert_eq!(session.meta(), &json!({ "room": "abc" }));
        assert_eq!(negotiator.phase(), HandshakePhase::Resolved);
        // Only the session's own listener remains
        assert_eq!(channel.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_session_is_memoized() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        channel.wait_for_sent(1).await;
        channel.deliver(InboundMessage::Init { meta: json!(null) });
        let first = pending.await.unwrap().unwrap();

        let second = negotiator.connect().await.unwrap();
        assert!(Session::ptr_eq(&first, &second));
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_converge() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());

        let a = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        let b = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };

        channel.wait_for_sent(2).await;
        channel.deliver(InboundMessage::Init {
            meta: json!({ "room": "abc" }),
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Session::ptr_eq(&a, &b));
        assert_eq!(channel.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_non_init_messages_are_ignored_during_handshake() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        channel.wait_for_sent(1).await;

        channel.deliver(InboundMessage::StateChanged {
            diff: Diff::new().with("count", 9),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        channel.deliver(InboundMessage::Init { meta: json!(null) });
        let session = pending.await.unwrap().unwrap();
        assert!(!session.has_state());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let channel = MemoryChannel::new();
        let config = SessionConfig::new().with_handshake_timeout(Duration::from_millis(30));
        let negotiator = negotiator(&channel, config);

        let err = negotiator.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
        assert_eq!(channel.listener_count(), 0);
        assert_eq!(negotiator.phase(), HandshakePhase::Unstarted);
    }

    #[tokio::test]
    async fn test_cancelled_handshake_disposes_listener() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        channel.wait_for_sent(1).await;
        assert_eq!(channel.listener_count(), 1);

        pending.abort();
        let _ = pending.await;
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_state_applies_on_resolution() {
        let channel = MemoryChannel::new();
        let config = SessionConfig::new().with_initial_state(Diff::new().with("count", 0));
        let negotiator = negotiator(&channel, config);

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        channel.wait_for_sent(1).await;
        channel.deliver(InboundMessage::Init {
            meta: json!({ "state": { "count": 7 } }),
        });
        let session = pending.await.unwrap().unwrap();

        assert_eq!(session.get("count"), Some(json!(7)));
        assert_eq!(channel.sent(), vec![OutboundMessage::Init]);
    }

    #[tokio::test]
    async fn test_updates_right_after_the_reply_are_kept() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        channel.wait_for_sent(1).await;

        // Both land before the handshake task gets to build the session
        channel.deliver(InboundMessage::Init { meta: json!(null) });
        channel.deliver(InboundMessage::StateChanged {
            diff: Diff::new().with("count", 5),
        });

        let session = pending.await.unwrap().unwrap();
        assert_eq!(session.get("count"), Some(json!(5)));
        assert_eq!(channel.listener_count(), 1);

        // And the listener keeps feeding the session afterwards
        channel.deliver(InboundMessage::StateChanged {
            diff: Diff::new().with("count", 6),
        });
        assert_eq!(session.get("count"), Some(json!(6)));
    }

    #[tokio::test]
    async fn test_closed_transport_fails_handshake() {
        let channel = MemoryChannel::new();
        let negotiator = negotiator(&channel, SessionConfig::default());

        let pending = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        channel.wait_for_sent(1).await;
        channel.close();

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::ChannelClosed));
        assert!(err.category().is_retryable());
        assert_eq!(channel.listener_count(), 0);
        assert_eq!(negotiator.phase(), HandshakePhase::Unstarted);
    }

    #[test]
    fn test_not_embedded_fails_immediately() {
        let top = FrameContext::top_level();
        let registry = Arc::new(SessionRegistry::new());
        let err = Negotiator::for_context(&top, registry, SessionConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::NotEmbedded));
        assert!(err.is_fatal());
    }
}
