//! The synchronized app handle
//!
//! A [`Session`] owns the local mirror of the shared document. Local writes
//! go through [`Session::set_state`]: they apply immediately, notify, and are
//! announced to the host as exactly the diff the caller supplied. Host pushes
//! arrive through the channel and apply the same way. Conflicts resolve per
//! key, last write wins.

pub mod negotiator;

pub use negotiator::{create_embedded_session, HandshakePhase, Negotiator, SessionRegistry};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::channel::{MessageChannel, MessageHandler, Subscription};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::protocol::{Diff, InboundMessage, OutboundMessage, State};
use crate::refs::RefFactory;

/// Where an applied diff came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// One applied diff. Listeners usually just re-read [`Session::state`].
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub origin: ChangeOrigin,
    pub diff: Diff,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    meta: Value,
    /// `None` until a document is first committed
    state: RwLock<Option<State>>,
    channel: Arc<dyn MessageChannel>,
    changes: broadcast::Sender<StateChange>,
    messages: broadcast::Sender<Value>,
    refs: RefFactory,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionInner {
    fn notify(&self, origin: ChangeOrigin, diff: Diff) {
        // No receivers is fine
        let _ = self.changes.send(StateChange {
            origin,
            diff,
            at: Utc::now(),
        });
    }

    fn on_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::StateChanged { diff } => {
                if diff.is_empty() {
                    trace!(session = %self.id, "ignoring empty remote diff");
                    return;
                }
                {
                    let mut guard = self.state.write();
                    diff.apply_to(guard.get_or_insert_with(State::new));
                }
                debug!(session = %self.id, keys = diff.len(), "applied remote diff");
                self.notify(ChangeOrigin::Remote, diff);
            }
            InboundMessage::Message { payload } => {
                let _ = self.messages.send(payload);
            }
            InboundMessage::Init { .. } => {
                trace!(session = %self.id, "ignoring Init after handshake");
            }
        }
    }
}

/// Routes channel traffic from the handshake into the session it produces.
///
/// Before the `Init` reply only that reply matters. Anything arriving between
/// the reply and the session going live is held and replayed in order, so one
/// listener covers both phases and no host update falls in between.
pub(crate) struct Handoff {
    route: Mutex<Route>,
}

enum Route {
    AwaitingReply(mpsc::UnboundedSender<Value>),
    Buffering(Vec<InboundMessage>),
    Live(Weak<SessionInner>),
}

impl Handoff {
    /// Forward the first `Init` payload to `reply`, then start buffering
    pub(crate) fn awaiting(reply: mpsc::UnboundedSender<Value>) -> Arc<Self> {
        Arc::new(Self {
            route: Mutex::new(Route::AwaitingReply(reply)),
        })
    }

    pub(crate) fn handler(self: &Arc<Self>) -> MessageHandler {
        let handoff = self.clone();
        Arc::new(move |message| handoff.route(message))
    }

    fn route(&self, message: InboundMessage) {
        let mut route = self.route.lock();
        let session = match &mut *route {
            Route::AwaitingReply(reply) => {
                match message {
                    InboundMessage::Init { meta } => {
                        let _ = reply.send(meta);
                        *route = Route::Buffering(Vec::new());
                    }
                    other => {
                        trace!(kind = %other.kind(), "ignoring message before the Init reply")
                    }
                }
                return;
            }
            Route::Buffering(backlog) => {
                backlog.push(message);
                return;
            }
            Route::Live(session) => session.upgrade(),
        };
        drop(route);

        if let Some(session) = session {
            session.on_message(message);
        }
    }

    /// Replay the backlog into `session`, then deliver to it directly.
    ///
    /// The route stays locked during the replay so later messages queue
    /// behind the backlog.
    fn go_live(&self, session: &Arc<SessionInner>) {
        let mut route = self.route.lock();
        let previous = std::mem::replace(&mut *route, Route::Live(Arc::downgrade(session)));
        if let Route::Buffering(backlog) = previous {
            if !backlog.is_empty() {
                debug!(
                    session = %session.id,
                    replayed = backlog.len(),
                    "replaying early host messages"
                );
            }
            for message in backlog {
                session.on_message(message);
            }
        }
    }
}

impl Session {
    /// Build a session around a channel that has not been listened to yet
    #[cfg(test)]
    pub(crate) fn attach(
        meta: Value,
        channel: Arc<dyn MessageChannel>,
        config: &SessionConfig,
    ) -> Self {
        let handoff = Arc::new(Handoff {
            route: Mutex::new(Route::Buffering(Vec::new())),
        });
        let subscription = channel.listen(handoff.handler());
        Self::adopt(meta, channel, config, subscription, &handoff)
    }

    /// Build a session from a handshake reply, taking over the handshake's
    /// listener so host updates sent right after the reply are kept
    pub(crate) fn adopt(
        meta: Value,
        channel: Arc<dyn MessageChannel>,
        config: &SessionConfig,
        subscription: Subscription,
        handoff: &Handoff,
    ) -> Self {
        let restored = InboundMessage::restored_state(&meta).cloned();
        let restored_keys = restored.as_ref().map(|state| state.len());
        let capacity = config.notification_capacity.max(1);
        let (changes, _) = broadcast::channel(capacity);
        let (messages, _) = broadcast::channel(capacity);
        let id = Uuid::new_v4();

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                meta,
                state: RwLock::new(restored),
                channel,
                changes,
                messages,
                refs: RefFactory::new(id),
                subscription: Mutex::new(Some(subscription)),
            }),
        };

        info!(session = %id, restored_keys, "session established");
        handoff.go_live(&session.inner);

        if let Some(defaults) = &config.initial_state {
            session.ensure_state(defaults.clone());
        }

        session
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Payload of the host's `Init` reply, fixed for the session's lifetime
    pub fn meta(&self) -> &Value {
        &self.inner.meta
    }

    pub fn meta_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.inner.meta.clone())?)
    }

    /// Snapshot of the mirror. Mutating it does not propagate.
    pub fn state(&self) -> State {
        self.inner.state.read().clone().unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .state
            .read()
            .as_ref()
            .and_then(|state| state.get(key).cloned())
    }

    /// Whether a document has been committed yet
    pub fn has_state(&self) -> bool {
        self.inner.state.read().is_some()
    }

    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.state()))?)
    }

    /// Establish the document, or fill in keys it lacks.
    ///
    /// With no committed document, `defaults` becomes the whole document and
    /// is announced in full. Otherwise only keys missing from the current
    /// document are added and announced; existing keys are never overwritten.
    pub fn ensure_state(&self, defaults: impl Into<Diff>) -> State {
        let defaults = defaults.into();

        let (announce, result) = {
            let mut guard = self.inner.state.write();
            match guard.as_mut() {
                None => {
                    let full = defaults.into_map();
                    *guard = Some(full.clone());
                    (Some(Diff::from(full.clone())), full)
                }
                Some(current) => {
                    let missing = Diff::missing_keys(defaults.as_map(), current);
                    if missing.is_empty() {
                        (None, current.clone())
                    } else {
                        missing.apply_to(current);
                        (Some(missing), current.clone())
                    }
                }
            }
        };

        if let Some(diff) = announce {
            debug!(session = %self.inner.id, keys = diff.len(), "state ensured");
            self.inner.notify(ChangeOrigin::Local, diff.clone());
            self.inner.channel.send(OutboundMessage::StateChanged { diff });
        }

        result
    }

    /// Typed variant of [`ensure_state`](Self::ensure_state)
    pub fn ensure_state_from<T: Serialize>(&self, defaults: &T) -> Result<State> {
        Ok(self.ensure_state(Diff::from_serialize(defaults)?))
    }

    /// Apply `diff` locally, notify, and announce exactly `diff` to the host.
    ///
    /// An empty diff does nothing at all.
    pub fn set_state(&self, diff: impl Into<Diff>) {
        let diff = diff.into();
        if diff.is_empty() {
            trace!(session = %self.inner.id, "ignoring empty local diff");
            return;
        }

        {
            let mut guard = self.inner.state.write();
            diff.apply_to(guard.get_or_insert_with(State::new));
        }

        debug!(session = %self.inner.id, keys = diff.len(), "applied local diff");
        self.inner.notify(ChangeOrigin::Local, diff.clone());
        self.inner.channel.send(OutboundMessage::StateChanged { diff });
    }

    /// Typed variant of [`set_state`](Self::set_state); `partial` must serialize to an object
    pub fn set_state_from<T: Serialize>(&self, partial: &T) -> Result<()> {
        self.set_state(Diff::from_serialize(partial)?);
        Ok(())
    }

    /// Stream of applied diffs. Drop the receiver to stop listening.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }

    /// Broadcast a custom message; it never touches state
    pub fn send_message(&self, payload: Value) {
        self.inner.channel.send(OutboundMessage::Message { payload });
    }

    /// Custom messages pushed by the host
    pub fn messages(&self) -> broadcast::Receiver<Value> {
        self.inner.messages.subscribe()
    }

    /// Key issuer namespaced by this session
    pub fn refs(&self) -> &RefFactory {
        &self.inner.refs
    }

    /// Identity comparison, not structural
    pub fn ptr_eq(a: &Session, b: &Session) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("meta", &self.inner.meta)
            .field("state", &*self.inner.state.read())
            .field("channel", &"<dyn MessageChannel>")
            .finish()
    }
}
