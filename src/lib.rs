//! # frame-sync - State sync between an embedded app and its host
//!
//! An app running inside a frame negotiates exactly one [`Session`] with the
//! surrounding host, then keeps a shared key/value state in step with it
//! through shallow diffs.
//!
//! ## Features
//!
//! - **One session per context**: concurrent callers converge on the same session
//! - **Shallow merge**: top-level keys, last write wins, changes travel as diffs
//! - **Pluggable transports**: in-process frames, WebSocket, or an in-memory recorder
//! - **Reference tagging**: wrap values as `{k, v, __isRef}` so identity survives the wire
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use frame_sync::{
//!     create_embedded_session, Diff, FrameContext, FramePeer, HostState, SessionConfig,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let host = FrameContext::top_level();
//!     let app = host.embed();
//!     // Something has to answer on the host side
//!     let _peer = FramePeer::spawn(&host, &app, Arc::new(HostState::new(json!({}))));
//!
//!     let session = create_embedded_session(&app, SessionConfig::new()).await?;
//!     session.ensure_state(Diff::new().with("count", 0));
//!
//!     let mut changes = session.subscribe();
//!     session.set_state(Diff::new().with("count", 1));
//!
//!     while let Ok(change) = changes.recv().await {
//!         println!("{:?} -> {:?}", change.origin, session.state());
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod refs;
pub mod server;
pub mod session;

// Re-export main types for library consumers
pub use channel::{
    FrameContext, MemoryChannel, MessageChannel, PostMessageChannel, Subscription, WsChannel,
};
pub use config::{FileConfig, SessionConfig};
pub use error::{Result, SessionError};
pub use host::{FramePeer, HostState};
pub use protocol::{Diff, InboundMessage, MessageKind, OutboundMessage, State};
pub use refs::{is_ref, make_auto_ref, make_ref, MaybeRef, RefFactory, RefKey, RefValue};
pub use session::{
    create_embedded_session, ChangeOrigin, Negotiator, Session, SessionRegistry, StateChange,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
