//! Session and host configuration
//!
//! [`SessionConfig`] is the programmatic knob set used by the library.
//! [`FileConfig`] is what the binary reads from a `.json` or `.toml` file.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::logging::LoggingConfig;
use crate::protocol::{Diff, State};

/// Change notifications buffered per receiver before it starts lagging
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Run through `ensure_state` as soon as the session exists
    pub initial_state: Option<State>,

    /// Give up on the handshake after this long. `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_state: None,
            handshake_timeout: None,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_state(mut self, defaults: impl Into<Diff>) -> Self {
        self.initial_state = Some(defaults.into().into_map());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub port: u16,
    /// Sent to every app in the `Init` reply
    pub meta: Value,
    /// Document the host starts with, if any
    pub state: Option<State>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            meta: Value::Null,
            state: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFileConfig {
    pub handshake_timeout_ms: Option<u64>,
    pub initial_state: Option<State>,
    pub notification_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub host: HostConfig,
    pub session: SessionFileConfig,
    pub logging: LoggingConfig,
}

impl FileConfig {
    /// Load from `path`, picking the format by extension (`.toml`, else JSON)
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("cannot read {}: {e}", path.display())))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(&raw)
                .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
        } else {
            serde_json::from_str(&raw)
                .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            initial_state: self.session.initial_state.clone(),
            handshake_timeout: self.session.handshake_timeout_ms.map(Duration::from_millis),
            notification_capacity: self
                .session
                .notification_capacity
                .unwrap_or(DEFAULT_NOTIFICATION_CAPACITY)
                .max(1),
        }
    }
}
