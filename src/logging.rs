//! Structured logging with tracing
//!
//! Library code only emits `tracing` events. Binaries call [`init_logging`]
//! once to install a subscriber; `FRAME_SYNC_LOG` overrides the configured
//! level with a full `EnvFilter` directive.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{
    fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::error::{Result, SessionError};

pub const LOG_ENV: &str = "FRAME_SYNC_LOG";

/// How chatty the crate is
///
/// Config files may give `true` or `"log"` for everything, `"warn"`,
/// `"error"`, or `false` for silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    Off,
    #[default]
    Error,
    Warn,
    Log,
}

impl DebugLevel {
    /// Filter directive for this level
    pub fn directive(&self) -> &'static str {
        match self {
            DebugLevel::Off => "off",
            DebugLevel::Error => "error",
            DebugLevel::Warn => "warn",
            DebugLevel::Log => "debug",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "true" | "log" | "debug" => Some(DebugLevel::Log),
            "warn" | "warning" => Some(DebugLevel::Warn),
            "error" => Some(DebugLevel::Error),
            "false" | "off" => Some(DebugLevel::Off),
            _ => None,
        }
    }
}

impl From<bool> for DebugLevel {
    fn from(enabled: bool) -> Self {
        if enabled {
            DebugLevel::Log
        } else {
            DebugLevel::Off
        }
    }
}

impl fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DebugLevel::Off => "off",
            DebugLevel::Error => "error",
            DebugLevel::Warn => "warn",
            DebugLevel::Log => "log",
        };
        f.write_str(name)
    }
}

impl Serialize for DebugLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DebugLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(flag) => Ok(flag.into()),
            Raw::Name(name) => DebugLevel::parse(&name)
                .ok_or_else(|| de::Error::custom(format!("unknown debug level: {name}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: DebugLevel,
    /// Also write plain-text logs to a daily-rolling file at this path
    pub file_output: Option<PathBuf>,
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(config.level.directive()));

    let file = config.file_output.as_ref().map(|path| {
        let appender = tracing_appender::rolling::daily(
            path.parent().unwrap_or_else(|| std::path::Path::new(".")),
            path.file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("frame-sync.log")),
        );
        tfmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
    });

    Registry::default()
        .with(filter)
        .with(tfmt::layer().with_target(true))
        .with(file)
        .try_init()
        .map_err(|e| SessionError::Config(format!("logging already initialized: {e}")))?;

    info!(level = %config.level, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_debug_values() {
        assert_eq!(DebugLevel::parse("log"), Some(DebugLevel::Log));
        assert_eq!(DebugLevel::parse("WARN"), Some(DebugLevel::Warn));
        assert_eq!(DebugLevel::parse("error"), Some(DebugLevel::Error));
        assert_eq!(DebugLevel::parse("loud"), None);
        assert_eq!(DebugLevel::from(true), DebugLevel::Log);
        assert_eq!(DebugLevel::from(false), DebugLevel::Off);
    }

    #[test]
    fn test_deserialize_bool_or_string() {
        let on: DebugLevel = serde_json::from_str("true").unwrap();
        assert_eq!(on, DebugLevel::Log);
        let warn: DebugLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(warn, DebugLevel::Warn);
        assert!(serde_json::from_str::<DebugLevel>("\"verbose\"").is_err());
    }

    #[test]
    fn test_directive_mapping() {
        assert_eq!(DebugLevel::Log.directive(), "debug");
        assert_eq!(DebugLevel::default().directive(), "error");
    }
}
