//! Error types for the synchronization protocol
//!
//! Only setup and handshake failures reach callers. Malformed or misdirected
//! frames never become errors: transports drop them and report a
//! [`Rejection`](crate::protocol::Rejection) to the log instead.

use std::time::Duration;

/// Errors surfaced by the session API
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The calling context has no parent to synchronize with
    #[error("not running inside an embedding host: the context has no parent")]
    NotEmbedded,

    /// No `Init` reply arrived within the configured bound
    #[error("handshake timed out after {0:?} without an Init reply")]
    HandshakeTimeout(Duration),

    /// The transport went away before the handshake completed
    #[error("message channel closed before the handshake completed")]
    ChannelClosed,

    /// A state value did not serialize to a JSON object
    #[error("state must serialize to a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket or other network transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse grouping used by callers deciding what to do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The environment cannot host a session at all
    Setup,

    /// The counterpart did not answer in time
    Timeout,

    /// Network-level failures
    Transport,

    /// Bad caller input or configuration
    Validation,
}

impl ErrorCategory {
    /// Whether trying again later can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Timeout | ErrorCategory::Transport)
    }
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::NotEmbedded => ErrorCategory::Setup,
            SessionError::HandshakeTimeout(_) => ErrorCategory::Timeout,
            SessionError::ChannelClosed | SessionError::Transport(_) => ErrorCategory::Transport,
            SessionError::NotAnObject(_)
            | SessionError::Serialization(_)
            | SessionError::Config(_) => ErrorCategory::Validation,
        }
    }

    /// Fatal errors must stop the caller; there is nothing to retry
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Setup
    }
}

/// Describe a JSON value's type for error messages
pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert_eq!(SessionError::NotEmbedded.category(), ErrorCategory::Setup);
        assert_eq!(
            SessionError::HandshakeTimeout(Duration::from_millis(10)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            SessionError::NotAnObject("a number").category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Transport.is_retryable());
        assert!(!ErrorCategory::Setup.is_retryable());
        assert!(SessionError::NotEmbedded.is_fatal());
        assert!(!SessionError::ChannelClosed.is_fatal());
    }

    #[test]
    fn test_display_mentions_timeout() {
        let err = SessionError::HandshakeTimeout(Duration::from_secs(2));
        assert!(err.to_string().contains("2s"));
    }
}
