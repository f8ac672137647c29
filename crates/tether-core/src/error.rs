//! Error types for tether.
//!
//! `TetherError` is the crate-wide error. `CallError` is the serializable error a
//! remote context sends back when a function or service method fails; it travels
//! inside message payloads and surfaces locally as `TetherError::Call`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Text raised when a dead message arrives from another context.
pub const CHANNEL_REMOTE_MSG: &str = "Channel closed by remote end.";

/// Text raised when a dead message was generated by this context.
pub const CHANNEL_LOCAL_MSG: &str = "Channel closed by local end.";

/// Text carried by a `CallError` reply when a handler policy refuses a message.
pub const REFUSED_MSG: &str = "Refused by policy.";

/// Main error type for the tether runtime.
#[derive(Debug, Error)]
pub enum TetherError {
    // Transport errors
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("EOF on stream; last 300 bytes received: {tail:?}")]
    Eof { tail: String },

    #[error("Connection timed out after {timeout:?} connecting to {name}")]
    ConnectTimeout { name: String, timeout: Duration },

    // Channel and queue errors
    #[error("{0}")]
    Channel(String),

    #[error("Timed out waiting for a result")]
    Timeout,

    #[error("Latch is closed")]
    LatchClosed,

    #[error("Select error: {0}")]
    Select(String),

    // Remote application errors
    #[error("{0}")]
    Call(CallError),

    // Routing errors
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Unknown call target: {0}")]
    UnknownTarget(String),

    #[error("Refused by policy: {0}")]
    Policy(String),

    // Service errors
    #[error("Service error: {0}")]
    Service(String),

    // System errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(unix)]
impl From<nix::Error> for TetherError {
    fn from(err: nix::Error) -> Self {
        TetherError::from(std::io::Error::from(err))
    }
}

impl From<CallError> for TetherError {
    fn from(err: CallError) -> Self {
        TetherError::Call(err)
    }
}

impl TetherError {
    /// Build an IO error with a description of the failed operation.
    pub fn io(message: impl Into<String>, err: std::io::Error) -> Self {
        TetherError::Io {
            message: format!("{}: {}", message.into(), err),
            source: Some(err),
        }
    }

    /// True when the error means the peer or channel is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TetherError::Channel(_)
                | TetherError::Stream(_)
                | TetherError::Eof { .. }
                | TetherError::LatchClosed
        )
    }

    /// True when the error means nothing answered before a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TetherError::Timeout | TetherError::ConnectTimeout { .. }
        )
    }

    /// Stable kind name used when the error crosses a context boundary.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TetherError::Stream(_) => "StreamError",
            TetherError::Eof { .. } => "EofError",
            TetherError::ConnectTimeout { .. } | TetherError::Timeout => "TimeoutError",
            TetherError::Channel(_) => "ChannelError",
            TetherError::LatchClosed => "LatchError",
            TetherError::Select(_) => "SelectError",
            TetherError::Call(_) => "CallError",
            TetherError::Routing(_) => "RoutingError",
            TetherError::UnknownTarget(_) => "UnknownTargetError",
            TetherError::Policy(_) => "PolicyError",
            TetherError::Service(_) => "ServiceError",
            TetherError::Io { .. } => "IoError",
            TetherError::Json { .. } => "JsonError",
            TetherError::Config { .. } => "ConfigError",
            TetherError::Other(_) => "Error",
        }
    }
}

/// Serializable error describing a failure inside another context.
///
/// `kind` names the failure class, `message` is its text and `diagnostic`
/// carries whatever trace the failing context could capture. The original
/// error value never crosses the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub diagnostic: String,
}

impl CallError {
    /// Largest message accepted when decoding a `CallError` payload.
    pub const MAX_TEXT_LEN: usize = 10_000;

    /// Create an error, capturing a backtrace when `RUST_BACKTRACE` enables it.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        let diagnostic = match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => backtrace.to_string(),
            _ => String::new(),
        };
        Self {
            kind: kind.into(),
            message: message.into(),
            diagnostic,
        }
    }

    /// A plain error with the generic kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("CallError", message)
    }

    /// The reply sent when a handler policy refuses a message.
    pub fn refused() -> Self {
        Self::msg(REFUSED_MSG)
    }

    /// Replace the diagnostic text.
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }

    /// Append a line to the diagnostic text.
    pub fn push_diagnostic(&mut self, line: impl AsRef<str>) {
        if !self.diagnostic.is_empty() && !self.diagnostic.ends_with('\n') {
            self.diagnostic.push('\n');
        }
        self.diagnostic.push_str(line.as_ref());
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        self.kind.len() < Self::MAX_TEXT_LEN
            && self.message.len() < Self::MAX_TEXT_LEN
            && self.diagnostic.len() < Self::MAX_TEXT_LEN * 10
    }
}

impl From<&TetherError> for CallError {
    fn from(err: &TetherError) -> Self {
        match err {
            TetherError::Call(inner) => inner.clone(),
            other => CallError::new(other.kind_name(), other.to_string()),
        }
    }
}

impl From<TetherError> for CallError {
    fn from(err: TetherError) -> Self {
        match err {
            TetherError::Call(inner) => inner,
            other => CallError::from(&other),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.diagnostic.is_empty() {
            write!(f, "\n{}", self.diagnostic)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallError({:?}: {:?})", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetherError::Routing("no route to 7".into());
        assert_eq!(err.to_string(), "Routing error: no route to 7");

        let err = TetherError::Channel(CHANNEL_REMOTE_MSG.into());
        assert_eq!(err.to_string(), "Channel closed by remote end.");
    }

    #[test]
    fn test_disconnect_and_timeout_are_distinct() {
        let dead = TetherError::Channel(CHANNEL_REMOTE_MSG.into());
        assert!(dead.is_disconnect());
        assert!(!dead.is_timeout());

        let timeout = TetherError::Timeout;
        assert!(timeout.is_timeout());
        assert!(!timeout.is_disconnect());
    }

    #[test]
    fn test_call_error_display_includes_diagnostic() {
        let err = CallError::new("ValueError", "boom").with_diagnostic("  in example.fail");
        let text = err.to_string();
        assert!(text.starts_with("ValueError: boom"));
        assert!(text.contains("in example.fail"));
    }

    #[test]
    fn test_call_error_from_tether_error_keeps_kind() {
        let err = CallError::from(TetherError::UnknownTarget("nope.func".into()));
        assert_eq!(err.kind, "UnknownTargetError");
        assert!(err.message.contains("nope.func"));

        let inner = CallError::msg("inner");
        let round = CallError::from(TetherError::Call(inner.clone()));
        assert_eq!(round, inner);
    }
}
