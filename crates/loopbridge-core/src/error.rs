//! Error types for loopbridge.
//!
//! [`HostError`] is what host code sees when a dispatched call, an event
//! loop or a host callback fails. [`ConfigError`] covers loading and saving
//! the tunables file.

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Result type alias for host-side operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Non-local control transfers that can escape a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    Return,
    Break,
    Continue,
    Retry,
    Redo,
    Throw,
}

impl fmt::Display for JumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JumpKind::Return => "return",
            JumpKind::Break => "break",
            JumpKind::Continue => "next",
            JumpKind::Retry => "retry",
            JumpKind::Redo => "redo",
            JumpKind::Throw => "throw",
        };
        f.write_str(name)
    }
}

/// Errors raised on the host side of the bridge.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// Generic embedded failure, carrying the embedded error text and backtrace.
    #[error("{message}")]
    Runtime {
        message: String,
        backtrace: Option<String>,
    },

    /// Unknown command.
    #[error("{0}")]
    Name(String),

    /// Bad arity or bad value.
    #[error("{0}")]
    Argument(String),

    /// Privileged operation attempted from an unprivileged context.
    #[error("{0}")]
    Security(String),

    /// Process exit requested from inside the embedded interpreter.
    #[error("exit {0}")]
    SystemExit(i32),

    /// Non-local control flow escaping a callback.
    #[error("unexpected {0}")]
    LocalJump(JumpKind),

    /// Unrecoverable failure. Never deferred.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Host-level interrupt (for example Ctrl-C).
    #[error("interrupted")]
    Interrupt,
}

impl HostError {
    /// Build a runtime error without a backtrace.
    pub fn runtime(message: impl Into<String>) -> Self {
        HostError::Runtime {
            message: message.into(),
            backtrace: None,
        }
    }

    /// The backtrace captured from the embedded side, if any.
    pub fn backtrace(&self) -> Option<&str> {
        match self {
            HostError::Runtime { backtrace, .. } => backtrace.as_deref(),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::Fatal(_))
    }

    /// Classify a panic payload caught at a host/embedded boundary.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic in callback".to_string()
        };
        HostError::Fatal(message)
    }
}

/// Errors that can occur while handling the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A tunable is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Config file not found at {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_keeps_backtrace() {
        let err = HostError::Runtime {
            message: "boom".to_string(),
            backtrace: Some("boom\n    while executing\n\"error boom\"".to_string()),
        };
        assert_eq!(err.to_string(), "boom");
        assert!(err.backtrace().unwrap().contains("while executing"));
        assert!(HostError::runtime("x").backtrace().is_none());
    }

    #[test]
    fn test_panic_payload_becomes_fatal() {
        let err = HostError::from_panic(Box::new("kaput"));
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "fatal: kaput");

        let err = HostError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "fatal: owned");
    }

    #[test]
    fn test_jump_kind_names() {
        assert_eq!(HostError::LocalJump(JumpKind::Break).to_string(), "unexpected break");
        assert_eq!(JumpKind::Continue.to_string(), "next");
    }
}
