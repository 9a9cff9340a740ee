//! The embedded interpreter as seen by the bridge.
//!
//! The bridge never looks inside the interpreter. It evaluates scripts,
//! invokes commands and reads or writes variables through [`Interpreter`],
//! and installs host callbacks as [`NativeCommand`]s.
//!
//! Implementations must be re-entrant: a native command may call back into
//! the same interpreter on the same thread while an evaluation is running.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

/// Completion codes of the embedded interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnCode {
    #[default]
    Ok,
    Error,
    Return,
    Break,
    Continue,
}

impl ReturnCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ReturnCode::Ok => 0,
            ReturnCode::Error => 1,
            ReturnCode::Return => 2,
            ReturnCode::Break => 3,
            ReturnCode::Continue => 4,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ReturnCode::Ok),
            1 => Some(ReturnCode::Error),
            2 => Some(ReturnCode::Return),
            3 => Some(ReturnCode::Break),
            4 => Some(ReturnCode::Continue),
            _ => None,
        }
    }
}

/// A non-`Ok` completion of an embedded call.
///
/// For `Return` the message carries the returned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedError {
    pub code: ReturnCode,
    pub message: String,
    pub error_info: Option<String>,
}

impl EmbeddedError {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ReturnCode::Error,
            message: message.into(),
            error_info: None,
        }
    }

    pub fn with_code(code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            error_info: None,
        }
    }
}

impl fmt::Display for EmbeddedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code.as_i32())
    }
}

impl std::error::Error for EmbeddedError {}

bitflags! {
    /// Variable access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VarFlags: u32 {
        const GLOBAL_ONLY = 1 << 0;
        const LEAVE_ERR_MSG = 1 << 1;
        const APPEND_VALUE = 1 << 2;
        const LIST_ELEMENT = 1 << 3;
    }
}

/// A host callback installed as an embedded command.
///
/// Receives the full argument vector, command name first.
pub type NativeCommand = Arc<dyn Fn(&[String]) -> Result<String, EmbeddedError> + Send + Sync>;

/// Collaborator surface of the embedded interpreter.
pub trait Interpreter: Send + Sync {
    fn evaluate(&self, script: &str) -> Result<String, EmbeddedError>;

    /// Invoke `name` with `args` (not including the name) without script parsing.
    fn invoke_command(&self, name: &str, args: &[String]) -> Result<String, EmbeddedError>;

    fn has_command(&self, name: &str) -> bool;

    fn get_variable(
        &self,
        name: &str,
        index: Option<&str>,
        flags: VarFlags,
    ) -> Result<String, EmbeddedError>;

    fn set_variable(
        &self,
        name: &str,
        index: Option<&str>,
        value: &str,
        flags: VarFlags,
    ) -> Result<String, EmbeddedError>;

    fn unset_variable(&self, name: &str, index: Option<&str>, flags: VarFlags) -> bool;

    /// Number of writes and unsets seen by variable `name` so far.
    ///
    /// Callable from any thread; used to wait for a variable to change.
    fn variable_generation(&self, name: &str) -> u64;

    fn register_native_command(&self, name: &str, command: NativeCommand);

    /// Append to the error trace of the error currently being reported.
    fn add_error_info(&self, info: &str);

    fn is_deleted(&self) -> bool;

    /// Tear the interpreter down. Further calls fail.
    fn delete(&self);

    /// Drop all script state. Native commands stay installed.
    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_code_numbers() {
        for code in [
            ReturnCode::Ok,
            ReturnCode::Error,
            ReturnCode::Return,
            ReturnCode::Break,
            ReturnCode::Continue,
        ] {
            assert_eq!(ReturnCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ReturnCode::from_i32(7), None);
        assert_eq!(ReturnCode::Break.as_i32(), 3);
    }

    #[test]
    fn test_embedded_error_display() {
        let err = EmbeddedError::error("invalid command name \"nope\"");
        assert_eq!(err.to_string(), "invalid command name \"nope\" (code 1)");
    }
}
