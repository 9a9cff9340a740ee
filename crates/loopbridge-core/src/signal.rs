//! Control signals crossing the host/embedded boundary.
//!
//! A host callback run by the embedded interpreter may end in something the
//! interpreter has no word for: a process exit, an interrupt, a `retry`. Such
//! signals are parked in the scheduler's pending slot while the interpreter
//! unwinds its own stack, and re-raised on the host side once the loop
//! depth is back at zero.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{HostError, JumpKind, Result};
use crate::interp::{EmbeddedError, Interpreter, ReturnCode};
use crate::scheduler::{AbortPolicy, SchedulerContext};

/// Classification of how a host call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Return,
    Break,
    Continue,
    Retry,
    Redo,
    Throw,
    Error(String),
    SystemExit(i32),
    Interrupt,
    Fatal,
}

impl HostError {
    pub fn signal(&self) -> ControlSignal {
        match self {
            HostError::LocalJump(JumpKind::Return) => ControlSignal::Return,
            HostError::LocalJump(JumpKind::Break) => ControlSignal::Break,
            HostError::LocalJump(JumpKind::Continue) => ControlSignal::Continue,
            HostError::LocalJump(JumpKind::Retry) => ControlSignal::Retry,
            HostError::LocalJump(JumpKind::Redo) => ControlSignal::Redo,
            HostError::LocalJump(JumpKind::Throw) => ControlSignal::Throw,
            HostError::SystemExit(code) => ControlSignal::SystemExit(*code),
            HostError::Interrupt => ControlSignal::Interrupt,
            HostError::Fatal(_) => ControlSignal::Fatal,
            other => ControlSignal::Error(other.to_string()),
        }
    }
}

/// Convert an embedded failure into the error the host sees.
pub fn to_host(err: EmbeddedError) -> HostError {
    match err.code {
        ReturnCode::Return => HostError::LocalJump(JumpKind::Return),
        ReturnCode::Break => HostError::LocalJump(JumpKind::Break),
        ReturnCode::Continue => HostError::LocalJump(JumpKind::Continue),
        ReturnCode::Ok | ReturnCode::Error => HostError::Runtime {
            message: err.message,
            backtrace: err.error_info,
        },
    }
}

/// Convert the outcome of a failed host callback into an embedded result.
///
/// Signals the interpreter cannot express are stored as pending on `ctx`;
/// the interpreter then unwinds with an error (or a plain return for exits
/// and interrupts) and the loop raises the stored signal later.
pub fn to_embedded(ctx: &SchedulerContext, interp: &dyn Interpreter, err: HostError) -> EmbeddedError {
    match err.signal() {
        ControlSignal::Return => EmbeddedError::with_code(ReturnCode::Return, ""),
        ControlSignal::Break => EmbeddedError::with_code(ReturnCode::Break, ""),
        ControlSignal::Continue => EmbeddedError::with_code(ReturnCode::Continue, ""),
        ControlSignal::Retry | ControlSignal::Redo | ControlSignal::Throw => {
            let message = err.to_string();
            ctx.set_pending(err);
            EmbeddedError::error(message)
        }
        ControlSignal::SystemExit(_) | ControlSignal::Interrupt => {
            ctx.set_pending(err);
            EmbeddedError::with_code(ReturnCode::Return, "")
        }
        ControlSignal::Fatal => {
            let message = err.to_string();
            ctx.set_pending(err);
            EmbeddedError::error(message)
        }
        ControlSignal::Error(message) => {
            if let Some(trace) = err.backtrace() {
                interp.add_error_info(trace);
            }
            EmbeddedError::error(message)
        }
    }
}

/// Run `f`, turning a panic into [`HostError::Fatal`].
pub fn protect<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let err = HostError::from_panic(payload);
            log::error!("callback panicked: {err}");
            Err(err)
        }
    }
}

impl SchedulerContext {
    /// Park `err` for the outer loop. A pending fatal error is never replaced.
    pub fn set_pending(&self, err: HostError) {
        let mut state = self.shared.state.lock();
        if state.pending.as_ref().is_some_and(HostError::is_fatal) {
            log::debug!("dropping {err} behind a pending fatal error");
            return;
        }
        log::trace!("pending exception: {err}");
        state.pending = Some(err);
    }

    pub fn has_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    pub fn take_pending(&self) -> Option<HostError> {
        self.shared.state.lock().pending.take()
    }

    /// Raise the pending exception if the loop is at depth zero.
    ///
    /// Returns `Ok(true)` when an exception stays pending for an outer frame,
    /// `Ok(false)` when there is none. Fatal errors are raised at any depth.
    pub fn check_pending(&self) -> Result<bool> {
        let mut state = self.shared.state.lock();
        match &state.pending {
            None => Ok(false),
            Some(err) if err.is_fatal() => Err(err.clone()),
            Some(_) if state.depth > 0 => Ok(true),
            Some(_) => match state.pending.take() {
                Some(err) => Err(err),
                None => Ok(false),
            },
        }
    }

    /// Apply the configured abort policy to a failed embedded call.
    pub fn apply_abort_policy(&self, err: HostError) -> Result<String> {
        match self.abort_policy() {
            AbortPolicy::Raise => Err(err),
            AbortPolicy::Warn => {
                log::warn!("{err}");
                Ok(String::new())
            }
            AbortPolicy::Ignore => Ok(String::new()),
        }
    }
}
