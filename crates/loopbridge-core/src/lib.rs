//! loopbridge - event-loop ownership and cross-thread dispatch for a
//! single-threaded embedded interpreter.
//!
//! An embedded interpreter with its own event loop may only be touched by
//! one OS thread at a time. This crate lets any number of host threads use
//! it safely:
//!
//! - **Scheduler** - one loop owner at a time, re-entrant loops, fair
//!   time-slicing while other threads take part
//! - **Dispatch** - queue work onto the loop owner and park until it is done
//! - **Watchdog** - keep a live loop owner running, replace a stalled one
//! - **Signals** - carry exits, interrupts and `break`-style control flow
//!   across the host/embedded boundary, deferred until nesting unwinds
//! - **Environments** - reference-guarded interpreters that survive a
//!   concurrent delete until the last in-flight call returns
//!
//! # Architecture
//!
//! A [`SchedulerContext`] holds all scheduling state and is shared by every
//! [`InterpHandle`] that runs on it. Embedded interpreters plug in through
//! the [`Interpreter`] and [`EventSource`] traits; [`ScriptInterp`] and
//! [`Notifier`] are the bundled implementations.

pub mod config;
pub mod dispatch;
pub mod environment;
pub mod error;
mod gate;
pub mod handle;
pub mod interp;
pub mod notifier;
pub mod safety;
pub mod scheduler;
pub mod script;
pub mod signal;
pub mod thread;
pub mod watchdog;

pub use config::LoopConfig;
pub use environment::{EnvGuard, Environment};
pub use error::{ConfigError, HostError, JumpKind, Result};
pub use handle::InterpHandle;
pub use interp::{EmbeddedError, Interpreter, NativeCommand, ReturnCode, VarFlags};
pub use notifier::{EventFlags, EventSource, Notifier, QueuePosition};
pub use scheduler::{AbortPolicy, OwnershipToken, RunOptions, SchedulerContext, Tunables};
pub use script::ScriptInterp;
pub use signal::ControlSignal;
pub use thread::HostThread;
pub use watchdog::Watchdog;
