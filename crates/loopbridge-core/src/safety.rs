//! Per-thread privilege (safe) levels.
//!
//! Level 0 is fully trusted. From [`PRIVILEGED_LEVEL`] upwards a thread may
//! not touch scheduler tunables or queue work at the head of the dispatch
//! queue. Dispatched work runs at the level captured when it was submitted.

use std::cell::Cell;

use crate::error::{HostError, Result};

/// First level at which privileged operations are refused.
pub const PRIVILEGED_LEVEL: u8 = 4;

thread_local! {
    static LEVEL: Cell<u8> = const { Cell::new(0) };
}

/// The calling thread's current level.
pub fn level() -> u8 {
    LEVEL.with(|l| l.get())
}

/// Run `f` at `level`, restoring the previous level afterwards (also on unwind).
pub fn with_level<R>(level: u8, f: impl FnOnce() -> R) -> R {
    struct Restore(u8);
    impl Drop for Restore {
        fn drop(&mut self) {
            LEVEL.with(|l| l.set(self.0));
        }
    }

    let previous = LEVEL.with(|l| l.replace(level));
    let _restore = Restore(previous);
    f()
}

/// Refuse `operation` when the calling thread runs at a privileged-restricted level.
pub fn require_privileged(operation: &str) -> Result<()> {
    let current = level();
    if current >= PRIVILEGED_LEVEL {
        log::debug!("refusing {operation} at safe level {current}");
        return Err(HostError::Security(format!(
            "Insecure operation `{operation}' at level {current}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_is_trusted() {
        assert_eq!(level(), 0);
        assert!(require_privileged("set_event_loop_tick").is_ok());
    }

    #[test]
    fn test_with_level_restores() {
        let inner = with_level(PRIVILEGED_LEVEL, || {
            assert!(matches!(
                require_privileged("invoke_immediate"),
                Err(HostError::Security(_))
            ));
            level()
        });
        assert_eq!(inner, PRIVILEGED_LEVEL);
        assert_eq!(level(), 0);
    }

    #[test]
    fn test_with_level_restores_on_panic() {
        let caught = std::panic::catch_unwind(|| with_level(3, || panic!("boom")));
        assert!(caught.is_err());
        assert_eq!(level(), 0);
    }
}
