//! Embedded environments and the reference guard that pins them.
//!
//! An [`Environment`] owns one embedded interpreter. Every code path that
//! runs embedded logic holds an [`EnvGuard`]; deleting the environment marks
//! it deleted at once but only tears the interpreter down once the last
//! guard is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{HostError, Result};
use crate::interp::{Interpreter, ReturnCode};
use crate::scheduler::RootRegistration;

#[derive(Default)]
struct GuardState {
    refcount: usize,
    holders: HashMap<ThreadId, usize>,
    delete_requested: bool,
    torn_down: bool,
}

/// One embedded interpreter plus its lifetime bookkeeping.
pub struct Environment {
    interp: Arc<dyn Interpreter>,
    guard: Mutex<GuardState>,
    released: Condvar,
    allow_fatal_exit: AtomicBool,
    return_code: AtomicI32,
    restricted: bool,
    root: Mutex<Option<RootRegistration>>,
}

impl Environment {
    /// Wrap `interp`. A `root` registration makes this environment count
    /// towards the scheduler's live roots until it is torn down.
    pub fn new(
        interp: Arc<dyn Interpreter>,
        root: Option<RootRegistration>,
        restricted: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            interp,
            guard: Mutex::new(GuardState::default()),
            released: Condvar::new(),
            allow_fatal_exit: AtomicBool::new(false),
            return_code: AtomicI32::new(ReturnCode::Ok.as_i32()),
            restricted,
            root: Mutex::new(root),
        })
    }

    pub fn interp(&self) -> &Arc<dyn Interpreter> {
        &self.interp
    }

    /// Restricted sub-environments cannot drive or tune the event loop.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn is_root(&self) -> bool {
        self.root.lock().is_some()
    }

    pub fn allow_fatal_exit(&self) -> bool {
        self.allow_fatal_exit.load(Ordering::SeqCst)
    }

    pub fn set_allow_fatal_exit(&self, allow: bool) {
        self.allow_fatal_exit.store(allow, Ordering::SeqCst);
    }

    /// Completion code of the last embedded call.
    pub fn return_code(&self) -> i32 {
        self.return_code.load(Ordering::SeqCst)
    }

    pub(crate) fn record_return_code(&self, code: ReturnCode) {
        self.return_code.store(code.as_i32(), Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.guard.lock().delete_requested || self.interp.is_deleted()
    }

    pub fn refcount(&self) -> usize {
        self.guard.lock().refcount
    }

    /// Pin the environment until the returned guard is dropped.
    pub fn preserve(self: &Arc<Self>) -> EnvGuard {
        self.acquire();
        EnvGuard {
            env: self.clone(),
            holder: thread::current().id(),
        }
    }

    /// Increment the reference count for the calling thread.
    pub fn acquire(&self) {
        let mut state = self.guard.lock();
        state.refcount += 1;
        *state.holders.entry(thread::current().id()).or_insert(0) += 1;
    }

    /// Decrement the reference count. Never goes below zero.
    pub fn release(&self) {
        self.release_for(thread::current().id());
    }

    fn release_for(&self, holder: ThreadId) {
        let mut state = self.guard.lock();
        if state.refcount == 0 {
            log::debug!("release on an environment with no references");
            return;
        }
        state.refcount -= 1;
        if let Some(n) = state.holders.get_mut(&holder) {
            *n -= 1;
            if *n == 0 {
                state.holders.remove(&holder);
            }
        }
        if state.refcount == 0 {
            if state.delete_requested && !state.torn_down {
                state.torn_down = true;
                drop(state);
                self.teardown();
            } else {
                drop(state);
            }
            self.released.notify_all();
        }
    }

    /// Delete the environment.
    ///
    /// The environment reads as deleted immediately. If `may_block` is set and
    /// the calling thread holds no guard, this waits until every in-flight
    /// call has released its guard and then tears the interpreter down.
    /// Otherwise teardown happens on the last release. Returns whether the
    /// interpreter is gone on return.
    pub fn delete(&self, may_block: bool) -> bool {
        let mut state = self.guard.lock();
        if state.torn_down {
            return true;
        }
        state.delete_requested = true;
        let holding = state.holders.contains_key(&thread::current().id());
        if state.refcount > 0 && (holding || !may_block) {
            log::debug!(
                "environment delete deferred, {} reference(s) outstanding",
                state.refcount
            );
            return false;
        }
        while state.refcount > 0 {
            self.released.wait(&mut state);
        }
        if state.torn_down {
            return true;
        }
        state.torn_down = true;
        drop(state);
        self.teardown();
        true
    }

    /// Reset the interpreter and swap in a fresh root registration.
    ///
    /// The new registration is taken before the old one is dropped, so a
    /// `check_root` loop never sees the root count reach zero.
    pub fn restart(&self, root: RootRegistration) -> Result<()> {
        if self.is_deleted() {
            return Err(HostError::runtime("interpreter is deleted"));
        }
        self.interp.reset();
        self.record_return_code(ReturnCode::Ok);
        let previous = self.root.lock().replace(root);
        drop(previous);
        Ok(())
    }

    fn teardown(&self) {
        log::debug!("tearing down embedded interpreter");
        self.interp.delete();
        // Dropping the registration wakes a loop waiting on its roots.
        let root = self.root.lock().take();
        drop(root);
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.guard.lock();
        f.debug_struct("Environment")
            .field("refcount", &state.refcount)
            .field("delete_requested", &state.delete_requested)
            .field("torn_down", &state.torn_down)
            .field("restricted", &self.restricted)
            .finish_non_exhaustive()
    }
}

/// Scoped reference on an [`Environment`]; releases on drop, also on unwind.
pub struct EnvGuard {
    env: Arc<Environment>,
    holder: ThreadId,
}

impl EnvGuard {
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        self.env.release_for(self.holder);
    }
}
