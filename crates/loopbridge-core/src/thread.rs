//! Host thread identities.
//!
//! A [`HostThread`] is a cloneable handle to an OS thread that participates
//! in the bridge. Besides waking the thread it reports whether the thread is
//! still alive, whether it is parked (non-runnable) and whether it is
//! currently driving an event loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

struct ThreadState {
    handle: Thread,
    alive: AtomicBool,
    parked: AtomicBool,
    loops: AtomicUsize,
}

/// Marks the owning thread dead when its thread-local storage is torn down.
struct Liveness(Arc<ThreadState>);

impl Drop for Liveness {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

thread_local! {
    static CURRENT: Liveness = Liveness(Arc::new(ThreadState {
        handle: thread::current(),
        alive: AtomicBool::new(true),
        parked: AtomicBool::new(false),
        loops: AtomicUsize::new(0),
    }));
}

/// Handle to a thread taking part in loop ownership and dispatch.
#[derive(Clone)]
pub struct HostThread {
    inner: Arc<ThreadState>,
}

impl HostThread {
    /// The calling thread.
    pub fn current() -> Self {
        CURRENT
            .try_with(|l| HostThread {
                inner: l.0.clone(),
            })
            .unwrap_or_else(|_| HostThread {
                // Thread-local storage is already gone: the thread is exiting.
                inner: Arc::new(ThreadState {
                    handle: thread::current(),
                    alive: AtomicBool::new(false),
                    parked: AtomicBool::new(false),
                    loops: AtomicUsize::new(0),
                }),
            })
    }

    pub fn id(&self) -> ThreadId {
        self.inner.handle.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.handle.name()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// True while the thread is blocked and cannot make progress on its own.
    pub fn is_parked(&self) -> bool {
        self.inner.parked.load(Ordering::SeqCst)
    }

    /// True while the thread is alive and inside at least one event loop.
    pub fn is_looping(&self) -> bool {
        self.is_alive() && self.inner.loops.load(Ordering::SeqCst) > 0
    }

    pub fn is_current(&self) -> bool {
        self.id() == thread::current().id()
    }

    /// Wake this thread if it is parked. Never wakes anyone else.
    pub fn unpark(&self) {
        self.inner.handle.unpark();
    }

    /// Park the calling thread for at most `timeout`.
    ///
    /// Must be called on the thread this handle refers to.
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        debug_assert!(self.is_current());
        let _parked = self.mark_parked();
        thread::park_timeout(timeout);
    }

    /// Report the thread as parked until the guard is dropped.
    pub(crate) fn mark_parked(&self) -> ParkedGuard {
        let was = self.inner.parked.swap(true, Ordering::SeqCst);
        ParkedGuard {
            thread: self.clone(),
            was,
        }
    }

    pub(crate) fn loop_entered(&self) {
        self.inner.loops.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn loop_exited(&self) {
        let _ = self
            .inner
            .loops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl PartialEq for HostThread {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for HostThread {}

impl std::fmt::Debug for HostThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostThread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("alive", &self.is_alive())
            .field("parked", &self.is_parked())
            .finish()
    }
}

/// Clears the parked mark on drop, restoring the previous value.
pub(crate) struct ParkedGuard {
    thread: HostThread,
    was: bool,
}

impl Drop for ParkedGuard {
    fn drop(&mut self) {
        self.thread.inner.parked.store(self.was, Ordering::SeqCst);
    }
}
