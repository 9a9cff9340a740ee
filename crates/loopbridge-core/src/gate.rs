//! The poll gate.
//!
//! Only the thread holding the gate may touch the embedded interpreter or
//! poll its event source. The gate is re-entrant so that host callbacks run
//! by the interpreter can call back into it. A thread that is about to
//! block releases every level it holds with [`LoopGate::unlocked`] and takes
//! them all back afterwards.

use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    holder: Option<ThreadId>,
    count: usize,
}

#[derive(Default)]
pub(crate) struct LoopGate {
    state: Mutex<GateState>,
    free: Condvar,
}

impl LoopGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self) -> GateGuard<'_> {
        self.take(1);
        GateGuard {
            gate: self,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn held_by_current(&self) -> bool {
        self.hold_count() > 0
    }

    /// How many levels the calling thread holds.
    pub(crate) fn hold_count(&self) -> usize {
        let me = thread::current().id();
        let state = self.state.lock();
        if state.holder == Some(me) {
            state.count
        } else {
            0
        }
    }

    /// Run `f` with every level held by the calling thread released.
    pub(crate) fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let count = self.release_all();
        let _relock = Relock { gate: self, count };
        f()
    }

    fn take(&self, levels: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.holder.is_some_and(|holder| holder != me) {
            self.free.wait(&mut state);
        }
        state.holder = Some(me);
        state.count += levels;
    }

    fn release_all(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder != Some(me) {
            return 0;
        }
        let count = std::mem::take(&mut state.count);
        state.holder = None;
        drop(state);
        self.free.notify_all();
        count
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a LoopGate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            state.holder = None;
            drop(state);
            self.gate.free.notify_all();
        }
    }
}

struct Relock<'a> {
    gate: &'a LoopGate,
    count: usize,
}

impl Drop for Relock<'_> {
    fn drop(&mut self) {
        if self.count > 0 {
            self.gate.take(self.count);
        }
    }
}
