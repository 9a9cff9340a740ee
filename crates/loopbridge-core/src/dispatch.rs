//! Cross-thread dispatch of work onto the loop owner.
//!
//! A thread that does not own the event loop cannot touch the embedded
//! interpreter. [`SchedulerContext::submit`] wraps its work in a
//! [`WorkItem`], queues it on the event source and parks the caller until
//! the owner has serviced it. The owner itself (or any thread while no loop
//! runs) executes work in place.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::environment::Environment;
use crate::error::{HostError, Result};
use crate::notifier::QueuePosition;
use crate::safety;
use crate::scheduler::SchedulerContext;
use crate::signal::protect;
use crate::thread::HostThread;

type Work<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// One queued call. Serviced at most once, by whoever claims it first.
struct WorkItem<T> {
    work: Mutex<Option<Work<T>>>,
    claimed: AtomicBool,
    done: AtomicBool,
    result: Mutex<Option<Result<T>>>,
    caller: HostThread,
    level: u8,
}

impl<T> WorkItem<T> {
    fn new(work: Work<T>) -> Self {
        Self {
            work: Mutex::new(Some(work)),
            claimed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            caller: HostThread::current(),
            level: safety::level(),
        }
    }

    fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Event handler run by the loop owner.
    fn service(&self) {
        if !self.try_claim() {
            log::trace!("dispatch: item already serviced");
            return;
        }
        self.run();
    }

    /// Run the claimed work at the caller's level and wake the caller.
    fn run(&self) {
        let Some(work) = self.work.lock().take() else {
            return;
        };
        let result = if self.level == safety::level() {
            protect(work)
        } else {
            safety::with_level(self.level, || protect(work))
        };
        *self.result.lock() = Some(result);
        self.done.store(true, Ordering::SeqCst);
        if self.caller.is_alive() {
            self.caller.unpark();
        } else {
            log::debug!("dispatch: caller {:?} is gone, discarding result", self.caller.id());
        }
    }

    fn take_result(&self) -> Result<T> {
        self.result
            .lock()
            .take()
            .unwrap_or_else(|| Err(HostError::Fatal("dispatched call produced no result".to_string())))
    }
}

/// Counts a thread parked until the loop owner did something for it.
pub(crate) struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    pub(crate) fn new(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self(waiters)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps a parked thread on the list the loop owner wakes after each event.
pub(crate) struct Sleeper<'a> {
    ctx: &'a SchedulerContext,
    id: ThreadId,
}

impl Drop for Sleeper<'_> {
    fn drop(&mut self) {
        let mut sleepers = self.ctx.shared.sleepers.lock();
        if let Some(pos) = sleepers.iter().position(|t| t.id() == self.id) {
            sleepers.swap_remove(pos);
        }
    }
}

impl SchedulerContext {
    /// Register `me` to be unparked whenever the owner has run something.
    pub(crate) fn add_sleeper(&self, me: &HostThread) -> Sleeper<'_> {
        self.shared.sleepers.lock().push(me.clone());
        Sleeper { ctx: self, id: me.id() }
    }

    /// Unpark every thread waiting for the loop to make progress.
    pub(crate) fn wake_sleepers(&self) {
        for thread in self.shared.sleepers.lock().iter() {
            thread.unpark();
        }
    }

    /// Whether the calling thread may run embedded work without queueing it.
    pub fn runs_in_place(&self) -> bool {
        if self.shared.gate.held_by_current() {
            return true;
        }
        match self.owner() {
            None => true,
            Some(owner) => owner.is_current() || !owner.is_alive(),
        }
    }

    /// Run `work` on the loop owner and return its result.
    ///
    /// `env` stays pinned for the whole call, including while the caller is
    /// parked. [`QueuePosition::Head`] is refused at privileged safe levels.
    pub fn submit<T, F>(&self, env: &Arc<Environment>, position: QueuePosition, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let _guard = env.preserve();

        if self.runs_in_place() {
            let _gate = self.shared.gate.acquire();
            let result = protect(work);
            self.wake_sleepers();
            return result;
        }

        if position == QueuePosition::Head {
            safety::require_privileged("queue at head")?;
        }

        let item = Arc::new(WorkItem::new(Box::new(work)));
        let me = item.caller.clone();
        let _registration = self.register_thread();
        let _waiting = Waiting::new(&self.shared.waiters);
        {
            let item = item.clone();
            self.shared
                .events
                .queue_event(Box::new(move || item.service()), position);
        }
        log::trace!("dispatch: {:?} queued work at {:?}", me.id(), position);

        let wait = self.tunables().no_thread_interrupt_time;
        while !item.is_done() {
            let reclaim = match self.owner() {
                None => true,
                Some(owner) => !owner.is_alive(),
            };
            if reclaim && item.try_claim() {
                log::debug!("dispatch: no live loop owner, running queued work in place");
                let _gate = self.shared.gate.acquire();
                item.run();
                self.wake_sleepers();
                break;
            }
            me.park_timeout(wait);
        }
        item.take_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RunOptions;
    use crate::script::ScriptInterp;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn env() -> Arc<Environment> {
        Environment::new(Arc::new(ScriptInterp::new()), None, false)
    }

    /// Runs a loop on its own thread until `stop` is set.
    fn spawn_loop(ctx: &SchedulerContext, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let ctx = ctx.clone();
        let (tx, rx) = crossbeam_channel::bounded(0);
        let handle = thread::spawn(move || {
            let token = ctx.enter();
            tx.send(()).unwrap();
            let until = || stop.load(Ordering::SeqCst);
            ctx.run_loop(&token, &RunOptions::wait_for(&until, None)).unwrap();
        });
        rx.recv().unwrap();
        handle
    }

    #[test]
    fn test_owner_runs_in_place() {
        let ctx = SchedulerContext::new();
        let env = env();
        let _token = ctx.enter();
        let me = thread::current().id();
        let ran_on = ctx
            .submit(&env, QueuePosition::Tail, move || Ok(thread::current().id()))
            .unwrap();
        assert_eq!(ran_on, me);
        assert_eq!(ctx.events().pending(), 0);
    }

    #[test]
    fn test_submit_runs_on_loop_thread() {
        let ctx = SchedulerContext::new();
        let env = env();
        let stop = Arc::new(AtomicBool::new(false));
        let looper = spawn_loop(&ctx, stop.clone());
        let owner = ctx.owner().unwrap().id();

        let ran_on = ctx
            .submit(&env, QueuePosition::Tail, || Ok(thread::current().id()))
            .unwrap();
        assert_eq!(ran_on, owner);
        assert_ne!(ran_on, thread::current().id());

        stop.store(true, Ordering::SeqCst);
        ctx.events().wake();
        looper.join().unwrap();
    }

    #[test]
    fn test_error_delivered_once() {
        let ctx = SchedulerContext::new();
        let env = env();
        let stop = Arc::new(AtomicBool::new(false));
        let looper = spawn_loop(&ctx, stop.clone());

        let err = ctx
            .submit::<(), _>(&env, QueuePosition::Tail, || Err(HostError::runtime("remote failure")))
            .unwrap_err();
        assert_eq!(err.to_string(), "remote failure");
        assert_eq!(env.refcount(), 0);

        let err = ctx
            .submit::<(), _>(&env, QueuePosition::Tail, || panic!("remote panic"))
            .unwrap_err();
        assert!(err.is_fatal());

        stop.store(true, Ordering::SeqCst);
        ctx.events().wake();
        looper.join().unwrap();
    }

    #[test]
    fn test_head_runs_before_tail() {
        let ctx = SchedulerContext::new();
        let env = env();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the loop without polling so that items pile up.
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let stop = Arc::new(AtomicBool::new(false));
        let looper = {
            let ctx = ctx.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let token = ctx.enter();
                entered_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                let until = || stop.load(Ordering::SeqCst);
                ctx.run_loop(&token, &RunOptions::wait_for(&until, None)).unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let mut callers = Vec::new();
        for (i, position) in [
            QueuePosition::Tail,
            QueuePosition::Tail,
            QueuePosition::Tail,
            QueuePosition::Head,
        ]
        .into_iter()
        .enumerate()
        {
            let caller_ctx = ctx.clone();
            let env = env.clone();
            let order = order.clone();
            callers.push(thread::spawn(move || {
                caller_ctx.submit(&env, position, move || {
                    order.lock().push(i);
                    Ok(())
                })
                .unwrap();
            }));
            // Queue strictly in submission order.
            while ctx.events().pending() <= i {
                thread::sleep(Duration::from_millis(1));
            }
        }

        go_tx.send(()).unwrap();
        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![3, 0, 1, 2]);

        stop.store(true, Ordering::SeqCst);
        ctx.events().wake();
        looper.join().unwrap();
    }

    #[test]
    fn test_head_refused_when_unprivileged() {
        let ctx = SchedulerContext::new();
        let env = env();
        let stop = Arc::new(AtomicBool::new(false));
        let looper = spawn_loop(&ctx, stop.clone());

        let err = safety::with_level(safety::PRIVILEGED_LEVEL, || {
            ctx.submit(&env, QueuePosition::Head, || Ok(()))
        })
        .unwrap_err();
        assert!(matches!(err, HostError::Security(_)));

        stop.store(true, Ordering::SeqCst);
        ctx.events().wake();
        looper.join().unwrap();
    }

    #[test]
    fn test_work_runs_at_callers_level() {
        let ctx = SchedulerContext::new();
        let env = env();
        let stop = Arc::new(AtomicBool::new(false));
        let looper = spawn_loop(&ctx, stop.clone());

        let level = safety::with_level(2, || {
            ctx.submit(&env, QueuePosition::Tail, || Ok(safety::level()))
        })
        .unwrap();
        assert_eq!(level, 2);

        stop.store(true, Ordering::SeqCst);
        ctx.events().wake();
        looper.join().unwrap();
    }

    #[test]
    fn test_reclaims_work_when_loop_stops() {
        let ctx = SchedulerContext::new();
        let env = env();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let owner = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let _token = ctx.enter();
                entered_tx.send(()).unwrap();
                // Never polls.
                release_rx.recv().unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let stopper = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ctx.stop();
            })
        };
        let value = ctx.submit(&env, QueuePosition::Tail, || Ok(42)).unwrap();
        assert_eq!(value, 42);

        stopper.join().unwrap();
        release_tx.send(()).unwrap();
        owner.join().unwrap();
        // The queued copy is a no-op once claimed.
        assert!(ctx.do_one_event(None, false).unwrap());
        assert_eq!(ctx.events().pending(), 0);
    }
}
