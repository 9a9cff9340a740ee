//! Supervisor that keeps one live loop owner running.
//!
//! The watchdog spawns a loop thread whenever nobody owns the loop, and
//! replaces an owner that has stopped making progress while parked (for
//! example one blocked in host code).

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{HostError, Result};
use crate::scheduler::{RunOptions, SchedulerContext};
use crate::thread::HostThread;

/// Consecutive stalled checks before the owner is replaced.
pub const EVLOOP_WAKEUP_CHANCE: u32 = 3;

pub(crate) struct WatchdogSlot {
    thread: HostThread,
    generation: u64,
}

/// Watchdog bound to one scheduler.
#[derive(Debug, Clone)]
pub struct Watchdog {
    ctx: SchedulerContext,
}

impl Watchdog {
    pub fn new(ctx: &SchedulerContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Whether a live watchdog supervises this scheduler.
    pub fn is_running(&self) -> bool {
        self.ctx
            .shared
            .watchdog
            .lock()
            .as_ref()
            .is_some_and(|slot| slot.thread.is_alive())
    }

    /// Supervise the loop on the calling thread.
    ///
    /// Returns at once if another live watchdog already runs. Otherwise runs
    /// until [`Watchdog::stop`] is called, until the last root environment
    /// is gone (with `check_root`), or until a loop thread fails. On return
    /// every loop is stopped.
    pub fn run(&self, check_root: bool) -> Result<()> {
        let me = HostThread::current();
        let generation = {
            let mut slot = self.ctx.shared.watchdog.lock();
            if let Some(existing) = slot.as_ref() {
                if existing.thread.is_alive() {
                    log::debug!("watchdog already running on {:?}", existing.thread.id());
                    return Ok(());
                }
                log::debug!("replacing dead watchdog");
            }
            let generation = self.ctx.shared.watchdog_generation.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Some(WatchdogSlot {
                thread: me,
                generation,
            });
            generation
        };
        log::info!("watchdog started");

        let _registration = self.ctx.register_thread();
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        let result = self.supervise(generation, check_root, &err_tx, &err_rx);

        self.ctx.stop();
        {
            let mut slot = self.ctx.shared.watchdog.lock();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                *slot = None;
            }
        }
        log::info!("watchdog stopped");
        result
    }

    fn supervise(
        &self,
        generation: u64,
        check_root: bool,
        err_tx: &Sender<HostError>,
        err_rx: &Receiver<HostError>,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let mut last_counter = ctx.loop_counter();
        let mut chance = 0u32;

        loop {
            if ctx.shared.watchdog_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }

            let owner = ctx.owner();
            match &owner {
                None => {
                    log::debug!("watchdog: no loop owner, spawning one");
                    self.spawn_loop_thread(check_root, err_tx.clone())?;
                    chance = 0;
                }
                Some(thread) if !thread.is_alive() => {
                    log::warn!("watchdog: loop owner {:?} died, spawning a new one", thread.id());
                    self.spawn_loop_thread(check_root, err_tx.clone())?;
                    chance = 0;
                }
                Some(thread) => {
                    let counter = ctx.loop_counter();
                    if counter == last_counter && thread.is_parked() {
                        chance += 1;
                    } else {
                        chance = 0;
                    }
                    last_counter = counter;
                    if chance >= EVLOOP_WAKEUP_CHANCE {
                        log::warn!("watchdog: loop owner {:?} stalled, spawning a new one", thread.id());
                        self.spawn_loop_thread(check_root, err_tx.clone())?;
                        chance = 0;
                    }
                }
            }

            let tunables = ctx.tunables();
            let busy = ctx.shared.waiters.load(Ordering::SeqCst) > 0
                || ctx.is_waiting_for_events()
                || owner.as_ref().is_some_and(HostThread::is_parked);
            let interval = if busy {
                tunables.watchdog_interval
            } else {
                tunables.no_thread_interrupt_time
            };

            match err_rx.recv_timeout(interval) {
                Ok(err) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(HostError::Fatal("watchdog error channel closed".to_string()))
                }
            }

            if check_root && ctx.root_count() == 0 {
                return Ok(());
            }
        }
    }

    fn spawn_loop_thread(&self, check_root: bool, errors: Sender<HostError>) -> Result<()> {
        let ctx = self.ctx.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        thread::Builder::new()
            .name("loopbridge-eventloop".to_string())
            .spawn(move || {
                let token = ctx.enter();
                let _ = ready_tx.send(());
                if let Err(err) = ctx.run_loop(&token, &RunOptions::mainloop(check_root)) {
                    log::error!("event loop thread failed: {err}");
                    let _ = errors.send(err);
                }
            })
            .map_err(|e| HostError::Fatal(format!("failed to spawn event loop thread: {e}")))?;
        // Ownership must be taken before the next check.
        let _ = ready_rx.recv_timeout(Duration::from_secs(1));
        Ok(())
    }

    /// Stop the running watchdog and every loop it started.
    pub fn stop(&self) {
        self.ctx.shared.watchdog_generation.fetch_add(1, Ordering::SeqCst);
        self.ctx.stop();
    }
}
