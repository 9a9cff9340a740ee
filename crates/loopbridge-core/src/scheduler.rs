//! Event-loop ownership and scheduling.
//!
//! A [`SchedulerContext`] decides which host thread may poll the embedded
//! event loop. Entering a loop pushes the previous owner onto a stack and
//! takes ownership; leaving it hands ownership back to the most recent
//! stacked owner that is still driving a loop.
//!
//! [`SchedulerContext::run_loop`] runs in one of two regimes:
//!
//! - **solo**: no other host thread takes part. The owner blocks on the event
//!   source; a fallback timer still gives it regular control points for
//!   interrupt delivery.
//! - **shared**: other threads exist. The owner processes up to `loop_max`
//!   events per turn, charging `no_event_tick` for every empty poll followed
//!   by a sleep of at most `no_event_wait`, and gives up its turn early when
//!   the tick timer fires.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::LoopConfig;
use crate::environment::Environment;
use crate::error::{HostError, Result};
use crate::gate::LoopGate;
use crate::notifier::{EventFlags, EventSource, Notifier, TimerToken};
use crate::safety;
use crate::thread::HostThread;
use crate::watchdog::WatchdogSlot;

pub const DEFAULT_EVENT_LOOP_MAX: u32 = 800;
pub const DEFAULT_NO_EVENT_TICK: u32 = 10;
pub const DEFAULT_NO_EVENT_WAIT: Duration = Duration::from_millis(20);
pub const DEFAULT_TIMER_TICK: Duration = Duration::ZERO;
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(10);
pub const NO_THREAD_INTERRUPT_TIME: Duration = Duration::from_millis(100);

/// What to do when an embedded call fails or names an unknown command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortPolicy {
    /// Raise the error to the host.
    #[default]
    Raise,
    /// Log a warning and return an empty result.
    Warn,
    /// Silently return an empty result.
    Ignore,
}

impl AbortPolicy {
    /// `Some(true)` raises, `Some(false)` warns, `None` ignores.
    pub fn from_tristate(value: Option<bool>) -> Self {
        match value {
            Some(true) => AbortPolicy::Raise,
            Some(false) => AbortPolicy::Warn,
            None => AbortPolicy::Ignore,
        }
    }

    pub fn as_tristate(self) -> Option<bool> {
        match self {
            AbortPolicy::Raise => Some(true),
            AbortPolicy::Warn => Some(false),
            AbortPolicy::Ignore => None,
        }
    }
}

/// Fairness tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub loop_max: u32,
    pub no_event_tick: u32,
    pub no_event_wait: Duration,
    /// Requested tick timer period; zero disables it.
    pub timer_tick: Duration,
    pub watchdog_interval: Duration,
    pub no_thread_interrupt_time: Duration,
    /// Cap on a single blocking wait for events; `None` waits until one arrives.
    pub max_block_time: Option<Duration>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            loop_max: DEFAULT_EVENT_LOOP_MAX,
            no_event_tick: DEFAULT_NO_EVENT_TICK,
            no_event_wait: DEFAULT_NO_EVENT_WAIT,
            timer_tick: DEFAULT_TIMER_TICK,
            watchdog_interval: WATCHDOG_INTERVAL,
            no_thread_interrupt_time: NO_THREAD_INTERRUPT_TIME,
            max_block_time: None,
        }
    }
}

/// Ownership bookkeeping. Only mutated under the state lock.
#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) owner: Option<HostThread>,
    pub(crate) stack: Vec<Option<HostThread>>,
    pub(crate) depth: usize,
    pub(crate) pending: Option<HostError>,
    tick_timer: Option<TimerToken>,
    /// Effective tick period; the solo regime raises it to the fallback period.
    timer_tick: Duration,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) gate: LoopGate,
    pub(crate) events: Arc<dyn EventSource>,
    tunables: RwLock<Tunables>,
    abort_policy: RwLock<AbortPolicy>,
    run_timer_flag: AtomicBool,
    wait_event: AtomicBool,
    loop_counter: AtomicU64,
    interrupt: Arc<AtomicBool>,
    roots: AtomicUsize,
    participants: Mutex<HashMap<ThreadId, usize>>,
    pub(crate) waiters: AtomicUsize,
    pub(crate) sleepers: Mutex<Vec<HostThread>>,
    pub(crate) watchdog: Mutex<Option<WatchdogSlot>>,
    pub(crate) watchdog_generation: AtomicU64,
}

/// Handle to one scheduler. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SchedulerContext {
    pub(crate) shared: Arc<Shared>,
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`SchedulerContext::run_until`].
#[derive(Default, Clone, Copy)]
pub struct RunOptions<'a> {
    /// Stop once no root environment is left.
    pub check_root: bool,
    /// Bounded flush: poll with these flags (plus `DONT_WAIT`) until nothing is left.
    pub update: Option<EventFlags>,
    /// Wait condition; the loop returns `true` once it holds.
    pub stop: Option<&'a (dyn Fn() -> bool + 'a)>,
    /// Give up (returning `false`) if this environment is deleted mid-wait.
    pub related: Option<&'a Environment>,
}

impl<'a> RunOptions<'a> {
    pub fn mainloop(check_root: bool) -> Self {
        Self {
            check_root,
            ..Self::default()
        }
    }

    pub fn update(flags: EventFlags) -> Self {
        Self {
            update: Some(flags),
            ..Self::default()
        }
    }

    pub fn wait_for(stop: &'a (dyn Fn() -> bool + 'a), related: Option<&'a Environment>) -> Self {
        Self {
            stop: Some(stop),
            related,
            ..Self::default()
        }
    }
}

/// Proof of loop ownership for the current thread. Dropping it leaves the loop.
pub struct OwnershipToken {
    ctx: SchedulerContext,
    thread: HostThread,
    _registration: ThreadRegistration,
    _not_send: PhantomData<*const ()>,
}

impl OwnershipToken {
    pub fn thread(&self) -> &HostThread {
        &self.thread
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        self.ctx.exit(&self.thread);
    }
}

/// Open while host code runs inside an embedded call. Raises the loop depth
/// so that exceptions raised meanwhile stay pending.
pub(crate) struct CallbackFrame {
    shared: Arc<Shared>,
}

impl Drop for CallbackFrame {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.depth = state.depth.saturating_sub(1);
    }
}

/// Marks a host thread as taking part, which switches the loop to the shared regime.
pub struct ThreadRegistration {
    shared: Weak<Shared>,
    id: ThreadId,
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut participants = shared.participants.lock();
            if let Some(n) = participants.get_mut(&self.id) {
                *n -= 1;
                if *n == 0 {
                    participants.remove(&self.id);
                }
            }
        }
    }
}

/// Counts one live root environment until dropped.
pub struct RootRegistration {
    shared: Weak<Shared>,
}

impl Drop for RootRegistration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.roots.fetch_sub(1, Ordering::SeqCst);
            shared.events.wake();
        }
    }
}

impl SchedulerContext {
    pub fn new() -> Self {
        Self::with_event_source(Arc::new(Notifier::new()), Tunables::default())
    }

    pub fn with_config(config: &LoopConfig) -> Self {
        let ctx = Self::with_event_source(Arc::new(Notifier::new()), config.tunables());
        ctx.set_abort_policy(config.errors.abort_on_exception);
        ctx
    }

    pub fn with_event_source(events: Arc<dyn EventSource>, tunables: Tunables) -> Self {
        let state = SchedulerState {
            timer_tick: tunables.timer_tick,
            ..SchedulerState::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                gate: LoopGate::new(),
                events,
                tunables: RwLock::new(tunables),
                abort_policy: RwLock::new(AbortPolicy::default()),
                run_timer_flag: AtomicBool::new(false),
                wait_event: AtomicBool::new(false),
                loop_counter: AtomicU64::new(0),
                interrupt: Arc::new(AtomicBool::new(false)),
                roots: AtomicUsize::new(0),
                participants: Mutex::new(HashMap::new()),
                waiters: AtomicUsize::new(0),
                sleepers: Mutex::new(Vec::new()),
                watchdog: Mutex::new(None),
                watchdog_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn events(&self) -> &Arc<dyn EventSource> {
        &self.shared.events
    }

    pub fn owner(&self) -> Option<HostThread> {
        self.shared.state.lock().owner.clone()
    }

    pub fn is_owner(&self, thread: &HostThread) -> bool {
        self.shared.state.lock().owner.as_ref() == Some(thread)
    }

    /// `None` if no loop runs, otherwise whether the caller is the loop owner.
    pub fn is_loop_thread(&self) -> Option<bool> {
        self.owner().map(|owner| owner.is_current())
    }

    /// Current re-entrancy depth of the loop owner.
    pub fn depth(&self) -> usize {
        self.shared.state.lock().depth
    }

    /// Progress counter bumped at every loop control point.
    pub fn loop_counter(&self) -> u64 {
        self.shared.loop_counter.load(Ordering::SeqCst)
    }

    /// Whether the loop is currently time-slicing for other threads.
    pub fn is_waiting_for_events(&self) -> bool {
        self.shared.wait_event.load(Ordering::SeqCst)
    }

    pub fn register_thread(&self) -> ThreadRegistration {
        let id = thread::current().id();
        *self.shared.participants.lock().entry(id).or_insert(0) += 1;
        ThreadRegistration {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// True if no thread other than `me` takes part.
    pub fn is_alone(&self, me: &HostThread) -> bool {
        let id = me.id();
        self.shared
            .participants
            .lock()
            .keys()
            .all(|participant| *participant == id)
    }

    pub fn register_root(&self) -> RootRegistration {
        self.shared.roots.fetch_add(1, Ordering::SeqCst);
        RootRegistration {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn root_count(&self) -> usize {
        self.shared.roots.load(Ordering::SeqCst)
    }

    pub(crate) fn callback_frame(&self) -> CallbackFrame {
        self.shared.state.lock().depth += 1;
        CallbackFrame {
            shared: self.shared.clone(),
        }
    }

    /// Take loop ownership for the calling thread.
    pub fn enter(&self) -> OwnershipToken {
        let me = HostThread::current();
        let registration = self.register_thread();
        me.loop_entered();
        {
            let mut state = self.shared.state.lock();
            let parent = state.owner.clone();
            if parent.as_ref() == Some(&me) {
                state.depth += 1;
                log::trace!("event loop: recursive entry, depth {}", state.depth);
            } else {
                log::trace!("event loop: {:?} -> {:?}", parent.as_ref().map(HostThread::id), me.id());
            }
            state.stack.push(parent);
            state.owner = Some(me.clone());
        }
        // A previous owner blocked on the event source must notice the hand-off.
        self.shared.events.wake();
        OwnershipToken {
            ctx: self.clone(),
            thread: me,
            _registration: registration,
            _not_send: PhantomData,
        }
    }

    fn exit(&self, me: &HostThread) {
        me.loop_exited();
        let mut state = self.shared.state.lock();
        if state.owner.as_ref() != Some(me) {
            log::trace!("event loop: {:?} finished while not owner", me.id());
            return;
        }
        loop {
            match state.stack.pop() {
                None | Some(None) => {
                    state.owner = None;
                    break;
                }
                Some(Some(thread)) if thread == *me => {
                    state.depth = state.depth.saturating_sub(1);
                    state.owner = Some(thread);
                    log::trace!("event loop: back from recursive call, depth {}", state.depth);
                    break;
                }
                Some(Some(thread)) if thread.is_looping() => {
                    log::trace!("event loop: handing ownership back to {:?}", thread.id());
                    thread.unpark();
                    state.owner = Some(thread);
                    break;
                }
                Some(Some(thread)) => {
                    log::trace!("event loop: skipping finished owner {:?}", thread.id());
                }
            }
        }
        if state.owner.is_none() {
            self.cancel_tick_timer(&mut state);
            self.shared.run_timer_flag.store(false, Ordering::SeqCst);
        }
        drop(state);
        self.shared.events.wake();
    }

    /// Stop every running loop: the owner becomes `none` and the stack is cleared.
    pub fn stop(&self) {
        let woken: Vec<HostThread> = {
            let mut state = self.shared.state.lock();
            let mut threads: Vec<HostThread> = state.stack.drain(..).flatten().collect();
            threads.extend(state.owner.take());
            self.cancel_tick_timer(&mut state);
            threads
        };
        log::debug!("event loop: stopped, waking {} thread(s)", woken.len());
        for thread in woken {
            thread.unpark();
        }
        self.shared.events.wake();
    }

    /// Request an interrupt; the running loop raises it at its next control point.
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::SeqCst);
        if let Some(owner) = self.owner() {
            owner.unpark();
        }
        self.shared.events.wake();
    }

    /// The flag behind [`SchedulerContext::interrupt`], for signal handlers.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.shared.interrupt.clone()
    }

    pub fn interrupt_pending(&self) -> bool {
        self.shared.interrupt.load(Ordering::SeqCst)
    }

    /// Clear a pending interrupt, returning whether there was one.
    pub fn take_interrupt(&self) -> bool {
        self.shared.interrupt.swap(false, Ordering::SeqCst)
    }

    /// Run blocking host code. The thread reads as parked and gives up the
    /// poll gate while `f` runs.
    pub fn suspend_while<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = HostThread::current();
        let _parked = me.mark_parked();
        self.shared.gate.unlocked(f)
    }

    fn may_poll(&self, me: &HostThread) -> bool {
        match &self.shared.state.lock().owner {
            None => true,
            Some(owner) => owner == me,
        }
    }

    /// Poll the event source once. Blocks (outside the gate) for an event
    /// unless `flags` contains `DONT_WAIT`.
    pub fn run_iteration(&self, flags: EventFlags) -> Result<bool> {
        let me = HostThread::current();
        if !flags.contains(EventFlags::DONT_WAIT) {
            let cap = self.tunables().max_block_time;
            self.shared
                .gate
                .unlocked(|| self.shared.events.wait_for_event(flags, cap));
        }
        let _gate = self.shared.gate.acquire();
        if !self.may_poll(&me) {
            return Ok(false);
        }
        let found = panic::catch_unwind(AssertUnwindSafe(|| {
            self.shared
                .events
                .poll_one_event(flags | EventFlags::DONT_WAIT)
        }))
        .map_err(HostError::from_panic)?;
        if found {
            self.wake_sleepers();
        }
        Ok(found)
    }

    /// Process a single event without a running loop.
    pub fn do_one_event(&self, flags: Option<EventFlags>, force_dont_wait: bool) -> Result<bool> {
        if self.owner().is_some() {
            return Err(HostError::runtime("eventloop is already running"));
        }
        let mut flags = flags.unwrap_or(EventFlags::ALL | EventFlags::DONT_WAIT);
        if force_dont_wait || safety::level() >= safety::PRIVILEGED_LEVEL {
            flags |= EventFlags::DONT_WAIT;
        }
        let found = self.run_iteration(flags)?;
        self.check_pending()?;
        Ok(found)
    }

    /// Enter the loop and run it until `opts` says to stop.
    pub fn run_until(&self, opts: RunOptions<'_>) -> Result<bool> {
        let token = self.enter();
        self.run_loop(&token, &opts)
    }

    /// The scheduling loop proper, for a thread that already entered.
    pub fn run_loop(&self, token: &OwnershipToken, opts: &RunOptions<'_>) -> Result<bool> {
        let me = token.thread.clone();
        let depth = self.depth();
        let mut found = true;

        self.restart_tick_timer();

        loop {
            if self.owner().is_none() {
                return Ok(true);
            }

            if self.is_alone(&me) {
                self.shared.wait_event.store(false, Ordering::SeqCst);
                let flags = match opts.update {
                    Some(update) => update | EventFlags::DONT_WAIT,
                    None => {
                        self.ensure_fallback_timer();
                        EventFlags::ALL
                    }
                };

                if let Some(result) = self.wait_satisfied(opts, found) {
                    return Ok(result);
                }

                let did = self.run_iteration(flags)?;
                found = did || !flags.contains(EventFlags::DONT_WAIT);

                if opts.stop.is_some() && self.has_pending() {
                    return Ok(false);
                }
                if self.check_pending()? {
                    return Ok(false);
                }
                if opts.update.is_some() {
                    if did {
                        continue;
                    }
                    return Ok(false);
                }
                if let Some(result) = self.trap_check(opts)? {
                    return Ok(result);
                }
                if opts.check_root && self.root_count() == 0 {
                    self.shared.run_timer_flag.store(false, Ordering::SeqCst);
                    return Ok(true);
                }
                self.bump_counter();
            } else {
                self.shared.wait_event.store(true, Ordering::SeqCst);
                let flags = match opts.update {
                    Some(update) => update | EventFlags::DONT_WAIT,
                    None => EventFlags::ALL | EventFlags::DONT_WAIT,
                };
                self.use_requested_tick();
                let tunables = self.tunables();
                found = true;

                let mut ticks = 0u32;
                while ticks < tunables.loop_max {
                    if let Some(result) = self.wait_satisfied(opts, found) {
                        return Ok(result);
                    }

                    match self.owner() {
                        None => return Ok(true),
                        Some(owner) if owner == me => {
                            let did = self.run_iteration(flags)?;
                            if depth != self.depth() {
                                log::trace!("event loop: depth changed, leaving");
                                return Ok(false);
                            }
                            if let Some(result) = self.trap_check(opts)? {
                                return Ok(result);
                            }
                            if opts.stop.is_some() && self.has_pending() {
                                return Ok(false);
                            }
                            if self.check_pending()? {
                                return Ok(false);
                            }
                            if did {
                                ticks += 1;
                            } else {
                                if opts.update.is_some() {
                                    return Ok(false);
                                }
                                ticks = ticks.saturating_add(tunables.no_event_tick);
                                let wait = tunables
                                    .max_block_time
                                    .map_or(tunables.no_event_wait, |cap| cap.min(tunables.no_event_wait));
                                self.shared
                                    .gate
                                    .unlocked(|| self.shared.events.wait_for_event(flags, Some(wait)));
                            }
                        }
                        Some(_) => {
                            // Someone else owns the loop; wait until it is handed back.
                            self.shared
                                .gate
                                .unlocked(|| me.park_timeout(tunables.no_thread_interrupt_time));
                        }
                    }

                    if self.watchdog_active() && !self.is_owner(&me) {
                        return Ok(true);
                    }
                    if let Some(result) = self.trap_check(opts)? {
                        return Ok(result);
                    }
                    if opts.check_root && self.root_count() == 0 {
                        self.shared.run_timer_flag.store(false, Ordering::SeqCst);
                        return Ok(true);
                    }
                    self.bump_counter();
                    if self.shared.run_timer_flag.swap(false, Ordering::SeqCst) {
                        break;
                    }
                }
            }

            if opts.update.is_none() {
                self.shared.gate.unlocked(thread::yield_now);
            }
        }
    }

    /// Stop-predicate check shared by both regimes.
    fn wait_satisfied(&self, opts: &RunOptions<'_>, found: bool) -> Option<bool> {
        let stop = opts.stop?;
        if stop() || !found {
            return Some(found);
        }
        if opts.related.is_some_and(Environment::is_deleted) {
            return Some(false);
        }
        None
    }

    /// Interrupt delivery. Nested loops and waits leave it for the outer loop.
    fn trap_check(&self, opts: &RunOptions<'_>) -> Result<Option<bool>> {
        if !self.interrupt_pending() {
            return Ok(None);
        }
        self.shared.run_timer_flag.store(false, Ordering::SeqCst);
        if opts.stop.is_some() || self.depth() > 0 {
            return Ok(Some(false));
        }
        self.take_interrupt();
        log::debug!("event loop: interrupted");
        Err(HostError::Interrupt)
    }

    fn bump_counter(&self) {
        self.shared.loop_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn watchdog_active(&self) -> bool {
        self.shared.watchdog.lock().is_some()
    }

    fn schedule_tick(&self, period: Duration) -> TimerToken {
        let shared = Arc::downgrade(&self.shared);
        self.shared.events.schedule_timer(
            period,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    SchedulerContext { shared }.on_tick();
                }
            }),
        )
    }

    fn on_tick(&self) {
        self.shared.run_timer_flag.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        state.tick_timer = None;
        if state.timer_tick > Duration::ZERO && state.owner.is_some() {
            let period = state.timer_tick;
            state.tick_timer = Some(self.schedule_tick(period));
        }
    }

    fn cancel_tick_timer(&self, state: &mut SchedulerState) {
        if let Some(token) = state.tick_timer.take() {
            self.shared.events.cancel_timer(token);
        }
        state.timer_tick = self.shared.tunables.read().timer_tick;
    }

    fn restart_tick_timer(&self) {
        let mut state = self.shared.state.lock();
        if let Some(token) = state.tick_timer.take() {
            self.shared.events.cancel_timer(token);
        }
        self.shared.run_timer_flag.store(false, Ordering::SeqCst);
        if state.timer_tick > Duration::ZERO {
            let period = state.timer_tick;
            state.tick_timer = Some(self.schedule_tick(period));
        }
    }

    /// Solo regime: make sure some timer gives the loop control points.
    fn ensure_fallback_timer(&self) {
        let mut state = self.shared.state.lock();
        if state.timer_tick == Duration::ZERO {
            state.timer_tick = self.shared.tunables.read().no_thread_interrupt_time;
            if state.tick_timer.is_none() {
                let period = state.timer_tick;
                state.tick_timer = Some(self.schedule_tick(period));
            }
        }
    }

    /// Shared regime: go back to the period the host asked for.
    fn use_requested_tick(&self) {
        let requested = self.shared.tunables.read().timer_tick;
        let mut state = self.shared.state.lock();
        state.timer_tick = requested;
        if requested > Duration::ZERO && state.tick_timer.is_none() {
            state.tick_timer = Some(self.schedule_tick(requested));
        }
    }

    pub fn tunables(&self) -> Tunables {
        *self.shared.tunables.read()
    }

    /// Tunables may only be changed by the loop owner or while no loop runs.
    fn may_tune(&self) -> bool {
        match self.owner() {
            None => true,
            Some(owner) => owner.is_current(),
        }
    }

    /// Set the tick timer period in milliseconds (0 disables it).
    /// Returns the period in effect afterwards.
    pub fn set_event_loop_tick(&self, millis: i64) -> Result<u64> {
        safety::require_privileged("event loop tunables")?;
        let Ok(millis) = u64::try_from(millis) else {
            return Err(HostError::Argument(
                "timer-tick parameter must be 0 or positive number".to_string(),
            ));
        };
        if !self.may_tune() {
            return Ok(self.event_loop_tick());
        }
        let period = Duration::from_millis(millis);
        self.shared.tunables.write().timer_tick = period;
        let mut state = self.shared.state.lock();
        state.timer_tick = period;
        if period > Duration::ZERO && state.tick_timer.is_none() && state.owner.is_some() {
            state.tick_timer = Some(self.schedule_tick(period));
        }
        Ok(millis)
    }

    pub fn event_loop_tick(&self) -> u64 {
        self.tunables().timer_tick.as_millis() as u64
    }

    /// Set `loop_max` and `no_event_tick`. Returns the pair in effect afterwards.
    pub fn set_event_loop_weight(&self, loop_max: i64, no_event_tick: i64) -> Result<(u32, u32)> {
        safety::require_privileged("event loop tunables")?;
        let (Ok(loop_max), Ok(no_event_tick)) = (u32::try_from(loop_max), u32::try_from(no_event_tick)) else {
            return Err(HostError::Argument(
                "weight parameters must be positive numbers".to_string(),
            ));
        };
        if loop_max == 0 || no_event_tick == 0 {
            return Err(HostError::Argument(
                "weight parameters must be positive numbers".to_string(),
            ));
        }
        if !self.may_tune() {
            return Ok(self.event_loop_weight());
        }
        let mut tunables = self.shared.tunables.write();
        tunables.loop_max = loop_max;
        tunables.no_event_tick = no_event_tick;
        Ok((loop_max, no_event_tick))
    }

    pub fn event_loop_weight(&self) -> (u32, u32) {
        let tunables = self.tunables();
        (tunables.loop_max, tunables.no_event_tick)
    }

    /// Set the shared-regime sleep after an empty poll, in milliseconds.
    pub fn set_no_event_wait(&self, millis: i64) -> Result<u64> {
        safety::require_privileged("event loop tunables")?;
        let millis = match u64::try_from(millis) {
            Ok(m) if m > 0 => m,
            _ => {
                return Err(HostError::Argument(
                    "no_event_wait parameter must be positive number".to_string(),
                ))
            }
        };
        if !self.may_tune() {
            return Ok(self.no_event_wait());
        }
        self.shared.tunables.write().no_event_wait = Duration::from_millis(millis);
        Ok(millis)
    }

    pub fn no_event_wait(&self) -> u64 {
        self.tunables().no_event_wait.as_millis() as u64
    }

    /// Cap every blocking wait for events at `millis`; zero removes the cap.
    pub fn set_max_block_time(&self, millis: i64) -> Result<u64> {
        let millis = u64::try_from(millis).map_err(|_| {
            HostError::Argument(format!("invalid value for time: '{millis}'"))
        })?;
        self.shared.tunables.write().max_block_time =
            (millis > 0).then(|| Duration::from_millis(millis));
        self.shared.events.wake();
        Ok(millis)
    }

    /// Current cap in milliseconds, zero if blocking waits are unbounded.
    pub fn max_block_time(&self) -> u64 {
        self.tunables()
            .max_block_time
            .map_or(0, |cap| cap.as_millis() as u64)
    }

    pub fn abort_policy(&self) -> AbortPolicy {
        *self.shared.abort_policy.read()
    }

    pub fn set_abort_policy(&self, policy: AbortPolicy) -> AbortPolicy {
        *self.shared.abort_policy.write() = policy;
        policy
    }
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SchedulerContext")
            .field("owner", &state.owner.as_ref().map(HostThread::id))
            .field("stack", &state.stack.len())
            .field("depth", &state.depth)
            .field("pending", &state.pending.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::QueuePosition;
    use std::time::Instant;

    #[test]
    fn test_enter_exit_restores_none() {
        let ctx = SchedulerContext::new();
        assert_eq!(ctx.is_loop_thread(), None);
        let token = ctx.enter();
        assert_eq!(ctx.is_loop_thread(), Some(true));
        assert_eq!(ctx.depth(), 0);
        drop(token);
        assert!(ctx.owner().is_none());
    }

    #[test]
    fn test_recursive_enter_tracks_depth() {
        let ctx = SchedulerContext::new();
        let outer = ctx.enter();
        let inner = ctx.enter();
        assert_eq!(ctx.depth(), 1);
        drop(inner);
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.is_loop_thread(), Some(true));
        drop(outer);
        assert_eq!(ctx.is_loop_thread(), None);
    }

    #[test]
    fn test_exit_skips_finished_owners() {
        let ctx = SchedulerContext::new();
        let (tx, rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        // A enters, then B takes over; A leaves while B still owns the loop.
        let a = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let token = ctx.enter();
                tx.send(()).unwrap();
                done_rx.recv().unwrap();
                drop(token);
            })
        };
        rx.recv().unwrap();
        let b = ctx.enter();
        done_tx.send(()).unwrap();
        a.join().unwrap();
        assert_eq!(ctx.is_loop_thread(), Some(true));

        // A is no longer looping, so nobody gets ownership back.
        drop(b);
        assert!(ctx.owner().is_none());
    }

    #[test]
    fn test_exit_hands_back_to_looping_parent() {
        let ctx = SchedulerContext::new();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let (back_tx, back_rx) = crossbeam_channel::bounded(1);

        let parent = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let token = ctx.enter();
                entered_tx.send(()).unwrap();
                let me = token.thread().clone();
                let deadline = Instant::now() + Duration::from_secs(5);
                while ctx.is_owner(&me) && Instant::now() < deadline {
                    me.park_timeout(Duration::from_millis(5));
                }
                while !ctx.is_owner(&me) && Instant::now() < deadline {
                    me.park_timeout(Duration::from_millis(10));
                }
                back_tx.send(ctx.is_owner(&me)).unwrap();
            })
        };
        entered_rx.recv().unwrap();
        let child = ctx.enter();
        // Give the parent time to notice it lost ownership.
        thread::sleep(Duration::from_millis(20));
        drop(child);
        assert!(back_rx.recv().unwrap());
        parent.join().unwrap();
    }

    #[test]
    fn test_stop_clears_owner() {
        let ctx = SchedulerContext::new();
        let _token = ctx.enter();
        ctx.stop();
        assert!(ctx.owner().is_none());
        assert!(ctx.run_loop(&_token, &RunOptions::mainloop(false)).unwrap());
    }

    #[test]
    fn test_update_flushes_queue() {
        let ctx = SchedulerContext::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = count.clone();
            ctx.events().queue_event(
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
                QueuePosition::Tail,
            );
        }
        let found = ctx.run_until(RunOptions::update(EventFlags::ALL)).unwrap();
        assert!(!found);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(ctx.owner().is_none());
    }

    #[test]
    fn test_stop_predicate_satisfied_by_timer() {
        let ctx = SchedulerContext::new();
        let flag = Arc::new(AtomicBool::new(false));
        {
            let flag = flag.clone();
            ctx.events().schedule_timer(
                Duration::from_millis(20),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            );
        }
        let stop = || flag.load(Ordering::SeqCst);
        assert!(ctx.run_until(RunOptions::wait_for(&stop, None)).unwrap());
    }

    #[test]
    fn test_mainloop_ends_when_roots_gone() {
        let ctx = SchedulerContext::new();
        let root = ctx.register_root();
        ctx.events().schedule_timer(Duration::from_millis(20), Box::new(move || drop(root)));
        assert!(ctx.run_until(RunOptions::mainloop(true)).unwrap());
        assert_eq!(ctx.root_count(), 0);
    }

    #[test]
    fn test_interrupt_raised_at_top_level() {
        let ctx = SchedulerContext::new();
        let _root = ctx.register_root();
        let other = ctx.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.interrupt();
        });
        let err = ctx.run_until(RunOptions::mainloop(true)).unwrap_err();
        assert!(matches!(err, HostError::Interrupt));
        assert!(!ctx.interrupt_pending());
        handle.join().unwrap();
    }

    #[test]
    fn test_interrupt_left_pending_for_waits() {
        let ctx = SchedulerContext::new();
        ctx.interrupt();
        let never = || false;
        assert!(!ctx.run_until(RunOptions::wait_for(&never, None)).unwrap());
        assert!(ctx.interrupt_pending());
    }

    #[test]
    fn test_shared_regime_gives_up_turn_on_tick() {
        let ctx = SchedulerContext::new();
        ctx.set_event_loop_tick(5).unwrap();
        let _other = {
            // Registering from another thread switches to the shared regime.
            let ctx = ctx.clone();
            let (tx, rx) = crossbeam_channel::bounded(0);
            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
            let handle = thread::spawn(move || {
                let _reg = ctx.register_thread();
                tx.send(()).unwrap();
                let _ = stop_rx.recv();
            });
            rx.recv().unwrap();
            (handle, stop_tx)
        };
        let start = ctx.loop_counter();
        let until = Instant::now() + Duration::from_millis(60);
        let stop = || Instant::now() > until;
        assert!(ctx.run_until(RunOptions::wait_for(&stop, None)).unwrap());
        assert!(ctx.is_waiting_for_events());
        assert!(ctx.loop_counter() > start);
    }

    #[test]
    fn test_do_one_event_refuses_while_loop_runs() {
        let ctx = SchedulerContext::new();
        let _token = ctx.enter();
        let err = ctx.do_one_event(None, false).unwrap_err();
        assert_eq!(err.to_string(), "eventloop is already running");
    }

    #[test]
    fn test_do_one_event_without_loop() {
        let ctx = SchedulerContext::new();
        assert!(!ctx.do_one_event(None, false).unwrap());
        ctx.events().queue_event(Box::new(|| {}), QueuePosition::Tail);
        assert!(ctx.do_one_event(None, false).unwrap());
    }

    #[test]
    fn test_tunable_validation() {
        let ctx = SchedulerContext::new();
        assert!(matches!(ctx.set_event_loop_tick(-1), Err(HostError::Argument(_))));
        assert!(matches!(ctx.set_event_loop_weight(0, 10), Err(HostError::Argument(_))));
        assert!(matches!(ctx.set_event_loop_weight(10, -1), Err(HostError::Argument(_))));
        assert!(matches!(ctx.set_no_event_wait(0), Err(HostError::Argument(_))));

        assert_eq!(ctx.set_event_loop_weight(100, 2).unwrap(), (100, 2));
        assert_eq!(ctx.event_loop_weight(), (100, 2));
        assert_eq!(ctx.set_no_event_wait(5).unwrap(), 5);
        assert_eq!(ctx.set_event_loop_tick(0).unwrap(), 0);
    }

    #[test]
    fn test_tunables_refused_for_non_owner() {
        let ctx = SchedulerContext::new();
        let (tx, rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let owner = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let _token = ctx.enter();
                tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        rx.recv().unwrap();
        assert_eq!(ctx.set_event_loop_weight(1, 1).unwrap(), (DEFAULT_EVENT_LOOP_MAX, DEFAULT_NO_EVENT_TICK));
        assert_eq!(ctx.set_no_event_wait(1).unwrap(), 20);
        done_tx.send(()).unwrap();
        owner.join().unwrap();
    }

    #[test]
    fn test_tunables_refused_when_unprivileged() {
        let ctx = SchedulerContext::new();
        let err = safety::with_level(safety::PRIVILEGED_LEVEL, || ctx.set_event_loop_tick(10))
            .unwrap_err();
        assert!(matches!(err, HostError::Security(_)));
        assert_eq!(ctx.event_loop_tick(), 0);
    }

    #[test]
    fn test_abort_policy_tristate() {
        let ctx = SchedulerContext::new();
        assert_eq!(ctx.abort_policy(), AbortPolicy::Raise);
        for value in [Some(true), Some(false), None] {
            let policy = ctx.set_abort_policy(AbortPolicy::from_tristate(value));
            assert_eq!(policy.as_tristate(), value);
        }
    }

    #[test]
    fn test_max_block_time_caps_blocking_poll() {
        let ctx = SchedulerContext::new();
        assert_eq!(ctx.max_block_time(), 0);
        assert!(matches!(ctx.set_max_block_time(-1), Err(HostError::Argument(_))));
        assert_eq!(ctx.set_max_block_time(20).unwrap(), 20);
        // The first poll only consumes the wake-up from the setter.
        ctx.run_iteration(EventFlags::ALL).unwrap();

        let start = Instant::now();
        assert!(!ctx.run_iteration(EventFlags::ALL).unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));

        assert_eq!(ctx.set_max_block_time(0).unwrap(), 0);
        assert_eq!(ctx.tunables().max_block_time, None);
    }

    #[test]
    fn test_only_owner_services_under_contention() {
        use crate::script::ScriptInterp;

        let ctx = SchedulerContext::new();
        let env = Environment::new(Arc::new(ScriptInterp::new()), None, false);
        let stop = Arc::new(AtomicBool::new(false));
        let loopers: Vec<_> = (0..2)
            .map(|_| {
                let ctx = ctx.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let until = || stop.load(Ordering::SeqCst);
                    ctx.run_until(RunOptions::wait_for(&until, None))
                })
            })
            .collect();
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.shared.state.lock().stack.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ctx.shared.state.lock().stack.len(), 2);

        let busy = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        let serviced = Arc::new(AtomicUsize::new(0));
        let callers: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                let env = env.clone();
                let busy = busy.clone();
                let violations = violations.clone();
                let serviced = serviced.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let owner_ctx = ctx.clone();
                        let busy = busy.clone();
                        let violations = violations.clone();
                        let serviced = serviced.clone();
                        ctx.submit(&env, QueuePosition::Tail, move || {
                            if busy.swap(true, Ordering::SeqCst) {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            let me = thread::current().id();
                            if owner_ctx.owner().map(|owner| owner.id()) != Some(me) {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            busy.store(false, Ordering::SeqCst);
                            serviced.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(serviced.load(Ordering::SeqCst), 100);
        assert_eq!(violations.load(Ordering::SeqCst), 0);

        stop.store(true, Ordering::SeqCst);
        ctx.events().wake();
        for looper in loopers {
            looper.join().unwrap().unwrap();
        }
        assert!(ctx.owner().is_none());
    }
}
