//! Embedded event source: queued events, timers and idle callbacks.
//!
//! [`Notifier`] is the event queue polled by the loop owner. Callbacks always
//! run with the queue lock released, so they may queue more events, schedule
//! timers or re-enter the scheduler.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

bitflags! {
    /// Event mask passed to a poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        const WINDOW = 1 << 0;
        const FILE = 1 << 1;
        const TIMER = 1 << 2;
        const IDLE = 1 << 3;
        const ALL = Self::WINDOW.bits() | Self::FILE.bits() | Self::TIMER.bits() | Self::IDLE.bits();
        const DONT_WAIT = 1 << 4;
    }
}

impl EventFlags {
    fn wants_queue(self) -> bool {
        self.intersects(EventFlags::WINDOW | EventFlags::FILE)
    }
}

/// Where a queued event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePosition {
    #[default]
    Tail,
    Head,
}

/// A unit of work run by the loop owner.
pub type Event = Box<dyn FnOnce() + Send>;

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken {
    deadline: Instant,
    id: u64,
}

impl TimerToken {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Event source polled by the scheduler.
pub trait EventSource: Send + Sync {
    fn schedule_timer(&self, after: Duration, callback: Event) -> TimerToken;

    /// Returns false if the timer already fired or was cancelled.
    fn cancel_timer(&self, token: TimerToken) -> bool;

    fn queue_event(&self, event: Event, position: QueuePosition);

    fn when_idle(&self, callback: Event);

    /// Run at most one ready event matching `flags`.
    ///
    /// Without `DONT_WAIT` this blocks until an event ran.
    fn poll_one_event(&self, flags: EventFlags) -> bool;

    /// Block until an event matching `flags` is ready, [`EventSource::wake`]
    /// was called, or `timeout` elapsed. Runs nothing.
    fn wait_for_event(&self, flags: EventFlags, timeout: Option<Duration>) -> bool;

    /// Interrupt a pending [`EventSource::wait_for_event`].
    fn wake(&self);

    fn pending(&self) -> usize;
}

#[derive(Default)]
struct Queues {
    events: VecDeque<Event>,
    timers: BTreeMap<TimerToken, Event>,
    idle: VecDeque<Event>,
    next_id: u64,
    woken: bool,
}

impl Queues {
    fn take_ready(&mut self, flags: EventFlags, now: Instant) -> Option<Event> {
        if flags.wants_queue() {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
        }
        if flags.contains(EventFlags::TIMER) {
            let due = self
                .timers
                .first_key_value()
                .map(|(token, _)| token.deadline <= now)
                .unwrap_or(false);
            if due {
                return self.timers.pop_first().map(|(_, cb)| cb);
            }
        }
        if flags.contains(EventFlags::IDLE) {
            return self.idle.pop_front();
        }
        None
    }

    fn is_ready(&self, flags: EventFlags, now: Instant) -> bool {
        (flags.wants_queue() && !self.events.is_empty())
            || (flags.contains(EventFlags::TIMER)
                && self
                    .timers
                    .first_key_value()
                    .is_some_and(|(token, _)| token.deadline <= now))
            || (flags.contains(EventFlags::IDLE) && !self.idle.is_empty())
    }

    fn next_deadline(&self, flags: EventFlags) -> Option<Instant> {
        if flags.contains(EventFlags::TIMER) {
            self.timers.first_key_value().map(|(token, _)| token.deadline)
        } else {
            None
        }
    }
}

/// In-process event source.
#[derive(Default)]
pub struct Notifier {
    queues: Mutex<Queues>,
    ready: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait under the lock until something is ready, returns whether it is.
    fn wait_ready(&self, flags: EventFlags, timeout: Option<Duration>) -> bool {
        let limit = timeout.map(|t| Instant::now() + t);
        let mut queues = self.queues.lock();
        loop {
            let now = Instant::now();
            if queues.is_ready(flags, now) {
                return true;
            }
            if queues.woken {
                queues.woken = false;
                return false;
            }
            let wake_at = match (queues.next_deadline(flags), limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake_at {
                Some(at) if at <= now => return queues.is_ready(flags, now),
                Some(at) => {
                    self.ready.wait_until(&mut queues, at);
                }
                None => self.ready.wait(&mut queues),
            }
        }
    }
}

impl EventSource for Notifier {
    fn schedule_timer(&self, after: Duration, callback: Event) -> TimerToken {
        let mut queues = self.queues.lock();
        queues.next_id += 1;
        let token = TimerToken {
            deadline: Instant::now() + after,
            id: queues.next_id,
        };
        queues.timers.insert(token, callback);
        drop(queues);
        self.ready.notify_all();
        token
    }

    fn cancel_timer(&self, token: TimerToken) -> bool {
        self.queues.lock().timers.remove(&token).is_some()
    }

    fn queue_event(&self, event: Event, position: QueuePosition) {
        let mut queues = self.queues.lock();
        match position {
            QueuePosition::Tail => queues.events.push_back(event),
            QueuePosition::Head => queues.events.push_front(event),
        }
        drop(queues);
        self.ready.notify_all();
    }

    fn when_idle(&self, callback: Event) {
        self.queues.lock().idle.push_back(callback);
        self.ready.notify_all();
    }

    fn poll_one_event(&self, flags: EventFlags) -> bool {
        loop {
            let event = self.queues.lock().take_ready(flags, Instant::now());
            if let Some(event) = event {
                event();
                return true;
            }
            if flags.contains(EventFlags::DONT_WAIT) {
                return false;
            }
            self.wait_ready(flags, None);
        }
    }

    fn wait_for_event(&self, flags: EventFlags, timeout: Option<Duration>) -> bool {
        self.wait_ready(flags, timeout)
    }

    fn wake(&self) {
        self.queues.lock().woken = true;
        self.ready.notify_all();
    }

    fn pending(&self) -> usize {
        let queues = self.queues.lock();
        queues.events.len() + queues.timers.len() + queues.idle.len()
    }
}
