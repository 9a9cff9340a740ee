//! Host-facing handle on one embedded environment.
//!
//! [`InterpHandle`] is what embedding code holds. Every operation on it can
//! be called from any host thread: calls from the loop owner (or while no
//! loop runs) execute in place, everything else is dispatched to the owner
//! and the caller parks until it is done.
//!
//! Environments created here get scheduler-aware `vwait`, `update`, `after`
//! and `exit` commands, so scripts that wait never block the loop for
//! other threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::dispatch::Waiting;
use crate::environment::Environment;
use crate::error::{HostError, JumpKind, Result};
use crate::interp::{EmbeddedError, Interpreter, NativeCommand, ReturnCode, VarFlags};
use crate::notifier::{EventFlags, QueuePosition, TimerToken};
use crate::safety;
use crate::scheduler::{AbortPolicy, RunOptions, SchedulerContext};
use crate::script::{concat, ScriptInterp};
use crate::signal::{protect, to_embedded, to_host, ControlSignal};
use crate::thread::HostThread;
use crate::watchdog::Watchdog;

const VAR_FLAGS: VarFlags = VarFlags::GLOBAL_ONLY.union(VarFlags::LEAVE_ERR_MSG);

/// Scripts scheduled with `after`, by id. `None` while the timer is being set
/// up and for idle callbacks.
#[derive(Default)]
struct AfterTable {
    next_id: u64,
    pending: HashMap<String, Option<TimerToken>>,
}

/// Handle to one environment and the scheduler it runs on.
#[derive(Clone)]
pub struct InterpHandle {
    env: Arc<Environment>,
    ctx: SchedulerContext,
    after: Arc<Mutex<AfterTable>>,
    safe: bool,
}

/// What installed commands hold, so the interpreter does not keep its own
/// environment alive.
#[derive(Clone)]
struct WeakHandle {
    env: Weak<Environment>,
    ctx: SchedulerContext,
    after: Arc<Mutex<AfterTable>>,
    safe: bool,
}

impl WeakHandle {
    fn upgrade(&self) -> Option<InterpHandle> {
        Some(InterpHandle {
            env: self.env.upgrade()?,
            ctx: self.ctx.clone(),
            after: self.after.clone(),
            safe: self.safe,
        })
    }
}

impl InterpHandle {
    /// A root environment backed by the bundled [`ScriptInterp`].
    pub fn new(ctx: &SchedulerContext) -> Self {
        Self::with_interpreter(ctx, Arc::new(ScriptInterp::new()))
    }

    /// A root environment backed by `interp`.
    pub fn with_interpreter(ctx: &SchedulerContext, interp: Arc<dyn Interpreter>) -> Self {
        let env = Environment::new(interp, Some(ctx.register_root()), false);
        Self::assemble(env, ctx.clone(), false)
    }

    /// A restricted sub-environment on the same scheduler.
    ///
    /// Children never count as roots and cannot drive or tune the loop. A
    /// `safe` child also runs all its embedded code at the privileged safe
    /// level.
    pub fn create_child(&self, interp: Arc<dyn Interpreter>, safe: bool) -> Result<Self> {
        if self.env.is_deleted() {
            return Err(HostError::runtime("parent environment has been deleted"));
        }
        let env = Environment::new(interp, None, true);
        log::debug!("created child environment (safe: {safe})");
        Ok(Self::assemble(env, self.ctx.clone(), safe))
    }

    fn assemble(env: Arc<Environment>, ctx: SchedulerContext, safe: bool) -> Self {
        let handle = Self {
            env,
            ctx,
            after: Arc::new(Mutex::new(AfterTable::default())),
            safe,
        };
        handle.install_commands();
        handle
    }

    fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            env: Arc::downgrade(&self.env),
            ctx: self.ctx.clone(),
            after: self.after.clone(),
            safe: self.safe,
        }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    fn at_own_level<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.safe && safety::level() < safety::PRIVILEGED_LEVEL {
            safety::with_level(safety::PRIVILEGED_LEVEL, f)
        } else {
            f()
        }
    }

    // Evaluation

    /// Evaluate `script` and return its result.
    pub fn eval(&self, script: &str) -> Result<String> {
        if self.env.is_deleted() {
            log::debug!("eval on deleted environment ignored");
            return Ok(String::new());
        }
        let this = self.clone();
        let script = script.to_string();
        self.ctx
            .submit(&self.env, QueuePosition::Tail, move || this.eval_real(&script))
    }

    fn eval_real(&self, script: &str) -> Result<String> {
        if self.env.is_deleted() {
            return Ok(String::new());
        }
        let result = self.at_own_level(|| self.env.interp().evaluate(script));
        self.finish(result)
    }

    /// Record the return code, surface pending exceptions and map the result.
    fn finish(&self, result: std::result::Result<String, EmbeddedError>) -> Result<String> {
        let code = result.as_ref().map_or_else(|e| e.code, |_| ReturnCode::Ok);
        self.env.record_return_code(code);
        if self.ctx.check_pending()? {
            return Ok(String::new());
        }
        match result {
            Ok(value) => Ok(value),
            Err(e) => match e.code {
                ReturnCode::Ok | ReturnCode::Return => Ok(e.message),
                ReturnCode::Error => self.ctx.apply_abort_policy(to_host(e)),
                ReturnCode::Break | ReturnCode::Continue => Err(to_host(e)),
            },
        }
    }

    /// Invoke command `name` directly, without script parsing.
    pub fn invoke<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Result<String> {
        self.invoke_at(QueuePosition::Tail, name, args)
    }

    /// Like [`InterpHandle::invoke`] but queued ahead of all other work.
    pub fn invoke_immediate<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Result<String> {
        safety::require_privileged("invoke_immediate")?;
        self.invoke_at(QueuePosition::Head, name, args)
    }

    fn invoke_at<S: AsRef<str>>(&self, position: QueuePosition, name: &str, args: &[S]) -> Result<String> {
        if self.env.is_deleted() {
            return Ok(String::new());
        }
        let this = self.clone();
        let name = name.to_string();
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.ctx
            .submit(&self.env, position, move || this.invoke_real(&name, &args))
    }

    fn invoke_real(&self, name: &str, args: &[String]) -> Result<String> {
        if self.env.is_deleted() {
            return Ok(String::new());
        }
        let interp = self.env.interp();
        let result = if interp.has_command(name) {
            self.at_own_level(|| interp.invoke_command(name, args))
        } else if interp.has_command("unknown") {
            let mut forwarded = Vec::with_capacity(args.len() + 1);
            forwarded.push(name.to_string());
            forwarded.extend(args.iter().cloned());
            self.at_own_level(|| interp.invoke_command("unknown", &forwarded))
        } else {
            return self
                .ctx
                .apply_abort_policy(HostError::Name(format!("invalid command name `{name}'")));
        };
        self.finish(result)
    }

    // Variables

    pub fn get_var(&self, name: &str) -> Result<String> {
        self.get_var_at(name, None)
    }

    pub fn get_var_element(&self, name: &str, index: &str) -> Result<String> {
        self.get_var_at(name, Some(index))
    }

    fn get_var_at(&self, name: &str, index: Option<&str>) -> Result<String> {
        if self.env.is_deleted() {
            return Ok(String::new());
        }
        let env = self.env.clone();
        let name = name.to_string();
        let index = index.map(str::to_string);
        self.ctx.submit(&self.env, QueuePosition::Tail, move || {
            env.interp()
                .get_variable(&name, index.as_deref(), VAR_FLAGS)
                .map_err(to_host)
        })
    }

    pub fn set_var(&self, name: &str, value: &str) -> Result<String> {
        self.set_var_at(name, None, value)
    }

    pub fn set_var_element(&self, name: &str, index: &str, value: &str) -> Result<String> {
        self.set_var_at(name, Some(index), value)
    }

    fn set_var_at(&self, name: &str, index: Option<&str>, value: &str) -> Result<String> {
        if self.env.is_deleted() {
            return Ok(String::new());
        }
        let env = self.env.clone();
        let name = name.to_string();
        let index = index.map(str::to_string);
        let value = value.to_string();
        self.ctx.submit(&self.env, QueuePosition::Tail, move || {
            env.interp()
                .set_variable(&name, index.as_deref(), &value, VAR_FLAGS)
                .map_err(to_host)
        })
    }

    pub fn unset_var(&self, name: &str) -> Result<bool> {
        self.unset_var_at(name, None)
    }

    pub fn unset_var_element(&self, name: &str, index: &str) -> Result<bool> {
        self.unset_var_at(name, Some(index))
    }

    fn unset_var_at(&self, name: &str, index: Option<&str>) -> Result<bool> {
        if self.env.is_deleted() {
            return Ok(false);
        }
        let env = self.env.clone();
        let name = name.to_string();
        let index = index.map(str::to_string);
        self.ctx.submit(&self.env, QueuePosition::Tail, move || {
            Ok(env.interp().unset_variable(&name, index.as_deref(), VAR_FLAGS))
        })
    }

    // Host callbacks

    /// Install `f` as embedded command `name`.
    ///
    /// Errors returned by `f` go through the exception bridge: `Break` and
    /// `Continue` reach enclosing embedded loops, exits and interrupts are
    /// kept pending for the host.
    pub fn register_command<F>(&self, name: &str, f: F)
    where
        F: Fn(&[String]) -> Result<String> + Send + Sync + 'static,
    {
        self.install(name, move |_, argv| f(argv));
    }

    fn install<F>(&self, name: &str, f: F)
    where
        F: Fn(&InterpHandle, &[String]) -> Result<String> + Send + Sync + 'static,
    {
        let weak = self.downgrade();
        let command: NativeCommand = Arc::new(move |argv: &[String]| {
            let Some(handle) = weak.upgrade() else {
                return Err(EmbeddedError::error("environment has been deleted"));
            };
            let _guard = handle.env.preserve();
            let _frame = handle.ctx.callback_frame();
            protect(|| f(&handle, argv))
                .map_err(|err| to_embedded(&handle.ctx, handle.env.interp().as_ref(), err))
        });
        self.env.interp().register_native_command(name, command);
    }

    fn install_commands(&self) {
        self.install("vwait", |h, argv| match argv {
            [_, name] => h.thread_vwait(name).map(|_| String::new()),
            _ => Err(HostError::Argument("wrong # args: should be \"vwait name\"".to_string())),
        });
        self.install("update", |h, argv| match argv {
            [_] => h.thread_update(false).map(|_| String::new()),
            [_, opt] if opt == "idletasks" => h.thread_update(true).map(|_| String::new()),
            [_, opt] => Err(HostError::Argument(format!(
                "bad option \"{opt}\": must be idletasks"
            ))),
            _ => Err(HostError::Argument("wrong # args: should be \"update ?idletasks?\"".to_string())),
        });
        self.install("after", cmd_after);
        self.install("exit", cmd_exit);
    }

    // Waiting

    /// Wait until variable `name` is written or unset.
    ///
    /// On the loop owner (or with no loop running) this runs a nested loop.
    /// Any other thread parks until the owner has changed the variable, and
    /// takes the loop over itself if the owner goes away first.
    pub fn thread_vwait(&self, name: &str) -> Result<()> {
        if self.env.is_deleted() {
            return Ok(());
        }
        let _guard = self.env.preserve();
        let interp = self.env.interp().clone();
        let start = interp.variable_generation(name);
        let changed = || interp.variable_generation(name) != start;

        while !self.may_drive_loop() {
            if self.park_until(&changed) {
                return Ok(());
            }
        }
        let found = self
            .ctx
            .run_until(RunOptions::wait_for(&changed, Some(self.env.as_ref())))?;
        self.ctx.check_pending()?;
        if found || changed() || self.env.is_deleted() || self.ctx.has_pending() {
            return Ok(());
        }
        if self.ctx.interrupt_pending() {
            if self.ctx.depth() == 0 {
                self.ctx.take_interrupt();
                return Err(HostError::Interrupt);
            }
            return Ok(());
        }
        Err(HostError::runtime(format!(
            "can't wait for variable \"{name}\": would wait forever"
        )))
    }

    /// Let the loop process everything that is ready, or only idle callbacks.
    pub fn thread_update(&self, idletasks_only: bool) -> Result<()> {
        let flags = if idletasks_only {
            EventFlags::IDLE
        } else {
            EventFlags::ALL
        };
        if !self.may_drive_loop() {
            // Idle callbacks only run once everything before them is done.
            let done = Arc::new(AtomicBool::new(false));
            {
                let done = done.clone();
                let me = HostThread::current();
                self.ctx.events().when_idle(Box::new(move || {
                    done.store(true, Ordering::SeqCst);
                    me.unpark();
                }));
            }
            if self.park_until(&|| done.load(Ordering::SeqCst)) || !self.may_drive_loop() {
                return Ok(());
            }
        }
        self.ctx.run_until(RunOptions::update(flags))?;
        self.ctx.check_pending()?;
        Ok(())
    }

    fn may_drive_loop(&self) -> bool {
        match self.ctx.owner() {
            None => true,
            Some(owner) => owner.is_current() || !owner.is_alive(),
        }
    }

    /// Park off the gate until `done` holds or the environment is deleted.
    ///
    /// Returns `false` if the loop owner went away first.
    fn park_until(&self, done: &dyn Fn() -> bool) -> bool {
        let me = HostThread::current();
        let _registration = self.ctx.register_thread();
        let _waiting = Waiting::new(&self.ctx.shared.waiters);
        let _sleeper = self.ctx.add_sleeper(&me);
        let wait = self.ctx.tunables().no_thread_interrupt_time;
        self.ctx.suspend_while(|| loop {
            if done() || self.env.is_deleted() {
                return true;
            }
            match self.ctx.owner() {
                Some(owner) if owner.is_alive() && !owner.is_current() => me.park_timeout(wait),
                _ => return false,
            }
        })
    }

    // Timers

    /// Evaluate `script` after `ms` milliseconds. Returns an id for [`InterpHandle::after_cancel`].
    pub fn after(&self, ms: u64, script: &str) -> String {
        let id = self.reserve_after_id();
        let weak = self.downgrade();
        let fired = id.clone();
        let script = script.to_string();
        let token = self.ctx.events().schedule_timer(
            Duration::from_millis(ms),
            Box::new(move || fire_after(&weak, &fired, &script)),
        );
        if let Some(slot) = self.after.lock().pending.get_mut(&id) {
            *slot = Some(token);
        }
        id
    }

    /// Evaluate `script` once the loop is idle.
    pub fn after_idle(&self, script: &str) -> String {
        let id = self.reserve_after_id();
        let weak = self.downgrade();
        let fired = id.clone();
        let script = script.to_string();
        self.ctx
            .events()
            .when_idle(Box::new(move || fire_after(&weak, &fired, &script)));
        id
    }

    /// Cancel a script scheduled with `after`. Unknown ids are ignored.
    pub fn after_cancel(&self, id: &str) {
        let entry = self.after.lock().pending.remove(id);
        if let Some(Some(token)) = entry {
            self.ctx.events().cancel_timer(token);
        }
    }

    fn reserve_after_id(&self) -> String {
        let mut table = self.after.lock();
        table.next_id += 1;
        let id = format!("after#{}", table.next_id);
        table.pending.insert(id.clone(), None);
        id
    }

    /// Report a failure from code the loop ran on its own behalf.
    fn background_error(&self, err: HostError) {
        match err.signal() {
            ControlSignal::SystemExit(_) | ControlSignal::Interrupt | ControlSignal::Fatal => {
                self.ctx.set_pending(err)
            }
            _ => log::warn!("background error: {err}"),
        }
    }

    // Loop control

    /// Run the event loop on the calling thread.
    ///
    /// With `check_root` it returns once every root environment is deleted.
    /// A no-op on deleted and restricted environments.
    pub fn mainloop(&self, check_root: bool) -> Result<bool> {
        if self.env.is_deleted() || self.env.is_restricted() {
            return Ok(false);
        }
        self.ctx.run_until(RunOptions::mainloop(check_root))
    }

    /// Run a [`Watchdog`] on the calling thread that keeps a loop thread alive.
    pub fn mainloop_with_watchdog(&self, check_root: bool) -> Result<()> {
        if self.env.is_deleted() || self.env.is_restricted() {
            return Ok(());
        }
        Watchdog::new(&self.ctx).run(check_root)
    }

    /// Process at most one event. Restricted environments never block.
    pub fn do_one_event(&self, flags: Option<EventFlags>) -> Result<bool> {
        if self.env.is_deleted() {
            return Ok(false);
        }
        self.ctx.do_one_event(flags, self.env.is_restricted())
    }

    // Tunables

    fn tunable_locked(&self) -> bool {
        self.env.is_restricted() || self.env.is_deleted()
    }

    pub fn set_event_loop_tick(&self, millis: i64) -> Result<u64> {
        if self.tunable_locked() {
            return Ok(self.ctx.event_loop_tick());
        }
        self.ctx.set_event_loop_tick(millis)
    }

    pub fn event_loop_tick(&self) -> u64 {
        self.ctx.event_loop_tick()
    }

    pub fn set_event_loop_weight(&self, loop_max: i64, no_event_tick: i64) -> Result<(u32, u32)> {
        if self.tunable_locked() {
            return Ok(self.ctx.event_loop_weight());
        }
        self.ctx.set_event_loop_weight(loop_max, no_event_tick)
    }

    pub fn event_loop_weight(&self) -> (u32, u32) {
        self.ctx.event_loop_weight()
    }

    pub fn set_no_event_wait(&self, millis: i64) -> Result<u64> {
        if self.tunable_locked() {
            return Ok(self.ctx.no_event_wait());
        }
        self.ctx.set_no_event_wait(millis)
    }

    pub fn no_event_wait(&self) -> u64 {
        self.ctx.no_event_wait()
    }

    /// Cap how long one blocking wait for events may last; zero removes the cap.
    pub fn set_max_block_time(&self, millis: i64) -> Result<u64> {
        if self.tunable_locked() {
            return Ok(self.ctx.max_block_time());
        }
        self.ctx.set_max_block_time(millis)
    }

    pub fn max_block_time(&self) -> u64 {
        self.ctx.max_block_time()
    }

    /// `Some(true)` raises, `Some(false)` warns, `None` ignores.
    pub fn abort_on_exception(&self) -> Option<bool> {
        self.ctx.abort_policy().as_tristate()
    }

    pub fn set_abort_on_exception(&self, value: Option<bool>) -> Option<bool> {
        self.ctx
            .set_abort_policy(AbortPolicy::from_tristate(value))
            .as_tristate()
    }

    // Lifetime

    /// Delete the environment.
    ///
    /// Blocks until in-flight calls finish unless called from the loop owner
    /// or from inside an embedded call, where teardown is deferred instead.
    pub fn delete(&self) -> bool {
        let may_block =
            !self.ctx.shared.gate.held_by_current() && self.ctx.is_loop_thread() != Some(true);
        let gone = self.env.delete(may_block);
        self.ctx.wake_sleepers();
        gone
    }

    /// Reset the environment to a freshly created one.
    ///
    /// Pending `after` scripts are cancelled, the interpreter state is reset
    /// (installed commands survive) and the root registration is renewed
    /// without the root count ever dropping to zero. A no-op on restricted
    /// environments; refused at privileged safe levels.
    pub fn restart(&self) -> Result<bool> {
        safety::require_privileged("restart")?;
        if self.env.is_deleted() {
            return Err(HostError::runtime("interpreter is deleted"));
        }
        if self.env.is_restricted() {
            return Ok(false);
        }
        let this = self.clone();
        self.ctx.submit(&self.env, QueuePosition::Tail, move || {
            let pending: Vec<String> = this.after.lock().pending.keys().cloned().collect();
            for id in pending {
                this.after_cancel(&id);
            }
            this.env.restart(this.ctx.register_root())?;
            log::debug!("environment restarted");
            Ok(true)
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.env.is_deleted()
    }

    /// Return code of the last embedded call.
    pub fn return_value(&self) -> i32 {
        self.env.return_code()
    }

    pub fn allow_fatal_exit(&self) -> bool {
        self.env.allow_fatal_exit()
    }

    /// Let `exit` inside scripts end the process instead of deleting the environment.
    pub fn set_allow_fatal_exit(&self, allow: bool) {
        self.env.set_allow_fatal_exit(allow);
    }
}

impl std::fmt::Debug for InterpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpHandle")
            .field("env", &self.env)
            .field("safe", &self.safe)
            .finish_non_exhaustive()
    }
}

fn fire_after(weak: &WeakHandle, id: &str, script: &str) {
    if weak.after.lock().pending.remove(id).is_none() {
        return;
    }
    let Some(handle) = weak.upgrade() else {
        return;
    };
    if handle.env.is_deleted() {
        return;
    }
    let _guard = handle.env.preserve();
    if let Err(err) = handle.eval_real(script) {
        handle.background_error(err);
    }
}

fn parse_ms(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| HostError::Argument(format!("expected integer but got \"{value}\"")))
}

fn cmd_after(h: &InterpHandle, argv: &[String]) -> Result<String> {
    let usage = || HostError::Argument("wrong # args: should be \"after option ?arg arg ...?\"".to_string());
    match argv.get(1).map(String::as_str) {
        None => Err(usage()),
        Some("cancel") => {
            if argv.len() < 3 {
                return Err(usage());
            }
            h.after_cancel(&concat(&argv[2..]));
            Ok(String::new())
        }
        Some("idle") => {
            if argv.len() < 3 {
                return Err(usage());
            }
            Ok(h.after_idle(&concat(&argv[2..])))
        }
        Some(ms) => {
            let ms = parse_ms(ms)?;
            if argv.len() == 2 {
                h.ctx.suspend_while(|| thread::sleep(Duration::from_millis(ms)));
                return Ok(String::new());
            }
            Ok(h.after(ms, &concat(&argv[2..])))
        }
    }
}

fn cmd_exit(h: &InterpHandle, argv: &[String]) -> Result<String> {
    let code = match argv {
        [_] => 0,
        [_, code] => code
            .trim()
            .parse::<i32>()
            .map_err(|_| HostError::Argument(format!("expected integer but got \"{code}\"")))?,
        _ => {
            return Err(HostError::Argument(
                "wrong # args: should be \"exit ?returnCode?\"".to_string(),
            ))
        }
    };
    if h.env.allow_fatal_exit() {
        log::info!("script requested exit {code}");
        return Err(HostError::SystemExit(code));
    }
    log::debug!("exit {code}: deleting environment");
    h.delete();
    Err(HostError::LocalJump(JumpKind::Return))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;
    use crate::scheduler::Tunables;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Runs `mainloop(true)` on its own thread and waits until it owns the loop.
    fn spawn_mainloop(h: &InterpHandle) -> thread::JoinHandle<Result<bool>> {
        let looper = {
            let h = h.clone();
            thread::spawn(move || h.mainloop(true))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.context().owner().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        looper
    }

    #[test]
    fn test_eval_and_variables() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        assert_eq!(h.eval("set x 5").unwrap(), "5");
        assert_eq!(h.get_var("x").unwrap(), "5");
        assert_eq!(h.set_var_element("arr", "k", "v").unwrap(), "v");
        assert_eq!(h.eval("set arr(k)").unwrap(), "v");
        assert_eq!(h.get_var_element("arr", "k").unwrap(), "v");
        assert!(h.unset_var("x").unwrap());
        assert!(!h.unset_var("x").unwrap());
        assert!(h.get_var("x").is_err());
        assert_eq!(h.return_value(), 0);
    }

    #[test]
    fn test_eval_error_follows_abort_policy() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let err = h.eval("error {went wrong}").unwrap_err();
        assert_eq!(err.to_string(), "went wrong");
        assert!(err.backtrace().is_some_and(|bt| bt.contains("while executing")));
        assert_eq!(h.return_value(), ReturnCode::Error.as_i32());

        assert_eq!(h.set_abort_on_exception(Some(false)), Some(false));
        assert_eq!(h.eval("error quiet").unwrap(), "");
        assert_eq!(h.set_abort_on_exception(None), None);
        assert_eq!(h.eval("error silent").unwrap(), "");
    }

    #[test]
    fn test_invoke_and_unknown_fallback() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        assert_eq!(h.invoke("list", &["a b", "c"]).unwrap(), "{a b} c");

        let err = h.invoke::<&str>("nosuch", &[]).unwrap_err();
        assert!(matches!(err, HostError::Name(_)));
        assert_eq!(err.to_string(), "invalid command name `nosuch'");

        h.register_command("unknown", |argv| Ok(format!("autoloaded {}", argv[1..].join(" "))));
        assert_eq!(h.invoke("nosuch", &["x"]).unwrap(), "autoloaded nosuch x");
    }

    #[test]
    fn test_invoke_immediate_is_privileged() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        assert_eq!(h.invoke_immediate("set", &["y", "1"]).unwrap(), "1");
        let err = safety::with_level(safety::PRIVILEGED_LEVEL, || {
            h.invoke_immediate("set", &["y", "2"])
        })
        .unwrap_err();
        assert!(matches!(err, HostError::Security(_)));
    }

    #[test]
    fn test_concurrent_writers_leave_one_value() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let looper = spawn_mainloop(&h);

        let writers: Vec<_> = ["1", "2"]
            .into_iter()
            .map(|value| {
                let h = h.clone();
                thread::spawn(move || h.eval(&format!("set x {value}")))
            })
            .collect();
        for writer in writers {
            let result = writer.join().unwrap().unwrap();
            assert!(result == "1" || result == "2");
        }
        let x = h.get_var("x").unwrap();
        assert!(x == "1" || x == "2", "unexpected value {x:?}");

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_break_from_callback_ends_embedded_loop() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        h.register_command("stop", |_| Err(HostError::LocalJump(JumpKind::Break)));
        let result = h
            .eval("set i 0; while {1} { incr i; if {$i == 3} { stop } }; set i")
            .unwrap();
        assert_eq!(result, "3");
        assert!(!ctx.has_pending());
    }

    #[test]
    fn test_break_outside_loop_reaches_host() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let err = h.eval("break").unwrap_err();
        assert!(matches!(err, HostError::LocalJump(JumpKind::Break)));
    }

    #[test]
    fn test_delete_waits_for_parked_submit() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        {
            let finished = finished.clone();
            h.register_command("slow", move |_| {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
                Ok("done".to_string())
            });
        }
        let looper = spawn_mainloop(&h);

        let caller = {
            let h = h.clone();
            thread::spawn(move || h.eval("slow"))
        };
        started_rx.recv().unwrap();
        assert!(h.env().refcount() > 0);
        assert!(h.delete());
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(h.env().refcount(), 0);

        assert_eq!(caller.join().unwrap().unwrap(), "done");
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_nested_exit_is_deferred_to_outer_frame() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        h.set_allow_fatal_exit(true);
        let inner_result = Arc::new(Mutex::new(None));
        {
            let inner = h.clone();
            let inner_result = inner_result.clone();
            h.register_command("nested", move |_| {
                let result = inner.eval("exit 7");
                *inner_result.lock() = Some(result.is_ok());
                Ok(String::new())
            });
        }
        let err = h.eval("nested; set after 1").unwrap_err();
        assert!(matches!(err, HostError::SystemExit(7)));
        // Raised once, and not inside the nested frame.
        assert_eq!(*inner_result.lock(), Some(true));
        assert_eq!(h.get_var("after").unwrap(), "1");
        assert!(!ctx.has_pending());
    }

    #[test]
    fn test_exit_without_permission_deletes_environment() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        assert_eq!(ctx.root_count(), 1);
        assert_eq!(h.eval("exit 3; set y 1").unwrap(), "");
        assert!(h.is_deleted());
        assert_eq!(ctx.root_count(), 0);
        assert_eq!(h.eval("set y 2").unwrap(), "");
    }

    #[test]
    fn test_vwait_for_other_thread() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let setter = {
            let h = h.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                h.set_var("done", "yes")
            })
        };
        h.thread_vwait("done").unwrap();
        assert_eq!(setter.join().unwrap().unwrap(), "yes");
        assert_eq!(h.get_var("done").unwrap(), "yes");
    }

    #[test]
    fn test_vwait_from_non_owner_parks() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let looper = spawn_mainloop(&h);

        let waiter = {
            let h = h.clone();
            thread::spawn(move || h.thread_vwait("flag"))
        };
        thread::sleep(Duration::from_millis(20));
        h.eval("set flag 1").unwrap();
        waiter.join().unwrap().unwrap();

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_after_vwait_and_cancel() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let id = h.eval("after 10 {set fired 1}").unwrap();
        assert!(id.starts_with("after#"));
        h.eval("vwait fired").unwrap();
        assert_eq!(h.get_var("fired").unwrap(), "1");

        let result = h
            .eval("set id [after 10 {set c 1}]; after cancel $id; after 30 {set done 1}; vwait done; info exists c")
            .unwrap();
        assert_eq!(result, "0");
    }

    #[test]
    fn test_update_runs_idle_callbacks() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        assert_eq!(h.eval("after idle {set i 1}; update idletasks; set i").unwrap(), "1");
        assert!(ctx.owner().is_none());
    }

    #[test]
    fn test_background_error_is_logged_not_raised() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        h.eval("after 0 {error oops}; after 5 {set ok 1}; vwait ok").unwrap();
        assert!(!ctx.has_pending());
    }

    #[test]
    fn test_timer_exit_ends_mainloop() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        h.set_allow_fatal_exit(true);
        h.eval("after 10 {exit 4}").unwrap();
        let err = h.mainloop(true).unwrap_err();
        assert!(matches!(err, HostError::SystemExit(4)));
    }

    #[test]
    fn test_child_environment_is_restricted() {
        let ctx = SchedulerContext::new();
        let parent = InterpHandle::new(&ctx);
        let child = parent
            .create_child(Arc::new(ScriptInterp::new()), true)
            .unwrap();
        assert_eq!(ctx.root_count(), 1);
        assert!(child.env().is_restricted());
        assert_eq!(child.eval("set a 1").unwrap(), "1");

        assert!(!child.mainloop(true).unwrap());
        assert_eq!(child.set_event_loop_tick(50).unwrap(), 0);
        assert_eq!(child.set_event_loop_weight(1, 1).unwrap(), (800, 10));
        assert_eq!(child.invoke("set", &["b", "2"]).unwrap(), "2");
        assert!(!child.do_one_event(None).unwrap());
    }

    #[test]
    fn test_callback_counts_calls_across_threads() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let calls = Arc::new(AtomicUsize::new(0));
        let owner_only = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            let owner_only = owner_only.clone();
            h.register_command("hit", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                owner_only.lock().push(thread::current().id());
                Ok(String::new())
            });
        }
        let looper = spawn_mainloop(&h);
        let owner = ctx.owner().unwrap().id();

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let h = h.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        h.eval("hit").unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert!(owner_only.lock().iter().all(|id| *id == owner));

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_vwait_in_place_lets_new_owner_poll() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let (inside_tx, inside_rx) = crossbeam_channel::bounded(0);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let waiter = {
            let h = h.clone();
            thread::spawn(move || {
                let env = h.env().clone();
                let ctx = h.context().clone();
                ctx.submit(&env, QueuePosition::Tail, move || {
                    // No loop yet, so this runs in place holding the gate.
                    inside_tx.send(()).unwrap();
                    go_rx.recv().unwrap();
                    h.thread_vwait("flag")
                })
            })
        };
        inside_rx.recv().unwrap();
        let looper = spawn_mainloop(&h);
        assert!(ctx.owner().is_some());
        go_tx.send(()).unwrap();

        let (written_tx, written_rx) = crossbeam_channel::bounded(1);
        {
            let h = h.clone();
            thread::spawn(move || {
                let _ = written_tx.send(h.set_var("flag", "1"));
            });
        }
        let written = written_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("loop owner never got the gate");
        assert_eq!(written.unwrap(), "1");
        waiter.join().unwrap().unwrap();

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_update_in_place_lets_new_owner_poll() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let (inside_tx, inside_rx) = crossbeam_channel::bounded(0);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let waiter = {
            let h = h.clone();
            thread::spawn(move || {
                let env = h.env().clone();
                let ctx = h.context().clone();
                ctx.submit(&env, QueuePosition::Tail, move || {
                    inside_tx.send(()).unwrap();
                    go_rx.recv().unwrap();
                    h.thread_update(true)
                })
            })
        };
        inside_rx.recv().unwrap();
        let looper = spawn_mainloop(&h);
        go_tx.send(()).unwrap();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(waiter.join());
        });
        let result = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("idle marker never ran");
        result.unwrap().unwrap();

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_off_loop_vwait_is_woken_by_owner() {
        // A long fallback period: only an explicit wake-up finishes in time.
        let tunables = Tunables {
            no_thread_interrupt_time: Duration::from_secs(5),
            ..Tunables::default()
        };
        let ctx = SchedulerContext::with_event_source(Arc::new(Notifier::new()), tunables);
        let h = InterpHandle::new(&ctx);
        let looper = spawn_mainloop(&h);

        let waiter = {
            let h = h.clone();
            thread::spawn(move || h.thread_vwait("flag"))
        };
        while ctx.shared.waiters.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let written = Instant::now();
        h.set_var("flag", "1").unwrap();
        waiter.join().unwrap().unwrap();
        assert!(written.elapsed() < Duration::from_secs(1));

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_restart_resets_state_and_keeps_root() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        h.eval("set x 1").unwrap();
        h.after(10_000, "set fired 1");
        assert_eq!(ctx.events().pending(), 1);

        assert!(h.restart().unwrap());
        assert_eq!(ctx.root_count(), 1);
        assert_eq!(ctx.events().pending(), 0);
        assert_eq!(h.eval("info exists x").unwrap(), "0");
        assert_eq!(h.return_value(), 0);
        // Installed commands survive.
        assert_eq!(h.eval("after 1; set y 2").unwrap(), "2");

        let child = h.create_child(Arc::new(ScriptInterp::new()), false).unwrap();
        assert!(!child.restart().unwrap());
        let err = safety::with_level(safety::PRIVILEGED_LEVEL, || h.restart()).unwrap_err();
        assert!(matches!(err, HostError::Security(_)));

        assert!(h.delete());
        assert_eq!(ctx.root_count(), 0);
        assert_eq!(h.restart().unwrap_err().to_string(), "interpreter is deleted");
    }

    #[test]
    fn test_restart_keeps_mainloop_running() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        let looper = spawn_mainloop(&h);
        assert!(h.restart().unwrap());
        assert_eq!(h.eval("set z 3").unwrap(), "3");
        assert!(!looper.is_finished());

        assert!(h.delete());
        assert!(looper.join().unwrap().unwrap());
    }

    #[test]
    fn test_max_block_time_through_handle() {
        let ctx = SchedulerContext::new();
        let h = InterpHandle::new(&ctx);
        assert_eq!(h.set_max_block_time(15).unwrap(), 15);
        assert_eq!(h.max_block_time(), 15);
        let child = h.create_child(Arc::new(ScriptInterp::new()), false).unwrap();
        assert_eq!(child.set_max_block_time(99).unwrap(), 15);
        assert!(matches!(h.set_max_block_time(-5), Err(HostError::Argument(_))));
        assert_eq!(h.set_max_block_time(0).unwrap(), 0);
    }
}
