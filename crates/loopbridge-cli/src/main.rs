//! loopbridge CLI - The `lbridge` command.
//!
//! Runs scripts in an embedded environment whose event loop is shared by
//! several host threads.
//!
//! # Architecture
//!
//! The binary is a thin driver around **loopbridge-core**: it builds a
//! `SchedulerContext` from the configuration file and flags, creates one
//! root environment, and then drives the loop on the main thread (or under
//! a watchdog) while worker threads submit scripts through the dispatcher.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use loopbridge_core::{AbortPolicy, HostError, InterpHandle, LoopConfig, SchedulerContext};
use std::fs;
use std::path::PathBuf;
use std::thread;

/// Exit status used when the loop was interrupted by Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// loopbridge - drive an embedded interpreter from many threads
#[derive(Parser, Debug)]
#[command(name = "lbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run scripts on a shared embedded event loop", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script file, then keep its event loop running
    Run(RunArgs),

    /// Evaluate scripts concurrently, one host thread each, and print the results
    Eval {
        /// Scripts to evaluate
        #[arg(value_name = "SCRIPT", required = true)]
        scripts: Vec<String>,

        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the script to execute
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Supervise the loop with a watchdog thread
    #[arg(long)]
    watchdog: bool,

    /// Keep running after the environment is deleted
    #[arg(long)]
    no_check_root: bool,

    /// Submit the script from this many host threads instead of the main thread
    #[arg(long, value_name = "N", default_value_t = 0)]
    threads: usize,

    /// Let `exit` in the script end the process
    #[arg(long)]
    allow_exit: bool,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(clap::Args, Debug, Default)]
struct TuningArgs {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Events processed per turn while other threads take part
    #[arg(long, value_name = "N")]
    loop_max: Option<u32>,

    /// Budget charged for an empty poll
    #[arg(long, value_name = "N")]
    no_event_tick: Option<u32>,

    /// Sleep after an empty poll
    #[arg(long, value_name = "MS")]
    no_event_wait: Option<u64>,

    /// Period of the turn timer (0 disables it)
    #[arg(long, value_name = "MS")]
    timer_tick: Option<u64>,

    /// Longest a single blocking wait for events may last (0 removes the cap)
    #[arg(long, value_name = "MS")]
    max_block_time: Option<u64>,

    /// What to do when an embedded call fails
    #[arg(long, value_enum, value_name = "POLICY")]
    abort_on_exception: Option<AbortArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AbortArg {
    Raise,
    Warn,
    Ignore,
}

impl From<AbortArg> for AbortPolicy {
    fn from(arg: AbortArg) -> Self {
        match arg {
            AbortArg::Raise => AbortPolicy::Raise,
            AbortArg::Warn => AbortPolicy::Warn,
            AbortArg::Ignore => AbortPolicy::Ignore,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a commented default configuration file
    Init,
    /// Print the configuration file location
    Path,
    /// Print the configuration in effect
    Show,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let code = match args.command {
        Commands::Run(run) => {
            init_logger();
            run_file(run)?
        }
        Commands::Eval { scripts, tuning } => {
            init_logger();
            eval_scripts(scripts, &tuning)?
        }
        Commands::Config { action } => {
            config_command(action)?;
            0
        }
        Commands::Version => {
            println!("lbridge {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Event-loop ownership and cross-thread dispatch");
            println!("for single-threaded embedded interpreters");
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();
}

/// Load the configuration file and apply command line overrides.
fn load_config(tuning: &TuningArgs) -> Result<LoopConfig> {
    let mut config = match &tuning.config {
        Some(path) => LoopConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => LoopConfig::load_or_default(),
    };
    if let Some(n) = tuning.loop_max {
        config.event_loop.loop_max = n;
    }
    if let Some(n) = tuning.no_event_tick {
        config.event_loop.no_event_tick = n;
    }
    if let Some(ms) = tuning.no_event_wait {
        config.event_loop.no_event_wait_ms = ms;
    }
    if let Some(ms) = tuning.timer_tick {
        config.event_loop.timer_tick_ms = ms;
    }
    if let Some(ms) = tuning.max_block_time {
        config.event_loop.max_block_time_ms = ms;
    }
    if let Some(policy) = tuning.abort_on_exception {
        config.errors.abort_on_exception = policy.into();
    }
    config.validate().context("Invalid tunables")?;
    Ok(config)
}

/// Build the scheduler and hook Ctrl-C up to its interrupt flag.
fn build_context(tuning: &TuningArgs) -> Result<SchedulerContext> {
    let config = load_config(tuning)?;
    let ctx = SchedulerContext::with_config(&config);
    signal_hook::flag::register(signal_hook::consts::SIGINT, ctx.interrupt_flag())
        .context("Failed to install Ctrl-C handler")?;
    log::debug!("tunables: {:?}", ctx.tunables());
    Ok(ctx)
}

fn run_file(args: RunArgs) -> Result<i32> {
    if !args.file.exists() {
        anyhow::bail!("File not found: {}", args.file.display());
    }
    let script = fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let ctx = build_context(&args.tuning)?;
    let handle = InterpHandle::new(&ctx);
    handle.set_allow_fatal_exit(args.allow_exit);
    log::info!("Loading: {}", args.file.display());

    let workers = if args.threads > 0 {
        log::info!("Submitting from {} host threads", args.threads);
        Some(spawn_workers(&handle, vec![script; args.threads]))
    } else {
        match handle.eval(&script) {
            Ok(_) => None,
            Err(err) => return exit_code(Err(err)),
        }
    };

    let check_root = !args.no_check_root;
    let outcome = if args.watchdog {
        handle.mainloop_with_watchdog(check_root)
    } else {
        handle.mainloop(check_root).map(|_| ())
    };
    let code = exit_code(outcome)?;

    if let Some(workers) = workers {
        let results = workers
            .join()
            .map_err(|_| anyhow::anyhow!("worker coordinator panicked"))?;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(_) => log::debug!("worker {i} finished"),
                Err(HostError::SystemExit(status)) if code == 0 => return Ok(status),
                Err(err) => log::error!("worker {i}: {err}"),
            }
        }
    }
    Ok(code)
}

fn eval_scripts(scripts: Vec<String>, tuning: &TuningArgs) -> Result<i32> {
    let ctx = build_context(tuning)?;
    let handle = InterpHandle::new(&ctx);
    let workers = spawn_workers(&handle, scripts);

    let code = exit_code(handle.mainloop(true).map(|_| ()))?;
    let results = workers
        .join()
        .map_err(|_| anyhow::anyhow!("worker coordinator panicked"))?;

    let mut failed = false;
    for result in results {
        match result {
            Ok(value) => println!("{value}"),
            Err(err) => {
                eprintln!("error: {err}");
                failed = true;
            }
        }
    }
    Ok(if code == 0 && failed { 1 } else { code })
}

/// Evaluate each script on its own host thread. Once all of them are done
/// the environment is deleted, which ends a `check_root` loop.
fn spawn_workers(
    handle: &InterpHandle,
    scripts: Vec<String>,
) -> thread::JoinHandle<Vec<loopbridge_core::Result<String>>> {
    let handle = handle.clone();
    thread::spawn(move || {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut spawned = 0;
        for (i, script) in scripts.into_iter().enumerate() {
            let handle = handle.clone();
            let worker_tx = tx.clone();
            let builder = thread::Builder::new().name(format!("lbridge-worker-{i}"));
            let spawn = builder.spawn(move || {
                let _registration = handle.context().register_thread();
                let _ = worker_tx.send((i, handle.eval(&script)));
            });
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => {
                    log::error!("failed to spawn worker {i}: {e}");
                    let _ = tx.send((i, Err(HostError::Fatal(e.to_string()))));
                    spawned += 1;
                }
            }
        }
        drop(tx);

        let mut results: Vec<(usize, loopbridge_core::Result<String>)> =
            rx.iter().take(spawned).collect();
        results.sort_by_key(|(i, _)| *i);
        handle.delete();
        results.into_iter().map(|(_, result)| result).collect()
    })
}

fn exit_code(result: loopbridge_core::Result<()>) -> Result<i32> {
    match result {
        Ok(()) => Ok(0),
        Err(HostError::SystemExit(code)) => {
            log::info!("exit {code}");
            Ok(code)
        }
        Err(HostError::Interrupt) => {
            log::info!("Interrupted");
            Ok(INTERRUPTED_EXIT_CODE)
        }
        Err(err) => Err(err).context("Script failed"),
    }
}

fn config_command(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = LoopConfig::config_path()?;
            if path.exists() {
                anyhow::bail!("Config file already exists at {}", path.display());
            }
            let path = LoopConfig::create_default_config_file()?;
            println!("Created {}", path.display());
        }
        ConfigAction::Path => {
            println!("{}", LoopConfig::config_path()?.display());
        }
        ConfigAction::Show => {
            let config = LoopConfig::load_or_default();
            print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
        }
    }
    Ok(())
}
