//! Configuration file support for loopbridge
//!
//! The scheduler tunables are stored in TOML format at:
//! - Linux: `~/.config/loopbridge/config.toml`
//! - macOS: `~/Library/Application Support/loopbridge/config.toml`
//! - Windows: `%APPDATA%\loopbridge\config.toml`

use crate::error::ConfigError;
use crate::scheduler::{
    AbortPolicy, Tunables, DEFAULT_EVENT_LOOP_MAX, DEFAULT_NO_EVENT_TICK, DEFAULT_NO_EVENT_WAIT,
    DEFAULT_TIMER_TICK, NO_THREAD_INTERRUPT_TIME, WATCHDOG_INTERVAL,
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Event loop fairness
    pub event_loop: EventLoopSettings,
    /// Watchdog timing
    pub watchdog: WatchdogSettings,
    /// Error reporting
    pub errors: ErrorSettings,
}

impl LoopConfig {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(ConfigError::NotFound(path.display().to_string()))
        }
    }

    /// Load and validate configuration from `path`
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: LoopConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => Self::default(),
            Err(e) => {
                log::warn!("ignoring configuration: {e}");
                Self::default()
            }
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "loopbridge") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(ConfigError::NoConfigDir)
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_config(&path)?;
        Ok(path)
    }

    /// Write the commented default configuration to `path`
    pub fn write_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = r#"# loopbridge configuration file

[event_loop]
# Events processed per turn while other threads take part
loop_max = 800

# Budget charged for every poll that found nothing
no_event_tick = 10

# Sleep after an empty poll, in milliseconds
no_event_wait_ms = 20

# Period of the turn timer in milliseconds (0 disables it)
timer_tick_ms = 0

# Longest a single blocking wait for events may last, in milliseconds (0 = no cap)
max_block_time_ms = 0

[watchdog]
# Check interval while threads wait on the loop
interval_ms = 10

# Check interval while idle, also the fallback timer of a lone loop
no_thread_interrupt_ms = 100

[errors]
# What to do when an embedded call fails: "raise", "warn" or "ignore"
abort_on_exception = "raise"
"#;

        fs::write(path, content)?;
        Ok(())
    }

    /// Check that every tunable is in range
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("event_loop.loop_max", u64::from(self.event_loop.loop_max)),
            ("event_loop.no_event_tick", u64::from(self.event_loop.no_event_tick)),
            ("event_loop.no_event_wait_ms", self.event_loop.no_event_wait_ms),
            ("watchdog.interval_ms", self.watchdog.interval_ms),
            ("watchdog.no_thread_interrupt_ms", self.watchdog.no_thread_interrupt_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Convert to the scheduler's tunables
    pub fn tunables(&self) -> Tunables {
        Tunables {
            loop_max: self.event_loop.loop_max,
            no_event_tick: self.event_loop.no_event_tick,
            no_event_wait: Duration::from_millis(self.event_loop.no_event_wait_ms),
            timer_tick: Duration::from_millis(self.event_loop.timer_tick_ms),
            watchdog_interval: Duration::from_millis(self.watchdog.interval_ms),
            no_thread_interrupt_time: Duration::from_millis(self.watchdog.no_thread_interrupt_ms),
            max_block_time: (self.event_loop.max_block_time_ms > 0)
                .then(|| Duration::from_millis(self.event_loop.max_block_time_ms)),
        }
    }
}

/// Event loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopSettings {
    pub loop_max: u32,
    pub no_event_tick: u32,
    pub no_event_wait_ms: u64,
    pub timer_tick_ms: u64,
    pub max_block_time_ms: u64,
}

impl Default for EventLoopSettings {
    fn default() -> Self {
        Self {
            loop_max: DEFAULT_EVENT_LOOP_MAX,
            no_event_tick: DEFAULT_NO_EVENT_TICK,
            no_event_wait_ms: DEFAULT_NO_EVENT_WAIT.as_millis() as u64,
            timer_tick_ms: DEFAULT_TIMER_TICK.as_millis() as u64,
            max_block_time_ms: 0,
        }
    }
}

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub interval_ms: u64,
    pub no_thread_interrupt_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_ms: WATCHDOG_INTERVAL.as_millis() as u64,
            no_thread_interrupt_ms: NO_THREAD_INTERRUPT_TIME.as_millis() as u64,
        }
    }
}

/// Error reporting settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorSettings {
    pub abort_on_exception: AbortPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoopConfig::default();
        assert_eq!(config.event_loop.loop_max, 800);
        assert_eq!(config.event_loop.no_event_tick, 10);
        assert_eq!(config.event_loop.no_event_wait_ms, 20);
        assert_eq!(config.event_loop.timer_tick_ms, 0);
        assert_eq!(config.event_loop.max_block_time_ms, 0);
        assert_eq!(config.watchdog.interval_ms, 10);
        assert_eq!(config.watchdog.no_thread_interrupt_ms, 100);
        assert_eq!(config.errors.abort_on_exception, AbortPolicy::Raise);
        assert_eq!(config.tunables(), Tunables::default());
    }

    #[test]
    fn test_default_file_matches_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        LoopConfig::write_default_config(&path).unwrap();
        assert_eq!(LoopConfig::load_from(&path).unwrap(), LoopConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[event_loop]\nloop_max = 50\n\n[errors]\nabort_on_exception = \"warn\"\n").unwrap();
        let config = LoopConfig::load_from(&path).unwrap();
        assert_eq!(config.event_loop.loop_max, 50);
        assert_eq!(config.event_loop.no_event_tick, 10);
        assert_eq!(config.errors.abort_on_exception, AbortPolicy::Warn);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = LoopConfig::default();
        config.event_loop.timer_tick_ms = 25;
        config.event_loop.max_block_time_ms = 40;
        config.errors.abort_on_exception = AbortPolicy::Ignore;
        config.save(&path).unwrap();
        let loaded = LoopConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.tunables().max_block_time, Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_zero_tunable_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[event_loop]\nno_event_wait_ms = 0\n").unwrap();
        let err = LoopConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("no_event_wait_ms"));
    }

    #[test]
    fn test_bad_policy_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[errors]\nabort_on_exception = \"explode\"\n").unwrap();
        assert!(matches!(
            LoopConfig::load_from(&path),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
