use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ErrorClass;
use crate::{rlog_debug, Error, Result};

/// Top-level configuration, read from `~/.relay/relay.toml`.
///
/// Every section is optional in the file; missing sections take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
}

/// Delegate dispatch protocol tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// A delegate silent for longer than this is marked disconnected.
    pub heartbeat_timeout_secs: u64,
    /// Upper bound for a single `acquire_task` long-poll.
    pub acquire_poll_timeout_ms: u64,
    /// Lease lifetime for tasks submitted without their own timeout.
    pub default_task_timeout_secs: u64,
    /// Lease grants per task before a lease expiry becomes terminal.
    pub max_task_attempts: u32,
    /// Period of the background lease/heartbeat reaper.
    pub reaper_interval_ms: u64,
    /// How long a finished task stays readable before the reaper drops it.
    pub finished_task_retention_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 60,
            acquire_poll_timeout_ms: 5_000,
            default_task_timeout_secs: 300,
            max_task_attempts: 3,
            reaper_interval_ms: 1_000,
            finished_task_retention_secs: 3_600,
        }
    }
}

impl DispatchConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn acquire_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_timeout_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn finished_task_retention(&self) -> Duration {
        Duration::from_secs(self.finished_task_retention_secs)
    }
}

/// Client-side retry of transient transport failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            max_retries: 8,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChainConfig {
    /// Rounds a single chain may issue before it is failed as runaway.
    pub max_rounds: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { max_rounds: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    /// Executions per logical step, counting the first one.
    pub max_attempts: u32,
    pub retryable_classes: Vec<ErrorClass>,
    /// Failure messages matching any of these regexes are never retried.
    pub fatal_message_patterns: Vec<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retryable_classes: vec![
                ErrorClass::TransientTransport,
                ErrorClass::RemoteTaskFailure,
                ErrorClass::TaskTimeout,
            ],
            fatal_message_patterns: vec![
                "(?i)permission denied".to_string(),
                "(?i)invalid credentials".to_string(),
            ],
        }
    }
}

impl Config {
    pub fn relay_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".relay"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::relay_dir()?.join("relay.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: heartbeat_timeout={}s max_task_attempts={} max_rounds={} max_attempts={}",
            config.dispatch.heartbeat_timeout_secs,
            config.dispatch.max_task_attempts,
            config.chain.max_rounds,
            config.governor.max_attempts
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.heartbeat_timeout_secs == 0 {
            return Err(Error::Validation(
                "dispatch.heartbeat_timeout_secs must be positive".into(),
            ));
        }
        if self.dispatch.default_task_timeout_secs == 0 {
            return Err(Error::Validation(
                "dispatch.default_task_timeout_secs must be positive".into(),
            ));
        }
        if self.dispatch.max_task_attempts == 0 {
            return Err(Error::Validation(
                "dispatch.max_task_attempts must be positive".into(),
            ));
        }
        if self.chain.max_rounds == 0 {
            return Err(Error::Validation("chain.max_rounds must be positive".into()));
        }
        if self.governor.max_attempts == 0 {
            return Err(Error::Validation(
                "governor.max_attempts must be positive".into(),
            ));
        }
        for pattern in &self.governor.fatal_message_patterns {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }
}
