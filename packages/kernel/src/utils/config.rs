// packages/kernel/src/utils/config.rs
//! Kernel configuration
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults ([`KernelConfig::default`])
//! 2. Optional TOML file (`$KERNEL_CONFIG`, falling back to `kernel.toml`)
//! 3. Environment variables, e.g. `KERNEL__SCHEDULER__WORKERS=4`

use crate::utils::errors::{KernelError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "KERNEL_CONFIG";

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "kernel.toml";

/// What happens to an entity whose `wakeup()` fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WakeupFailurePolicy {
    /// Leave the entity known to its worker but never fire it again.
    /// Matches the behaviour of earlier kernels.
    #[default]
    Orphan,

    /// Reschedule exactly as after a successful wakeup
    Reschedule,
}

/// Top-level kernel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Scheduler sizing and policy
    pub scheduler: SchedulerConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of timer workers (independent heaps, one thread each)
    pub workers: usize,

    /// Maximum number of wakeups executing at once
    pub pool_size: usize,

    /// Handling of entities whose wakeup failed
    pub failure_policy: WakeupFailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            pool_size: 8,
            failure_policy: WakeupFailurePolicy::Orphan,
        }
    }
}

impl SchedulerConfig {
    /// Single worker, small pool. Handy when firing order matters.
    pub fn single_worker(pool_size: usize) -> Self {
        Self {
            workers: 1,
            pool_size,
            ..Default::default()
        }
    }

    pub fn with_failure_policy(mut self, policy: WakeupFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Validate sizing
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(KernelError::ConfigError(
                "scheduler.workers must be at least 1".into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(KernelError::ConfigError(
                "scheduler.pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl KernelConfig {
    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from(Some(Path::new(&path))),
            Err(_) => Self::load_from(None),
        }
    }

    /// Load configuration, reading `path` (required) or `kernel.toml` (optional)
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&KernelConfig::default())?;

        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: KernelConfig = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                Environment::with_prefix("KERNEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!(?config, "Kernel configuration loaded");
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()
    }
}
