//! # Pool Configuration
//!
//! Process-wide knobs for the execution unit pool. There is no per-call override.
//!
//! Values can be read from the environment:
//!
//! | Variable                    | Default                  |
//! |-----------------------------|--------------------------|
//! | `EXOPOOL_MAX_UNITS`         | available parallelism    |
//! | `EXOPOOL_IDLE_TIMEOUT_MS`   | `10000`                  |
//! | `EXOPOOL_SWEEP_INTERVAL_MS` | `1000`                   |
//!
//! Absent or unparsable values fall back to the default.

use std::time::Duration;

pub const ENV_MAX_UNITS: &str = "EXOPOOL_MAX_UNITS";
pub const ENV_IDLE_TIMEOUT_MS: &str = "EXOPOOL_IDLE_TIMEOUT_MS";
pub const ENV_SWEEP_INTERVAL_MS: &str = "EXOPOOL_SWEEP_INTERVAL_MS";

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on simultaneously live units. Never zero.
    pub max_units: usize,
    /// How long a unit may sit without tasks before the sweeper terminates it.
    pub idle_timeout: Duration,
    /// Tick of the idle sweeper.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_units: default_parallelism(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl PoolConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let defaults = Self::default();

        Self {
            max_units: number(ENV_MAX_UNITS)
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.max_units),
            idle_timeout: number(ENV_IDLE_TIMEOUT_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_timeout),
            sweep_interval: number(ENV_SWEEP_INTERVAL_MS)
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = max_units.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval.max(Duration::from_millis(1));
        self
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
