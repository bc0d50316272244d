//! Runner configuration: builder plus environment overrides.

use std::sync::Arc;
use std::time::Duration;

use crate::process::{ExecSpawner, ProcessSpawner};
use crate::updater::{DEFAULT_CLEAN_CHECKS, DEFAULT_FETCH_TIMEOUT};

pub const WORKERS_ENV: &str = "BOTRUN_WORKERS";
pub const FETCH_TIMEOUT_ENV: &str = "BOTRUN_FETCH_TIMEOUT";
pub const CLEAN_CHECKS_ENV: &str = "BOTRUN_CLEAN_CHECKS";

const DEFAULT_TICK: Duration = Duration::from_millis(100);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RunnerConfig {
    pub workers: usize,
    /// Control loop tick. Timers are still checked at most once per second.
    pub tick: Duration,
    pub fetch_timeout: Duration,
    pub clean_checks: u32,
    /// How long a child may take to report ready.
    pub startup_timeout: Duration,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("workers", &self.workers)
            .field("tick", &self.tick)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("clean_checks", &self.clean_checks)
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self {
            workers: default_workers(),
            tick: DEFAULT_TICK,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            clean_checks: DEFAULT_CLEAN_CHECKS,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            spawner: Arc::new(ExecSpawner),
        }
    }

    /// Defaults overridden by `BOTRUN_WORKERS`, `BOTRUN_FETCH_TIMEOUT` (seconds) and
    /// `BOTRUN_CLEAN_CHECKS`. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(workers) = parse(&lookup, WORKERS_ENV).filter(|n: &usize| *n > 0) {
            config.workers = workers;
        }
        if let Some(secs) = parse::<u64>(&lookup, FETCH_TIMEOUT_ENV) {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(checks) = parse(&lookup, CLEAN_CHECKS_ENV) {
            config.clean_checks = checks;
        }
        config
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_clean_checks(mut self, checks: u32) -> Self {
        self.clean_checks = checks;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
