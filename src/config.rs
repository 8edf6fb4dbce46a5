//! Serving configuration.
//!
//! Layering: `Default` values, then an optional TOML file, then `SERVING_*`
//! environment variables.

use crate::error::ConfigError;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DAY_SECS: u64 = 86_400;
const MAX_TTL_SECS: u64 = 365 * DAY_SECS;
const MAX_CALL_TIMEOUT_MS: u64 = 3_600_000;
const MAX_CACHE_OP_TIMEOUT_MS: u64 = 60_000;
const MAX_INVALIDATE_TIMEOUT_MS: u64 = 600_000;

/// Admission controller (circuit breaker) tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests inside the guarded region that trip the breaker
    pub queue_depth_threshold: usize,
    /// Failure ratio over the window that trips the breaker
    pub failure_rate_threshold: f64,
    /// Samples required in-window before the failure rate counts
    pub min_calls_for_rate: usize,
    pub open_duration_secs: u64,
    pub half_open_max_calls: usize,
    pub window_size_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: 64,
            failure_rate_threshold: 0.5,
            min_calls_for_rate: 10,
            open_duration_secs: 30,
            half_open_max_calls: 3,
            window_size_secs: 60,
        }
    }
}

impl AdmissionConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_secs)
    }
}

/// How the worker pool runs blocking scoring calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fixed set of dedicated OS threads owned by the pool
    DedicatedThreads,
    /// The runtime's blocking thread pool, bounded by a semaphore
    RuntimeBlocking,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dedicated_threads" | "threads" => Ok(ExecutionMode::DedicatedThreads),
            "runtime_blocking" | "blocking" => Ok(ExecutionMode::RuntimeBlocking),
            other => Err(ConfigError::Invalid(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub worker_pool_size: usize,
    pub mode: ExecutionMode,
    /// Per-call scoring deadline
    pub call_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            mode: ExecutionMode::DedicatedThreads,
            call_timeout_ms: 2_000,
        }
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Default entry lifetime; bounds staleness under concept drift
    pub ttl_secs: u64,
    /// Budget for one store round-trip, independent of scoring deadlines
    pub op_timeout_ms: u64,
    /// Budget for one bulk invalidation (a keyspace scan)
    pub invalidate_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            op_timeout_ms: 5,
            invalidate_timeout_ms: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn invalidate_timeout(&self) -> Duration {
        Duration::from_millis(self.invalidate_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HotSwapConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Metric checked during candidate validation
    pub metric_name: String,
    pub min_acceptable_metric: f64,
}

impl Default for HotSwapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            metric_name: "auc".to_string(),
            min_acceptable_metric: 0.7,
        }
    }
}

impl HotSwapConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./var/data/registry.db"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Directory for prediction log files
    pub log_dir: PathBuf,
    /// Sample rate (0.0 - 1.0). 1.0 = record all
    pub sample_rate: f64,
    /// Rotate when the active file exceeds this many bytes (0 = never)
    pub rotate_bytes: u64,
    /// Rotate when the active file is older than this (0 = never)
    pub rotate_age_secs: u64,
    pub max_rotated_files: usize,
    pub compress_rotated: bool,
    /// Events buffered for the background writer; overflow is dropped
    pub queue_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("./var/predictlog"),
            sample_rate: 1.0,
            rotate_bytes: 100 * 1024 * 1024,
            rotate_age_secs: DAY_SECS,
            max_rotated_files: 10,
            compress_rotated: true,
            queue_capacity: 10_000,
        }
    }
}

/// Top-level configuration for one serving process.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub admission: AdmissionConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
    pub hotswap: HotSwapConfig,
    pub registry: RegistryConfig,
    pub telemetry: TelemetryConfig,
}

impl ServingConfig {
    /// Parse a TOML document. Missing sections keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Copy for short-lived commands: the model is bootstrapped but the
    /// registry is never polled, so nothing gets promoted behind the caller.
    pub fn without_polling(&self) -> Self {
        let mut cfg = self.clone();
        cfg.hotswap.enabled = false;
        cfg
    }

    /// Full load: file (if given), environment overrides, validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `SERVING_*` overrides. The lookup is injected so tests need not touch
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, raw)))
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse($key, raw)?;
                }
            };
        }

        override_field!("SERVING_QUEUE_DEPTH_THRESHOLD", self.admission.queue_depth_threshold);
        override_field!("SERVING_FAILURE_RATE_THRESHOLD", self.admission.failure_rate_threshold);
        override_field!("SERVING_MIN_CALLS_FOR_RATE", self.admission.min_calls_for_rate);
        override_field!("SERVING_OPEN_DURATION_SECS", self.admission.open_duration_secs);
        override_field!("SERVING_HALF_OPEN_MAX_CALLS", self.admission.half_open_max_calls);
        override_field!("SERVING_WINDOW_SIZE_SECS", self.admission.window_size_secs);
        override_field!("SERVING_WORKER_POOL_SIZE", self.executor.worker_pool_size);
        override_field!("SERVING_EXECUTION_MODE", self.executor.mode);
        override_field!("SERVING_CACHE_TTL_SECS", self.cache.ttl_secs);
        override_field!("SERVING_CALL_TIMEOUT_MS", self.executor.call_timeout_ms);
        override_field!("SERVING_POLL_INTERVAL_SECS", self.hotswap.poll_interval_secs);
        override_field!("SERVING_MIN_ACCEPTABLE_METRIC", self.hotswap.min_acceptable_metric);
        override_field!("SERVING_REGISTRY_PATH", self.registry.path);

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn within(name: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
            if value < min || value > max {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within [{}, {}], got {}",
                    name, min, max, value
                )));
            }
            Ok(())
        }

        let a = &self.admission;
        if !(0.0..=1.0).contains(&a.failure_rate_threshold) {
            return Err(ConfigError::Invalid(
                "failure_rate_threshold must be within [0, 1]".into(),
            ));
        }
        if a.queue_depth_threshold == 0 {
            return Err(ConfigError::Invalid("queue_depth_threshold must be > 0".into()));
        }
        if a.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid("half_open_max_calls must be > 0".into()));
        }
        within("open_duration_secs", a.open_duration_secs, 0, DAY_SECS)?;
        within("window_size_secs", a.window_size_secs, 1, DAY_SECS)?;

        if self.executor.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be > 0".into()));
        }
        within("call_timeout_ms", self.executor.call_timeout_ms, 1, MAX_CALL_TIMEOUT_MS)?;

        let c = &self.cache;
        within("ttl_secs", c.ttl_secs, 0, MAX_TTL_SECS)?;
        within("op_timeout_ms", c.op_timeout_ms, 1, MAX_CACHE_OP_TIMEOUT_MS)?;
        within(
            "invalidate_timeout_ms",
            c.invalidate_timeout_ms,
            1,
            MAX_INVALIDATE_TIMEOUT_MS,
        )?;

        within("poll_interval_secs", self.hotswap.poll_interval_secs, 1, DAY_SECS)?;

        let t = &self.telemetry;
        if !(0.0..=1.0).contains(&t.sample_rate) {
            return Err(ConfigError::Invalid("sample_rate must be within [0, 1]".into()));
        }
        within("rotate_age_secs", t.rotate_age_secs, 0, MAX_TTL_SECS)?;
        if t.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}
