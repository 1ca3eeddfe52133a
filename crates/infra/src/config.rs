//! Engine configuration.
//!
//! Defaults are production values; every field can be overridden from the
//! environment with the `JOBFLOW_` prefix (durations in milliseconds):
//!
//! | variable | field |
//! |---|---|
//! | `JOBFLOW_ENGINE_NAME` | `engine_name` |
//! | `JOBFLOW_LOCK_OWNER` | `lock_owner` |
//! | `JOBFLOW_ACQUISITION_INTERVAL_MS` | `acquisition_interval` |
//! | `JOBFLOW_MAX_JOBS_PER_ACQUISITION` | `max_jobs_per_acquisition` |
//! | `JOBFLOW_LOCK_DURATION_MS` | `lock_duration` |
//! | `JOBFLOW_WORKER_POOL_SIZE` | `worker_pool_size` |
//! | `JOBFLOW_WORKER_QUEUE_CAPACITY` | `worker_queue_capacity` |
//! | `JOBFLOW_DEFAULT_RETRIES` | `default_retries` |
//! | `JOBFLOW_RETRY_STRATEGY` | `retry_policy.strategy` |
//! | `JOBFLOW_RETRY_BASE_DELAY_MS` | `retry_policy.base_delay` |
//! | `JOBFLOW_RETRY_MAX_DELAY_MS` | `retry_policy.max_delay` |
//! | `JOBFLOW_JOBS_PER_SEED` | `jobs_per_seed_invocation` |
//! | `JOBFLOW_INVOCATIONS_PER_JOB` | `invocations_per_batch_job` |
//! | `JOBFLOW_BATCH_POLL_INTERVAL_MS` | `batch_poll_interval` |
//! | `JOBFLOW_MAX_BATCH_POLL_INTERVAL_MS` | `max_batch_poll_interval` |
//! | `JOBFLOW_MAX_ACQUISITION_BACKOFF_MS` | `max_acquisition_backoff` |
//! | `JOBFLOW_EXECUTOR_AUTO_START` | `executor_auto_start` |
//! | `JOBFLOW_LOG_FORMAT` | `log.format` |
//! | `JOBFLOW_LOG_FILTER` | `log.filter` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use jobflow_jobs::{DEFAULT_RETRIES, RetryPolicy};
use jobflow_observability::LogConfig;

pub const ENV_PREFIX: &str = "JOBFLOW_";

/// Upper bound for every configured delay; lock expirations and due dates
/// are computed by adding these to the current time.
pub const MAX_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub engine_name: String,
    /// Identity written into `lock_owner` of acquired jobs.
    pub lock_owner: String,
    pub acquisition_interval: Duration,
    pub max_jobs_per_acquisition: usize,
    pub lock_duration: Duration,
    pub worker_pool_size: usize,
    pub worker_queue_capacity: usize,
    pub default_retries: u32,
    pub retry_policy: RetryPolicy,
    pub jobs_per_seed_invocation: u32,
    pub invocations_per_batch_job: u32,
    pub batch_poll_interval: Duration,
    pub max_batch_poll_interval: Duration,
    pub max_acquisition_backoff: Duration,
    pub executor_auto_start: bool,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let engine_name = "default".to_string();
        Self {
            lock_owner: default_lock_owner(),
            engine_name,
            acquisition_interval: Duration::from_secs(5),
            max_jobs_per_acquisition: 3,
            lock_duration: Duration::from_secs(300),
            worker_pool_size: 3,
            worker_queue_capacity: 3,
            default_retries: DEFAULT_RETRIES,
            retry_policy: RetryPolicy::exponential(Duration::from_secs(10), Duration::from_secs(300)),
            jobs_per_seed_invocation: 100,
            invocations_per_batch_job: 1,
            batch_poll_interval: Duration::from_secs(30),
            max_batch_poll_interval: Duration::from_secs(300),
            max_acquisition_backoff: Duration::from_secs(60),
            executor_auto_start: false,
            log: LogConfig::default(),
        }
    }
}

/// `<hostname>-<uuid>`, so several engines on one host never share a lock owner.
fn default_lock_owner() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "jobflow".to_string());
    format!("{host}-{}", Uuid::now_v7())
}

impl EngineConfig {
    /// Defaults overridden by `JOBFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `JOBFLOW_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let mut config = Self::default();

        if let Some(name) = env.raw("ENGINE_NAME") {
            config.engine_name = name;
        }
        if let Some(owner) = env.raw("LOCK_OWNER") {
            config.lock_owner = owner;
        }
        env.millis("ACQUISITION_INTERVAL_MS", &mut config.acquisition_interval)?;
        env.parse("MAX_JOBS_PER_ACQUISITION", &mut config.max_jobs_per_acquisition)?;
        env.millis("LOCK_DURATION_MS", &mut config.lock_duration)?;
        env.parse("WORKER_POOL_SIZE", &mut config.worker_pool_size)?;
        env.parse("WORKER_QUEUE_CAPACITY", &mut config.worker_queue_capacity)?;
        env.parse("DEFAULT_RETRIES", &mut config.default_retries)?;
        env.parse("RETRY_STRATEGY", &mut config.retry_policy.strategy)?;
        env.millis("RETRY_BASE_DELAY_MS", &mut config.retry_policy.base_delay)?;
        env.millis("RETRY_MAX_DELAY_MS", &mut config.retry_policy.max_delay)?;
        env.parse("JOBS_PER_SEED", &mut config.jobs_per_seed_invocation)?;
        env.parse("INVOCATIONS_PER_JOB", &mut config.invocations_per_batch_job)?;
        env.millis("BATCH_POLL_INTERVAL_MS", &mut config.batch_poll_interval)?;
        env.millis("MAX_BATCH_POLL_INTERVAL_MS", &mut config.max_batch_poll_interval)?;
        env.millis("MAX_ACQUISITION_BACKOFF_MS", &mut config.max_acquisition_backoff)?;
        env.parse("EXECUTOR_AUTO_START", &mut config.executor_auto_start)?;
        env.parse("LOG_FORMAT", &mut config.log.format)?;
        if let Some(filter) = env.raw("LOG_FILTER") {
            config.log.filter = filter;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("MAX_JOBS_PER_ACQUISITION", self.max_jobs_per_acquisition),
            ("WORKER_POOL_SIZE", self.worker_pool_size),
            ("WORKER_QUEUE_CAPACITY", self.worker_queue_capacity),
            ("JOBS_PER_SEED", self.jobs_per_seed_invocation as usize),
            ("INVOCATIONS_PER_JOB", self.invocations_per_batch_job as usize),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: format!("{ENV_PREFIX}{key}"),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }

        let delays = [
            ("ACQUISITION_INTERVAL_MS", self.acquisition_interval),
            ("LOCK_DURATION_MS", self.lock_duration),
            ("RETRY_BASE_DELAY_MS", self.retry_policy.base_delay),
            ("RETRY_MAX_DELAY_MS", self.retry_policy.max_delay),
            ("BATCH_POLL_INTERVAL_MS", self.batch_poll_interval),
            ("MAX_BATCH_POLL_INTERVAL_MS", self.max_batch_poll_interval),
            ("MAX_ACQUISITION_BACKOFF_MS", self.max_acquisition_backoff),
        ];
        for (key, value) in delays {
            if value > MAX_DELAY {
                return Err(ConfigError::Invalid {
                    key: format!("{ENV_PREFIX}{key}"),
                    value: value.as_millis().to_string(),
                    reason: format!("must not exceed {}ms", MAX_DELAY.as_millis()),
                });
            }
        }
        Ok(())
    }

    pub fn with_engine_name(mut self, name: impl Into<String>) -> Self {
        self.engine_name = name.into();
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_acquisition_interval(mut self, interval: Duration) -> Self {
        self.acquisition_interval = interval;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_worker_pool(mut self, size: usize, queue_capacity: usize) -> Self {
        self.worker_pool_size = size;
        self.worker_queue_capacity = queue_capacity;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_batch_sizes(mut self, jobs_per_seed: u32, invocations_per_job: u32) -> Self {
        self.jobs_per_seed_invocation = jobs_per_seed;
        self.invocations_per_batch_job = invocations_per_job;
        self
    }

    pub fn with_batch_poll_interval(mut self, interval: Duration, max: Duration) -> Self {
        self.batch_poll_interval = interval;
        self.max_batch_poll_interval = max;
        self
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(name: &str) -> String {
        format!("{ENV_PREFIX}{name}")
    }

    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&Self::key(name)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        if let Some(value) = self.raw(name) {
            *target = value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: Self::key(name),
                value: value.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn millis(&self, name: &str, target: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = target.as_millis() as u64;
        self.parse(name, &mut ms)?;
        *target = Duration::from_millis(ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use jobflow_jobs::BackoffStrategy;
    use jobflow_observability::LogFormat;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.acquisition_interval, Duration::from_secs(5));
        assert_eq!(config.max_jobs_per_acquisition, 3);
        assert_eq!(config.lock_duration, Duration::from_secs(300));
        assert_eq!(config.worker_pool_size, 3);
        assert_eq!(config.worker_queue_capacity, 3);
        assert_eq!(config.default_retries, 3);
        assert_eq!(config.jobs_per_seed_invocation, 100);
        assert_eq!(config.invocations_per_batch_job, 1);
        assert!(!config.executor_auto_start);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("JOBFLOW_LOCK_OWNER", "node-7"),
            ("JOBFLOW_ACQUISITION_INTERVAL_MS", "250"),
            ("JOBFLOW_WORKER_POOL_SIZE", "8"),
            ("JOBFLOW_RETRY_STRATEGY", "linear"),
            ("JOBFLOW_LOG_FORMAT", "pretty"),
            ("JOBFLOW_EXECUTOR_AUTO_START", "true"),
        ]))
        .unwrap();

        assert_eq!(config.lock_owner, "node-7");
        assert_eq!(config.acquisition_interval, Duration::from_millis(250));
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.retry_policy.strategy, BackoffStrategy::Linear);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert!(config.executor_auto_start);
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("JOBFLOW_WORKER_POOL_SIZE", "many")])).unwrap_err();
        let ConfigError::Invalid { key, value, .. } = err;
        assert_eq!(key, "JOBFLOW_WORKER_POOL_SIZE");
        assert_eq!(value, "many");
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("JOBFLOW_WORKER_POOL_SIZE", "0")])).is_err());
    }

    #[test]
    fn oversized_delays_are_rejected() {
        let huge = (u64::MAX / 4).to_string();
        for key in ["JOBFLOW_LOCK_DURATION_MS", "JOBFLOW_RETRY_MAX_DELAY_MS"] {
            let err = EngineConfig::from_lookup(lookup(&[(key, huge.as_str())])).unwrap_err();
            let ConfigError::Invalid { key: reported, .. } = err;
            assert_eq!(reported, key);
        }
    }

    #[test]
    fn delay_at_the_bound_is_accepted() {
        let config = EngineConfig::default().with_lock_duration(MAX_DELAY);
        assert!(config.validate().is_ok());
        assert!(EngineConfig::default().with_lock_duration(MAX_DELAY + Duration::from_millis(1)).validate().is_err());
    }

    #[test]
    fn lock_owners_are_unique_per_config() {
        assert_ne!(EngineConfig::default().lock_owner, EngineConfig::default().lock_owner);
    }
}
