// Coordinator configuration
//
// Loaded from environment variables. Unset keys fall back to defaults; set
// but unparseable keys are an error.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::{ExecutorConfig, PollerConfig, RunApiClient};
use crate::task::ExecutionBackend;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Top-level configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Base URL of the run API
    pub api_base_url: String,

    /// Bearer token attached to every run API call
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,

    /// Interval between run-status polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Timeout of each run-status poll request
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Interval between due-schedule claims
    #[serde(with = "duration_millis")]
    pub scheduler_poll_interval: Duration,

    /// Maximum schedules executing at once
    pub max_concurrent_schedules: usize,

    /// Identity written into schedule locks
    pub worker_id: String,

    /// Worker threads for side effects; 0 runs them cooperatively
    pub side_effect_threads: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:7777".to_string(),
            api_token: None,
            poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            scheduler_poll_interval: Duration::from_secs(15),
            max_concurrent_schedules: 4,
            worker_id: format!("scheduler-{}", Uuid::now_v7()),
            side_effect_threads: 0,
        }
    }
}

impl CoordinatorConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUNWARDEN_API_BASE_URL`: run API base URL (default: http://127.0.0.1:7777)
    /// - `RUNWARDEN_API_TOKEN`: bearer token
    /// - `RUNWARDEN_POLL_INTERVAL_MS`: run-status poll interval (default: 30000)
    /// - `RUNWARDEN_REQUEST_TIMEOUT_MS`: per poll request timeout (default: 30000)
    /// - `RUNWARDEN_SCHEDULER_POLL_MS`: due-schedule poll interval (default: 15000)
    /// - `RUNWARDEN_MAX_CONCURRENT_SCHEDULES`: concurrent executions (default: 4)
    /// - `RUNWARDEN_WORKER_ID`: lock owner id (default: scheduler-<uuid>)
    /// - `RUNWARDEN_SIDE_EFFECT_THREADS`: side-effect worker threads, 0 = cooperative
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(key) {
                Some(value) => value
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidValue { key, value }),
                None => Ok(default),
            }
        };
        let count = |key: &'static str, default: usize| -> Result<usize, ConfigError> {
            match get(key) {
                Some(value) => value
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidValue { key, value }),
                None => Ok(default),
            }
        };

        Ok(Self {
            api_base_url: get("RUNWARDEN_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_token: get("RUNWARDEN_API_TOKEN"),
            poll_interval: millis("RUNWARDEN_POLL_INTERVAL_MS", defaults.poll_interval)?,
            request_timeout: millis("RUNWARDEN_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            scheduler_poll_interval: millis(
                "RUNWARDEN_SCHEDULER_POLL_MS",
                defaults.scheduler_poll_interval,
            )?,
            max_concurrent_schedules: count(
                "RUNWARDEN_MAX_CONCURRENT_SCHEDULES",
                defaults.max_concurrent_schedules,
            )?
            .max(1),
            worker_id: get("RUNWARDEN_WORKER_ID").unwrap_or(defaults.worker_id),
            side_effect_threads: count(
                "RUNWARDEN_SIDE_EFFECT_THREADS",
                defaults.side_effect_threads,
            )?,
        })
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_schedules(mut self, max: usize) -> Self {
        self.max_concurrent_schedules = max.max(1);
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_side_effect_threads(mut self, threads: usize) -> Self {
        self.side_effect_threads = threads;
        self
    }

    /// Backend for side-effect jobs
    pub fn side_effect_backend(&self) -> ExecutionBackend {
        match self.side_effect_threads {
            0 => ExecutionBackend::Cooperative,
            max_threads => ExecutionBackend::WorkerThreads { max_threads },
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new().with_poll_interval(self.poll_interval)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::new()
            .with_worker_id(self.worker_id.clone())
            .with_poll_interval(self.scheduler_poll_interval)
            .with_max_concurrent(self.max_concurrent_schedules)
    }

    pub fn api_client(&self) -> RunApiClient {
        RunApiClient::new(&self.api_base_url)
            .with_token(self.api_token.clone())
            .with_request_timeout(self.request_timeout)
    }
}

/// Serde support for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
