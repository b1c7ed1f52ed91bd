use crate::optimize::scheduler::{ResumePolicy, SchedulerConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub database_url: String,
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
    /// `None` lets jobs wait in the queue indefinitely.
    pub queue_wait_limit: Option<Duration>,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub resume_policy: ResumePolicy,
    pub evaluator_url: String,
    pub evaluator_timeout: Duration,
    pub log_dir: PathBuf,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://optimizer.db?mode=rwc".to_string(),
            max_concurrent: 2,
            max_queue_depth: 100,
            queue_wait_limit: None,
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            resume_policy: ResumePolicy::Fail,
            evaluator_url: "http://127.0.0.1:4001".to_string(),
            evaluator_timeout: Duration::from_secs(120),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl OptimizerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_concurrent: positive(&get, "OPT_MAX_CONCURRENT", defaults.max_concurrent)?,
            max_queue_depth: positive(&get, "OPT_MAX_QUEUE_DEPTH", defaults.max_queue_depth)?,
            queue_wait_limit: match parsed(&get, "OPT_QUEUE_WAIT_LIMIT_SECS", 0u64)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            retention: Duration::from_secs(parsed(
                &get,
                "OPT_RETENTION_SECS",
                defaults.retention.as_secs(),
            )?),
            cleanup_interval: Duration::from_secs(positive(
                &get,
                "OPT_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )?),
            resume_policy: parsed(&get, "OPT_RESUME_POLICY", defaults.resume_policy)?,
            evaluator_url: get("EVALUATOR_URL").unwrap_or(defaults.evaluator_url),
            evaluator_timeout: Duration::from_secs(positive(
                &get,
                "EVALUATOR_TIMEOUT_SECS",
                defaults.evaluator_timeout.as_secs(),
            )?),
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            max_queue_depth: self.max_queue_depth,
            queue_wait_limit: self.queue_wait_limit,
        }
    }
}

fn parsed<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parsed(get, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: get(key).unwrap_or_default(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
