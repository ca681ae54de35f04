//! Process configuration.
//!
//! Everything a `swarm-dispatch` process needs besides the swarm policy:
//! where the queue store lives, which policy file to load, worker counts,
//! timings and the LLM endpoint.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::error::PolicyError;
use crate::policy::SwarmPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The swarm policy file could not be loaded.
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Configuration for one process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    /// YAML swarm policy; built-in defaults when unset.
    pub policy_file: Option<PathBuf>,
    pub project_id: String,
    /// Function workers run by `worker`.
    pub workers: usize,
    /// Dispatches run at once by `serve`.
    pub max_concurrent_dispatches: usize,
    pub poll_interval: Duration,
    pub monitor_timeout: Duration,
    pub llm_api_base: Option<String>,
    pub llm_api_key: Option<String>,
    pub model: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            policy_file: None,
            project_id: "default".to_string(),
            workers: 4,
            max_concurrent_dispatches: 4,
            poll_interval: Duration::from_millis(100),
            monitor_timeout: Duration::from_secs(30 * 60),
            llm_api_base: None,
            llm_api_key: None,
            model: "anthropic/claude-sonnet-4".to_string(),
        }
    }
}

impl AppConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: queue store (default: redis://127.0.0.1:6379)
    /// - `SWARM_POLICY_FILE`: YAML swarm policy path
    /// - `SWARM_PROJECT_ID`: project used for capacity accounting (default: default)
    /// - `SWARM_WORKERS`: function workers per process (default: 4)
    /// - `SWARM_MAX_DISPATCHES`: concurrent dispatches per process (default: 4)
    /// - `SWARM_POLL_INTERVAL_MS`: blocking receive poll interval (default: 100)
    /// - `SWARM_MONITOR_TIMEOUT_SECS`: completion monitoring bound (default: 1800)
    /// - `LITELLM_API_BASE`, `LITELLM_API_KEY`: LLM endpoint
    /// - `SWARM_MODEL`: model id (default: anthropic/claude-sonnet-4)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable numbers and
    /// `ConfigError::ValidationFailed` if the result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }
        if let Some(val) = lookup("SWARM_POLICY_FILE").filter(|v| !v.trim().is_empty()) {
            config.policy_file = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("SWARM_PROJECT_ID") {
            config.project_id = val;
        }
        if let Some(val) = lookup("SWARM_WORKERS") {
            config.workers = parse_env_value(&val, "SWARM_WORKERS")?;
        }
        if let Some(val) = lookup("SWARM_MAX_DISPATCHES") {
            config.max_concurrent_dispatches = parse_env_value(&val, "SWARM_MAX_DISPATCHES")?;
        }
        if let Some(val) = lookup("SWARM_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "SWARM_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }
        if let Some(val) = lookup("SWARM_MONITOR_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SWARM_MONITOR_TIMEOUT_SECS")?;
            config.monitor_timeout = Duration::from_secs(secs);
        }
        config.llm_api_base = lookup("LITELLM_API_BASE").filter(|v| !v.trim().is_empty());
        config.llm_api_key = lookup("LITELLM_API_KEY").filter(|v| !v.trim().is_empty());
        if let Some(val) = lookup("SWARM_MODEL").filter(|v| !v.trim().is_empty()) {
            config.model = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_dispatches must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.monitor_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor_timeout must be greater than 0".to_string(),
            ));
        }
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }
        Ok(())
    }

    /// Loads and validates the swarm policy.
    pub fn load_policy(&self) -> Result<SwarmPolicy, ConfigError> {
        let policy = match &self.policy_file {
            Some(path) => SwarmPolicy::from_file(path)?,
            None => SwarmPolicy::default(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
