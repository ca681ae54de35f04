//! Swarm-wide resource, throttling and retry policy.
//!
//! A [`SwarmPolicy`] is loaded once per process (from YAML or defaults) and
//! is read-only afterwards. Spawn bookkeeping lives in
//! [`SpawnGovernor`](capacity::SpawnGovernor), which consults the policy
//! before every spawn.
//!
//! ```yaml
//! limits:
//!   max_concurrent_agents: 100
//!   max_workers_per_dispatcher: 20
//! throttling:
//!   max_spawns_per_second: 10
//! retry:
//!   max_attempts: 3
//!   initial_delay_ms: 1000
//! ```

pub mod capacity;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::messages::AgentType;

pub use capacity::{SpawnDecision, SpawnDenial, SpawnGovernor, SpawnPermit};

/// Complete swarm policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SwarmPolicy {
    pub limits: GlobalLimits,
    pub agents: AgentLimits,
    pub throttling: ThrottlingPolicy,
    pub retry: RetryPolicy,
    pub autoscaling: AutoscalingThresholds,
    pub health: HealthThresholds,
}

impl SwarmPolicy {
    /// Parses a policy from YAML and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let policy: SwarmPolicy = serde_yaml::from_str(yaml)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Loads a policy file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let policy = Self::from_yaml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded swarm policy");
        Ok(policy)
    }

    /// Resource limits for one agent type.
    pub fn agent_limits(&self, agent_type: AgentType) -> &AgentResourceLimits {
        self.agents.for_agent(agent_type)
    }

    /// Rejects values that would make the swarm unable to run.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let limits = &self.limits;
        for (field, value) in [
            ("limits.max_concurrent_agents", limits.max_concurrent_agents),
            ("limits.max_agents_per_project", limits.max_agents_per_project),
            ("limits.max_workers_per_dispatcher", limits.max_workers_per_dispatcher),
            ("limits.max_dispatchers_per_project", limits.max_dispatchers_per_project),
            ("limits.max_queue_depth", limits.max_queue_depth),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }

        if limits.max_agents_per_project > limits.max_concurrent_agents {
            return Err(invalid(
                "limits.max_agents_per_project",
                "cannot exceed max_concurrent_agents",
            ));
        }

        for agent_type in [
            AgentType::CodeUnitDispatcher,
            AgentType::FunctionWorker,
            AgentType::Builder,
        ] {
            let agent = self.agent_limits(agent_type);
            if agent.max_tokens == 0 {
                return Err(invalid(
                    &format!("agents.{}.max_tokens", agent_type),
                    "must be greater than 0",
                ));
            }
            if agent.max_cost_per_execution <= 0.0 {
                return Err(invalid(
                    &format!("agents.{}.max_cost_per_execution", agent_type),
                    "must be positive",
                ));
            }
            if agent.timeout_secs == 0 {
                return Err(invalid(
                    &format!("agents.{}.timeout_secs", agent_type),
                    "must be greater than 0",
                ));
            }
        }

        let throttling = &self.throttling;
        if throttling.enabled
            && (throttling.max_spawns_per_second == 0 || throttling.max_spawns_per_minute == 0)
        {
            return Err(invalid(
                "throttling",
                "spawn rates must be greater than 0 when throttling is enabled",
            ));
        }

        let retry = &self.retry;
        if retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                "cannot be less than initial_delay_ms",
            ));
        }

        let scaling = &self.autoscaling;
        if scaling.scale_down_queue_depth >= scaling.scale_up_queue_depth {
            return Err(invalid(
                "autoscaling.scale_down_queue_depth",
                "must be less than scale_up_queue_depth",
            ));
        }
        if scaling.min_workers > scaling.max_workers {
            return Err(invalid(
                "autoscaling.min_workers",
                "cannot exceed max_workers",
            ));
        }

        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(invalid(
                "health.min_success_rate",
                "must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }

    pub fn with_limits(mut self, limits: GlobalLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_throttling(mut self, throttling: ThrottlingPolicy) -> Self {
        self.throttling = throttling;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn invalid(field: &str, reason: &str) -> PolicyError {
    PolicyError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Concurrency ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLimits {
    pub max_concurrent_agents: usize,
    pub max_agents_per_project: usize,
    pub max_workers_per_dispatcher: usize,
    pub max_dispatchers_per_project: usize,
    pub max_queue_depth: usize,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 100,
            max_agents_per_project: 50,
            max_workers_per_dispatcher: 20,
            max_dispatchers_per_project: 10,
            max_queue_depth: 10_000,
        }
    }
}

/// Per-execution limits for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentResourceLimits {
    pub max_tokens: u32,
    /// Dollars.
    pub max_cost_per_execution: f64,
    pub timeout_secs: u64,
}

impl AgentResourceLimits {
    pub fn new(max_tokens: u32, max_cost_per_execution: f64, timeout: Duration) -> Self {
        Self {
            max_tokens,
            max_cost_per_execution,
            timeout_secs: timeout.as_secs().max(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AgentResourceLimits {
    fn default() -> Self {
        Self::new(4_000, 0.50, Duration::from_secs(600))
    }
}

/// Resource limits keyed by agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub code_unit_dispatcher: AgentResourceLimits,
    pub function_worker: AgentResourceLimits,
    pub builder: AgentResourceLimits,
}

impl AgentLimits {
    pub fn for_agent(&self, agent_type: AgentType) -> &AgentResourceLimits {
        match agent_type {
            AgentType::CodeUnitDispatcher => &self.code_unit_dispatcher,
            AgentType::FunctionWorker => &self.function_worker,
            AgentType::Builder => &self.builder,
        }
    }
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            code_unit_dispatcher: AgentResourceLimits::new(8_000, 1.00, Duration::from_secs(1_800)),
            function_worker: AgentResourceLimits::new(4_000, 0.50, Duration::from_secs(600)),
            builder: AgentResourceLimits::new(8_000, 2.00, Duration::from_secs(900)),
        }
    }
}

/// Spawn rate limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingPolicy {
    pub enabled: bool,
    pub max_spawns_per_second: u32,
    pub max_spawns_per_minute: u32,
    pub min_spawn_interval_ms: u64,
}

impl ThrottlingPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn min_spawn_interval(&self) -> Duration {
        Duration::from_millis(self.min_spawn_interval_ms)
    }
}

impl Default for ThrottlingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_spawns_per_second: 10,
            max_spawns_per_minute: 300,
            min_spawn_interval_ms: 50,
        }
    }
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Error categories worth retrying; `None` retries everything.
    pub retryable_errors: Option<Vec<String>>,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based), capped at the max delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn is_retryable(&self, category: &str) -> bool {
        match &self.retryable_errors {
            None => true,
            Some(allowed) => allowed.iter().any(|c| c.eq_ignore_ascii_case(category)),
        }
    }

    pub fn should_retry(&self, attempts_made: u32, category: &str) -> bool {
        attempts_made < self.max_attempts && self.is_retryable(category)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            retryable_errors: None,
        }
    }
}

/// Advisory scaling signal for an external scaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAdvice {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Queue-depth based autoscaling thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingThresholds {
    pub scale_up_queue_depth: usize,
    pub scale_down_queue_depth: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl AutoscalingThresholds {
    pub fn recommend(&self, queue_depth: usize, current_workers: usize) -> ScalingAdvice {
        if current_workers < self.min_workers {
            return ScalingAdvice::ScaleUp;
        }
        if current_workers > self.max_workers {
            return ScalingAdvice::ScaleDown;
        }
        if queue_depth >= self.scale_up_queue_depth && current_workers < self.max_workers {
            ScalingAdvice::ScaleUp
        } else if queue_depth <= self.scale_down_queue_depth && current_workers > self.min_workers {
            ScalingAdvice::ScaleDown
        } else {
            ScalingAdvice::Hold
        }
    }
}

impl Default for AutoscalingThresholds {
    fn default() -> Self {
        Self {
            scale_up_queue_depth: 100,
            scale_down_queue_depth: 10,
            min_workers: 1,
            max_workers: 50,
        }
    }
}

/// Health floor for agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub min_success_rate: f64,
    pub heartbeat_timeout_secs: u64,
}

impl HealthThresholds {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn is_healthy(&self, success_rate: f64, last_heartbeat_age: Duration) -> bool {
        success_rate >= self.min_success_rate && last_heartbeat_age <= self.heartbeat_timeout()
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            heartbeat_timeout_secs: 60,
        }
    }
}
