//! Error types for swarm dispatch operations.
//!
//! Defines the error types for the major subsystems:
//! - Queue store and backing key-value store
//! - Swarm policy loading and validation
//! - LLM API interactions
//! - Agent execution (function workers, dispatchers)

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during queue operations.
///
/// Queue errors are always returned as values so that long-running
/// consumers can log a bad message and keep going.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached or rejected the command.
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    /// The payload is still over budget after truncation.
    #[error("Message for queue '{queue}' is {size} bytes, limit is {limit} bytes")]
    MessageTooLarge {
        queue: String,
        size: usize,
        limit: usize,
    },

    /// A priority send was attempted on a FIFO-only queue.
    #[error("Priority is not enabled for queue '{0}'")]
    PriorityNotEnabled(String),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored queue configuration could not be used.
    #[error("Invalid configuration for queue '{queue}': {reason}")]
    InvalidConfiguration { queue: String, reason: String },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Errors that can occur while loading or validating a swarm policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid policy value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP client construction failed: {0}")]
    ClientBuild(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Retry category for failures that may succeed on a later attempt.
    ///
    /// Matched against `RetryPolicy::retryable_errors`; `None` means the
    /// failure is permanent.
    pub fn transient_category(&self) -> Option<&'static str> {
        match self {
            LlmError::RateLimited(_) => Some("rate_limited"),
            LlmError::RequestFailed(_) => Some("transport"),
            LlmError::ApiError { code, .. } if *code >= 500 => Some("server_error"),
            _ => None,
        }
    }
}

/// Errors that can occur while an agent executes.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A pipeline stage failed; the remaining stages were not run.
    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed { stage: String, reason: String },

    /// Cumulative spend crossed the agent type's per-execution ceiling.
    #[error("Cost ceiling exceeded at stage '{stage}': ${spent:.4} > ${limit:.4}")]
    CostCeilingExceeded {
        stage: String,
        spent: f64,
        limit: f64,
    },

    /// The agent did not finish within its policy timeout.
    #[error("Agent operation timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying queue failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Underlying LLM failure outside a stage.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that stop a code-unit dispatch before it produces an outcome.
///
/// Anything that goes wrong after spawning has started is reported through
/// the outcome counts instead, so a dispatch that spawned work always
/// notifies the build step.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The assignment cannot be dispatched as given.
    #[error("Invalid code-unit assignment: {0}")]
    InvalidAssignment(String),

    /// No dispatcher slot is available for the project.
    #[error("Dispatcher capacity denied: {0}")]
    CapacityDenied(String),

    /// Underlying queue failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Cancelled before any work was spawned.
    #[error("Dispatch cancelled")]
    Cancelled,
}
