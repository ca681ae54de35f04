//! swarm-dispatch: fan code units out to function workers over durable
//! priority queues.
//!
//! A code-unit dispatcher splits one class or module into per-function
//! assignments, governs how fast and how many may be in flight, and waits for
//! their completions before notifying the build step. Function workers run
//! each assignment through analyze, design, implement and validate stages.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod llm;
pub mod messages;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod utils;
pub mod worker;

// Re-export commonly used error types
pub use error::{AgentError, DispatchError, LlmError, PolicyError, QueueError};
