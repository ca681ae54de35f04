//! Wire messages exchanged between swarm agents.
//!
//! All messages serialize to camelCase JSON and travel inside a
//! [`QueueItem`](crate::queue::QueueItem) envelope.

pub mod assignment;
pub mod builder;
pub mod completion;

pub use assignment::{
    CodeUnitAssignment, FunctionAssignment, PriorityLevel, WorkType, BUG_FIX_COMPLEXITY,
    MAX_COMPLEXITY,
};
pub use builder::{BuilderError, BuilderNotification, SpawnRequest, WorkloadDistribution};
pub use completion::{AgentType, CompletionMessage, FunctionArtifact};
