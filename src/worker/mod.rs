//! Function workers and the pool that runs them.
//!
//! - **Agent**: the execute-one-input abstraction plus the `instrumented`
//!   wrapper that applies the policy timeout
//! - **FunctionWorker**: analyze, design, implement, validate
//! - **WorkerPool**: N workers consuming `swarm.function.assignments`

pub mod agent;
pub mod function_worker;
pub mod pool;
pub mod quality;
pub mod stage;

pub use agent::{instrumented, Agent};
pub use function_worker::{FunctionResult, FunctionWorker};
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use quality::{assess, QualityAssessment};
pub use stage::{Stage, StageOutput, ValidationReport};
