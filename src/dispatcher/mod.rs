//! Code-unit dispatching.
//!
//! A [`CodeUnitDispatcher`] turns one [`CodeUnitAssignment`](crate::messages::CodeUnitAssignment)
//! into function assignments, waits for their completions on a dedicated
//! completion queue and notifies the build step exactly once.
//! [`DispatcherService`] runs dispatchers off the code-unit assignment queue
//! and, through [`BuildErrorForwarder`], turns reported build failures into
//! bug-fix code units on that same queue.

pub mod backlog;
pub mod build_errors;
pub mod classifier;
pub mod code_unit;
pub mod monitor;
pub mod service;

pub use backlog::{BacklogEntry, SpawnBacklog};
pub use build_errors::BuildErrorForwarder;
pub use classifier::{KeywordClassifier, WorkClassifier};
pub use code_unit::{CodeUnitDispatcher, DispatchOutcome, DispatcherConfig, SpawnReport};
pub use monitor::CompletionMonitor;
pub use service::{DispatcherService, DispatcherServiceConfig, ServiceStats};
