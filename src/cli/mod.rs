//! Command-line interface for swarm-dispatch.
//!
//! Provides commands for dispatching code units, running workers and the
//! dispatcher service, and managing queues.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, StoreKind};
