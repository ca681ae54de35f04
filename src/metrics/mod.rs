//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue traffic, spawn governance, completions, worker stage
//! latency, LLM spend and quality scores.
//!
//! # Example
//!
//! ```ignore
//! use swarm_dispatch::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_spawn_decision("spawned");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TokenUsage};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
