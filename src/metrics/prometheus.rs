//! Swarm metrics in a process-wide Prometheus registry.
//!
//! Every metric lives in a `OnceLock` static filled by [`init_metrics`];
//! until then recording is a no-op and [`export_metrics`] returns a comment.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all swarm metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Queue operations, labeled by queue name and operation.
pub static QUEUE_OPERATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Pending messages per queue, sampled on send.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Spawn decisions, labeled by outcome (spawned, throttled, denied, deferred).
pub static SPAWN_DECISIONS: OnceLock<CounterVec> = OnceLock::new();

/// Completion messages observed, labeled by worker type and status.
pub static COMPLETIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Worker pipeline stage latency in seconds, labeled by stage and status.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total tokens used, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM API costs in cents, labeled by model.
pub static LLM_COST_CENTS: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of function worker quality scores.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Number of function workers currently executing.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let queue_operations = CounterVec::new(
        Opts::new("swarm_queue_operations_total", "Queue operations"),
        &["queue", "operation"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("swarm_queue_depth", "Pending messages per queue"),
        &["queue"],
    )?;

    let spawn_decisions = CounterVec::new(
        Opts::new("swarm_spawn_decisions_total", "Spawn decisions by outcome"),
        &["outcome"],
    )?;

    let completions_total = CounterVec::new(
        Opts::new("swarm_completions_total", "Completion messages observed"),
        &["worker_type", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "swarm_stage_duration_seconds",
            "Function worker stage latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["stage", "status"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("swarm_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let llm_cost_cents = CounterVec::new(
        Opts::new("swarm_llm_cost_cents", "LLM API costs in cents"),
        &["model"],
    )?;

    let quality_score = Histogram::with_opts(
        HistogramOpts::new("swarm_quality_score", "Distribution of quality scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let active_workers = Gauge::new("swarm_active_workers", "Number of active function workers")?;

    registry.register(Box::new(queue_operations.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(spawn_decisions.clone()))?;
    registry.register(Box::new(completions_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(llm_cost_cents.clone()))?;
    registry.register(Box::new(quality_score.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = QUEUE_OPERATIONS.set(queue_operations);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = SPAWN_DECISIONS.set(spawn_decisions);
    let _ = COMPLETIONS_TOTAL.set(completions_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = LLM_COST_CENTS.set(llm_cost_cents);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(ops) = QUEUE_OPERATIONS.get() {
            ops.with_label_values(&["test.queue", "sent"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("swarm_queue_operations_total"));
    }
}
