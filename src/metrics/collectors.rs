//! High-level facade for recording swarm metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! been called, so library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, COMPLETIONS_TOTAL, LLM_COST_CENTS, LLM_TOKENS_TOTAL, QUALITY_SCORE,
    QUEUE_DEPTH, QUEUE_OPERATIONS, SPAWN_DECISIONS, STAGE_DURATION,
};

/// Token usage information for LLM requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Number of input/prompt tokens.
    pub input_tokens: u64,
    /// Number of output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Get the total number of tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Metrics collector for recording swarm operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a queue operation (`sent`, `received`, `expired`, ...).
    pub fn record_queue_op(&self, queue: &str, operation: &str) {
        if let Some(ops) = QUEUE_OPERATIONS.get() {
            ops.with_label_values(&[queue, operation]).inc();
        }
    }

    /// Record the sampled depth of a queue.
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.with_label_values(&[queue]).set(depth as f64);
        }
    }

    /// Record a spawn decision outcome.
    pub fn record_spawn_decision(&self, outcome: &str) {
        if let Some(decisions) = SPAWN_DECISIONS.get() {
            decisions.with_label_values(&[outcome]).inc();
        }
        tracing::trace!(outcome = outcome, "Recorded spawn decision");
    }

    /// Record an observed completion message.
    pub fn record_completion(&self, worker_type: &str, success: bool) {
        if let Some(completions) = COMPLETIONS_TOTAL.get() {
            let status = if success { "success" } else { "failure" };
            completions.with_label_values(&[worker_type, status]).inc();
        }
    }

    /// Record one pipeline stage execution.
    pub fn record_stage(&self, stage: &str, success: bool, duration_secs: f64) {
        if let Some(histogram) = STAGE_DURATION.get() {
            let status = if success { "success" } else { "failure" };
            histogram
                .with_label_values(&[stage, status])
                .observe(duration_secs);
        }
    }

    /// Record LLM token usage and cost.
    pub fn record_llm_usage(&self, model: &str, tokens: TokenUsage, cost_cents: f64) {
        if let Some(counter) = LLM_TOKENS_TOTAL.get() {
            counter
                .with_label_values(&[model, "input"])
                .inc_by(tokens.input_tokens as f64);
            counter
                .with_label_values(&[model, "output"])
                .inc_by(tokens.output_tokens as f64);
        }
        if let Some(cost) = LLM_COST_CENTS.get() {
            cost.with_label_values(&[model]).inc_by(cost_cents.max(0.0));
        }
    }

    /// Record a function worker quality score.
    pub fn record_quality_score(&self, score: f64) {
        if let Some(histogram) = QUALITY_SCORE.get() {
            histogram.observe(score);
        }
    }

    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_finished(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_token_usage() {
        let mut usage = TokenUsage::new(100, 50);
        usage += TokenUsage::new(10, 5);
        assert_eq!(usage.input_tokens, 110);
        assert_eq!(usage.output_tokens, 55);
        assert_eq!(usage.total(), 165);
    }

    #[test]
    fn test_collector_records_after_init() {
        init_metrics().expect("metrics should initialize");
        let collector = MetricsCollector::new();

        collector.record_spawn_decision("spawned");
        collector.record_completion("function_worker", true);
        collector.record_stage("implement", true, 1.5);
        collector.record_llm_usage("test-model", TokenUsage::new(10, 20), 0.3);
        collector.record_quality_score(0.8);
        collector.worker_started();
        collector.worker_finished();

        let text = export_metrics();
        assert!(text.contains("swarm_spawn_decisions_total"));
        assert!(text.contains("swarm_stage_duration_seconds"));
    }
}
