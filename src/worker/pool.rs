//! Pool of function workers consuming the function assignment queue.
//!
//! Each worker runs as an independent task that pulls one
//! [`FunctionAssignment`] at a time, runs it under the policy timeout and
//! acknowledges it. Assignments whose completion could not be emitted are
//! rejected back to the queue until their retry budget runs out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::agent::instrumented;
use super::function_worker::FunctionWorker;
use crate::error::AgentError;
use crate::llm::GenerationService;
use crate::messages::FunctionAssignment;
use crate::metrics::MetricsCollector;
use crate::policy::AgentResourceLimits;
use crate::queue::{names, MessageQueue, QueueItem};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub queue_name: String,
    /// How long one blocking receive waits before re-checking shutdown.
    pub receive_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_name: names::FUNCTION_ASSIGNMENTS.to_string(),
            receive_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    pub active_workers: usize,
    pub assignments_completed: u64,
    pub assignments_failed: u64,
    pub average_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.assignments_completed + self.assignments_failed
    }

    /// Success rate as a fraction in `0.0..=1.0`.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        self.assignments_completed as f64 / total as f64
    }
}

#[derive(Default)]
struct SharedPoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active.load(Ordering::SeqCst) as usize,
            assignments_completed: completed,
            assignments_failed: failed,
            average_duration,
        }
    }
}

/// A pool of [`FunctionWorker`]s sharing one generation service.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<MessageQueue>,
    generator: Arc<dyn GenerationService>,
    limits: AgentResourceLimits,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<MessageQueue>,
        generator: Arc<dyn GenerationService>,
        limits: AgentResourceLimits,
    ) -> Self {
        Self {
            config,
            queue,
            generator,
            limits,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        for i in 0..self.config.num_workers {
            let runner = PoolWorker {
                worker: FunctionWorker::new(
                    format!("function-worker-{}", i),
                    Arc::clone(&self.generator),
                    Arc::clone(&self.queue),
                    self.limits.clone(),
                ),
                queue: Arc::clone(&self.queue),
                queue_name: self.config.queue_name.clone(),
                receive_timeout: self.config.receive_timeout,
                cancel: self.cancel.child_token(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };
            self.handles.push(tokio::spawn(runner.run()));
        }

        info!(
            num_workers = self.config.num_workers,
            queue = %self.config.queue_name,
            "Worker pool started"
        );
        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight assignments.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers do not stop within
    /// the configured timeout; they are aborted in that case.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.cancel.cancel();

        let mut handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let wait_all = async {
            for joined in futures::future::join_all(handles.iter_mut()).await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, wait_all).await;
        self.is_running.store(false, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                for handle in &handles {
                    handle.abort();
                }
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Token that stops the pool when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

struct PoolWorker {
    worker: FunctionWorker,
    queue: Arc<MessageQueue>,
    queue_name: String,
    receive_timeout: Duration,
    cancel: CancellationToken,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl PoolWorker {
    async fn run(self) {
        let worker_id = self.worker_id().to_string();
        info!(worker_id = %worker_id, "Worker started");

        while !self.cancel.is_cancelled() {
            let received = self
                .queue
                .receive_blocking::<FunctionAssignment>(
                    &self.queue_name,
                    self.receive_timeout,
                    &self.cancel,
                )
                .await;

            match received {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => debug!(worker_id = %worker_id, "No assignments available"),
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Failed to receive assignment");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                    }
                }
            }
        }

        info!(worker_id = %worker_id, "Worker stopped");
    }

    fn worker_id(&self) -> &str {
        use super::agent::Agent;
        self.worker.id()
    }

    async fn process(&self, item: QueueItem<FunctionAssignment>) {
        let start = Instant::now();
        let assignment = item.data.clone();
        let timeout = self.worker.limits().timeout();

        self.stats.active.fetch_add(1, Ordering::SeqCst);
        self.metrics.worker_started();
        let result = instrumented(&self.worker, assignment.clone(), timeout).await;
        self.metrics.worker_finished();
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        let duration = start.elapsed();

        match result {
            Ok(result) => {
                if result.success {
                    self.stats.record_completion(duration);
                } else {
                    self.stats.record_failure(duration);
                }
                self.acknowledge(&item).await;
            }
            Err(AgentError::Timeout(after)) => {
                self.stats.record_failure(duration);
                let reason = format!("function worker timed out after {:?}", after);
                if let Err(e) = self.worker.report_failure(&assignment, &reason).await {
                    error!(
                        worker_id = %self.worker_id(),
                        assignment_id = %assignment.assignment_id,
                        error = %e,
                        "Failed to report timeout"
                    );
                }
                self.acknowledge(&item).await;
            }
            Err(e) => {
                self.stats.record_failure(duration);
                warn!(
                    worker_id = %self.worker_id(),
                    assignment_id = %assignment.assignment_id,
                    remaining_retries = item.max_retries,
                    error = %e,
                    "Assignment failed, rejecting"
                );
                if let Err(reject_err) = self.queue.reject(item, true, &e.to_string()).await {
                    error!(
                        worker_id = %self.worker_id(),
                        assignment_id = %assignment.assignment_id,
                        error = %reject_err,
                        "Failed to reject assignment"
                    );
                }
            }
        }
    }

    async fn acknowledge(&self, item: &QueueItem<FunctionAssignment>) {
        if let Err(e) = self.queue.acknowledge(item).await {
            warn!(
                worker_id = %self.worker_id(),
                id = %item.id,
                error = %e,
                "Failed to acknowledge assignment"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::GenerationOutput;
    use crate::messages::CompletionMessage;
    use async_trait::async_trait;

    struct EchoGenerator;

    #[async_trait]
    impl GenerationService for EchoGenerator {
        async fn generate(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _max_tokens: u32,
            temperature: f64,
        ) -> Result<GenerationOutput, LlmError> {
            let text = if temperature > 0.35 {
                "analysis".to_string()
            } else {
                "```rust\nfn f() -> Result<(), E> { if true { Ok(()) } else { Err(E) } }\n```\n{\"passed\": true}"
                    .to_string()
            };
            Ok(GenerationOutput {
                text,
                model: "echo".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                cost: 0.0,
                duration: Duration::ZERO,
            })
        }
    }

    #[test]
    fn test_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_queue_name("custom")
            .with_receive_timeout(Duration::from_millis(250))
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_name, "custom");
        assert_eq!(config.receive_timeout, Duration::from_millis(250));
        assert_eq!(WorkerPoolConfig::default().queue_name, names::FUNCTION_ASSIGNMENTS);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = SharedPoolStats::default();
        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(6));

        let snapshot = stats.to_pool_stats(4);
        assert_eq!(snapshot.total_processed(), 3);
        assert_eq!(snapshot.average_duration, Duration::from_secs(12));
        assert!((snapshot.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_pool_processes_assignments_and_shuts_down() {
        let queue = Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)));
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(2).with_receive_timeout(Duration::from_millis(20)),
            queue.clone(),
            Arc::new(EchoGenerator),
            AgentResourceLimits::default(),
        );

        for name in ["Add", "Subtract", "Multiply"] {
            let assignment = FunctionAssignment::new(format!("spec-{name}"), name, "Calculator");
            queue
                .send_priority(names::FUNCTION_ASSIGNMENTS, &assignment, 5, None)
                .await
                .expect("send should work");
        }

        pool.start().expect("pool should start");
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        let mut completions = Vec::new();
        let cancel = CancellationToken::new();
        while completions.len() < 3 {
            let item = queue
                .receive_blocking::<CompletionMessage>(names::COMPLETIONS, Duration::from_secs(5), &cancel)
                .await
                .expect("receive should work")
                .expect("completion should arrive");
            completions.push(item.data);
        }
        assert!(completions.iter().all(|c| c.success));

        pool.shutdown().await.expect("shutdown should work");
        assert!(!pool.is_running());
        assert_eq!(pool.stats().assignments_completed, 3);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }
}
