//! Long-running consumer of code-unit assignments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::build_errors::BuildErrorForwarder;
use super::classifier::{KeywordClassifier, WorkClassifier};
use super::code_unit::{CodeUnitDispatcher, DispatcherConfig};
use crate::error::DispatchError;
use crate::messages::CodeUnitAssignment;
use crate::policy::SpawnGovernor;
use crate::queue::{names, MessageQueue, QueueItem};

/// Settings for [`DispatcherService`].
#[derive(Debug, Clone)]
pub struct DispatcherServiceConfig {
    /// Dispatches allowed to run at once in this process.
    pub max_concurrent: usize,
    pub queue_name: String,
    pub receive_timeout: Duration,
    pub dispatcher: DispatcherConfig,
    /// Build failures to turn into bug-fix code units; `None` disables forwarding.
    pub build_error_queue: Option<String>,
}

impl Default for DispatcherServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_name: names::CODE_UNIT_ASSIGNMENTS.to_string(),
            receive_timeout: Duration::from_secs(1),
            dispatcher: DispatcherConfig::default(),
            build_error_queue: Some(names::BUILDER_ERRORS.to_string()),
        }
    }
}

impl DispatcherServiceConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_build_error_queue(mut self, queue: Option<String>) -> Self {
        self.build_error_queue = queue;
        self
    }
}

/// Counters for a service run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Assignments returned to the queue or dead-lettered without a dispatch.
    pub rejected: u64,
    /// Build errors requeued as bug-fix code units.
    pub build_errors_forwarded: u64,
}

#[derive(Default)]
struct SharedServiceStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    build_errors_forwarded: AtomicU64,
}

impl SharedServiceStats {
    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            received: self.received.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            build_errors_forwarded: self.build_errors_forwarded.load(Ordering::SeqCst),
        }
    }
}

/// Pulls [`CodeUnitAssignment`]s and dispatches them with bounded
/// concurrency until cancelled.
pub struct DispatcherService {
    queue: Arc<MessageQueue>,
    governor: SpawnGovernor,
    classifier: Arc<dyn WorkClassifier>,
    config: DispatcherServiceConfig,
    stats: Arc<SharedServiceStats>,
}

impl DispatcherService {
    pub fn new(queue: Arc<MessageQueue>, governor: SpawnGovernor, config: DispatcherServiceConfig) -> Self {
        Self {
            queue,
            governor,
            classifier: Arc::new(KeywordClassifier::default()),
            config,
            stats: Arc::new(SharedServiceStats::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn WorkClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats.snapshot()
    }

    /// Runs until `cancel` fires, then waits for in-flight dispatches.
    ///
    /// In-flight dispatches observe the same token, so they stop monitoring
    /// and notify promptly. Build errors are forwarded alongside, feeding
    /// bug-fix code units back into the assignment queue.
    pub async fn run(&self, cancel: CancellationToken) -> ServiceStats {
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        let mut next_dispatcher = 0u64;

        let forwarder = self.config.build_error_queue.clone().map(|source| {
            let forwarder = BuildErrorForwarder::new(Arc::clone(&self.queue))
                .with_source(source)
                .with_target(self.config.queue_name.clone())
                .with_receive_timeout(self.config.receive_timeout);
            let stats = Arc::clone(&self.stats);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let forwarded = forwarder.run(cancel).await;
                stats.build_errors_forwarded.fetch_add(forwarded, Ordering::SeqCst);
            })
        });

        info!(
            queue = %self.config.queue_name,
            max_concurrent = self.config.max_concurrent,
            "Dispatcher service started"
        );

        loop {
            let slot = tokio::select! {
                _ = cancel.cancelled() => break,
                slot = Arc::clone(&slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            // Reap finished dispatches so the set does not grow unbounded.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Dispatch task panicked");
                }
            }

            let received = self
                .queue
                .receive_blocking::<CodeUnitAssignment>(
                    &self.config.queue_name,
                    self.config.receive_timeout,
                    &cancel,
                )
                .await;

            let item = match received {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to receive code-unit assignment, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                    }
                    continue;
                }
            };
            self.stats.received.fetch_add(1, Ordering::SeqCst);

            next_dispatcher += 1;
            let dispatcher = CodeUnitDispatcher::new(
                format!("dispatcher-{}", next_dispatcher),
                Arc::clone(&self.queue),
                self.governor.clone(),
            )
            .with_classifier(Arc::clone(&self.classifier))
            .with_config(self.config.dispatcher.clone());

            let queue = Arc::clone(&self.queue);
            let stats = Arc::clone(&self.stats);
            let retry_delay = self.governor.policy().retry.delay_for_attempt(0);
            let task_cancel = cancel.clone();
            tasks.spawn(async move {
                let _slot = slot;
                run_dispatch(dispatcher, queue, item, stats, retry_delay, task_cancel).await;
            });
        }

        info!(in_flight = tasks.len(), "Dispatcher service stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch task panicked");
            }
        }
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                error!(error = %e, "Build error forwarder panicked");
            }
        }
        self.stats()
    }
}

async fn run_dispatch(
    dispatcher: CodeUnitDispatcher,
    queue: Arc<MessageQueue>,
    item: QueueItem<CodeUnitAssignment>,
    stats: Arc<SharedServiceStats>,
    retry_delay: Duration,
    cancel: CancellationToken,
) {
    match dispatcher.dispatch(item.data.clone(), &cancel).await {
        Ok(outcome) => {
            if outcome.success {
                stats.succeeded.fetch_add(1, Ordering::SeqCst);
            } else {
                stats.failed.fetch_add(1, Ordering::SeqCst);
            }
            if let Err(e) = queue.acknowledge(&item).await {
                warn!(id = %item.id, error = %e, "Failed to acknowledge code-unit assignment");
            }
        }
        Err(e) => {
            stats.rejected.fetch_add(1, Ordering::SeqCst);
            let requeue = !matches!(e, DispatchError::InvalidAssignment(_));
            if matches!(e, DispatchError::CapacityDenied(_)) {
                // Give other dispatches a chance to finish before retrying.
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            warn!(
                code_unit_assignment_id = %item.data.assignment_id,
                requeue,
                error = %e,
                "Dispatch rejected"
            );
            let reason = e.to_string();
            if let Err(reject_err) = queue.reject(item, requeue, &reason).await {
                error!(error = %reject_err, "Failed to reject code-unit assignment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BuilderError, BuilderNotification, FunctionAssignment};
    use crate::policy::SwarmPolicy;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_service_dispatches_until_cancelled() {
        let queue = Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)));
        let governor = SpawnGovernor::new(Arc::new(SwarmPolicy::default()));
        let config = DispatcherServiceConfig::default()
            .with_receive_timeout(Duration::from_millis(20))
            .with_dispatcher(DispatcherConfig::default().with_monitor_timeout(Duration::from_millis(50)));
        let service = Arc::new(DispatcherService::new(queue.clone(), governor, config));

        let unit = CodeUnitAssignment::new("proj", "Greeter", vec![FunctionAssignment::new("s1", "Greet", "")]);
        queue
            .send_priority(names::CODE_UNIT_ASSIGNMENTS, &unit, 5, None)
            .await
            .expect("send should work");

        let cancel = CancellationToken::new();
        let runner = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };

        let never = CancellationToken::new();
        let notification = queue
            .receive_blocking::<BuilderNotification>(names::BUILDER_NOTIFICATIONS, Duration::from_secs(5), &never)
            .await
            .expect("receive should work")
            .expect("notification should arrive");
        assert_eq!(notification.data.code_unit_name, "Greeter");
        assert!(notification.data.timed_out);

        cancel.cancel();
        let stats = runner.await.expect("service task should join");
        assert_eq!(stats.received, 1);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_invalid_assignment_is_dead_lettered() {
        let queue = Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)));
        let governor = SpawnGovernor::new(Arc::new(SwarmPolicy::default()));
        let dispatcher = CodeUnitDispatcher::new("d", queue.clone(), governor);

        let unit = CodeUnitAssignment::new("proj", "", Vec::new());
        queue
            .send_priority(names::CODE_UNIT_ASSIGNMENTS, &unit, 5, None)
            .await
            .expect("send should work");
        let item = queue
            .receive::<CodeUnitAssignment>(names::CODE_UNIT_ASSIGNMENTS)
            .await
            .expect("receive should work")
            .expect("item should be queued");

        let stats = Arc::new(SharedServiceStats::default());
        run_dispatch(dispatcher, queue.clone(), item, stats.clone(), Duration::ZERO, CancellationToken::new()).await;

        assert_eq!(stats.snapshot().rejected, 1);
        let queue_stats = queue.stats(names::CODE_UNIT_ASSIGNMENTS).await.expect("stats should work");
        assert_eq!(queue_stats.dead_letter_depth, 1);
        assert_eq!(queue_stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_builder_error_is_dispatched_as_bug_fix() {
        let queue = Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)));
        let governor = SpawnGovernor::new(Arc::new(SwarmPolicy::default()));
        let config = DispatcherServiceConfig::default()
            .with_receive_timeout(Duration::from_millis(20))
            .with_dispatcher(DispatcherConfig::default().with_monitor_timeout(Duration::from_millis(50)));
        let service = Arc::new(DispatcherService::new(queue.clone(), governor, config));

        let failed_dispatch = Uuid::new_v4();
        let report: BuilderError = serde_json::from_value(serde_json::json!({
            "projectId": "proj",
            "codeUnitAssignmentId": failed_dispatch,
            "codeUnitName": "Calculator",
            "errorMessage": "error[E0308]: mismatched types",
        }))
        .expect("report should deserialize");
        queue
            .send(names::BUILDER_ERRORS, &report, None)
            .await
            .expect("send should work");

        let cancel = CancellationToken::new();
        let runner = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };

        let never = CancellationToken::new();
        let fix = queue
            .receive_blocking::<FunctionAssignment>(names::FUNCTION_ASSIGNMENTS, Duration::from_secs(5), &never)
            .await
            .expect("receive should work")
            .expect("bug fix should be assigned");
        assert!(fix.data.is_bug_fix);
        assert_eq!(fix.data.code_unit_name, "Calculator");
        assert!(fix.data.description.contains("E0308"));

        let notification = queue
            .receive_blocking::<BuilderNotification>(names::BUILDER_NOTIFICATIONS, Duration::from_secs(5), &never)
            .await
            .expect("receive should work")
            .expect("bug-fix dispatch should notify");
        assert_ne!(notification.data.code_unit_assignment_id, failed_dispatch);
        assert_eq!(notification.data.spawned_functions, 1);

        cancel.cancel();
        let stats = runner.await.expect("service task should join");
        assert_eq!(stats.build_errors_forwarded, 1);
        assert_eq!(stats.received, 1);
        let errors = queue.stats(names::BUILDER_ERRORS).await.expect("stats should work");
        assert_eq!(errors.pending(), 0);
    }
}
