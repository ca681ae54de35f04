//! Code-unit dispatcher: fan out, monitor, notify.
//!
//! One dispatch moves through three phases:
//!
//! ```text
//!   Spawning    classify each function, reserve capacity, enqueue it
//!   Monitoring  match completions against the spawned set, retry the
//!               backlog, react to build failures
//!   Notifying   send exactly one BuilderNotification
//! ```
//!
//! Functions that cannot get capacity are never dropped: they are retried
//! from a backlog with the policy's backoff and, once retries run out,
//! handed off as a [`SpawnRequest`] on `swarm.spawn.requests`. Bug fixes
//! for build failures seen while monitoring take the same path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backlog::SpawnBacklog;
use super::classifier::{KeywordClassifier, WorkClassifier};
use super::monitor::CompletionMonitor;
use crate::error::{AgentResult, DispatchError};
use crate::messages::{
    AgentType, BuilderNotification, CodeUnitAssignment, CompletionMessage, FunctionAssignment,
    SpawnRequest, WorkloadDistribution,
};
use crate::metrics::MetricsCollector;
use crate::policy::{SpawnDenial, SpawnGovernor, SpawnPermit};
use crate::queue::{completion_queue_for, names, MessageQueue};
use crate::worker::Agent;

/// Dispatcher settings that are not part of the swarm policy.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on monitoring; the policy timeout also applies.
    pub monitor_timeout: Duration,
    /// Queue function assignments are sent to.
    pub function_queue: String,
    /// Completions buffered between the monitor task and the dispatcher.
    pub completion_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            monitor_timeout: Duration::from_secs(30 * 60),
            function_queue: names::FUNCTION_ASSIGNMENTS.to_string(),
            completion_buffer: 64,
        }
    }
}

impl DispatcherConfig {
    pub fn with_monitor_timeout(mut self, timeout: Duration) -> Self {
        self.monitor_timeout = timeout;
        self
    }
}

/// What one dispatch did.
///
/// `success` only reflects whether the builder notification was sent;
/// partial spawning and unfinished functions show up in the counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub code_unit_assignment_id: Uuid,
    pub code_unit_name: String,
    /// Functions in the code unit.
    pub total: usize,
    /// Function assignments enqueued.
    pub spawned: usize,
    /// Functions handed off as spawn requests.
    pub deferred: usize,
    /// Completions observed for spawned functions.
    pub completed: usize,
    /// Observed completions that reported failure.
    pub failed: usize,
    /// Functions lost to queue errors while sending.
    pub send_failures: usize,
    /// Bug-fix assignments sent in response to build failures.
    pub bug_fixes: usize,
    /// Bug fixes handed off as spawn requests for lack of capacity.
    #[serde(default)]
    pub bug_fixes_deferred: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub notification_sent: bool,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl DispatchOutcome {
    fn new(assignment: &CodeUnitAssignment) -> Self {
        Self::empty(
            assignment.assignment_id,
            &assignment.code_unit_name,
            assignment.function_count(),
        )
    }

    fn empty(code_unit_assignment_id: Uuid, code_unit_name: &str, total: usize) -> Self {
        Self {
            code_unit_assignment_id,
            code_unit_name: code_unit_name.to_string(),
            total,
            spawned: 0,
            deferred: 0,
            completed: 0,
            failed: 0,
            send_failures: 0,
            bug_fixes: 0,
            bug_fixes_deferred: 0,
            timed_out: false,
            cancelled: false,
            notification_sent: false,
            success: false,
            error: None,
            duration_ms: 0,
        }
    }

    /// Outcome for a dispatch that never started.
    pub fn rejected(assignment_id: Uuid, code_unit_name: &str, total: usize, error: &DispatchError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::empty(assignment_id, code_unit_name, total)
        }
    }

    /// Spawned functions whose completion was never observed.
    pub fn unfinished(&self) -> usize {
        self.spawned.saturating_sub(self.completed)
    }

    pub fn all_completed(&self) -> bool {
        self.spawned == self.total && self.completed == self.total && self.failed == 0
    }
}

struct PendingFunction {
    function_name: String,
    bug_fix: bool,
    // Holds the worker slot until the completion is observed.
    _permit: SpawnPermit,
}

/// State produced by the spawning phase.
pub struct SpawnReport {
    completion_queue: String,
    pending: HashMap<Uuid, PendingFunction>,
    /// Functions listed in the code unit itself, bug fixes included.
    listed: HashSet<Uuid>,
    backlog: SpawnBacklog,
    distribution: WorkloadDistribution,
    spawned: usize,
    deferred: usize,
    bug_fixes: usize,
    bug_fixes_deferred: usize,
    send_failures: usize,
}

impl SpawnReport {
    fn new(assignment: &CodeUnitAssignment) -> Self {
        let mut distribution = WorkloadDistribution::new(
            assignment.assignment_id,
            &assignment.code_unit_name,
            &assignment.project_id,
        );
        distribution.total_functions = assignment.function_count();
        Self {
            completion_queue: completion_queue_for(&assignment.assignment_id.to_string()),
            pending: HashMap::new(),
            listed: assignment.functions.iter().map(|f| f.assignment_id).collect(),
            backlog: SpawnBacklog::new(),
            distribution,
            spawned: 0,
            deferred: 0,
            bug_fixes: 0,
            bug_fixes_deferred: 0,
            send_failures: 0,
        }
    }

    pub fn completion_queue(&self) -> &str {
        &self.completion_queue
    }

    /// Ids of spawned functions still awaiting completion.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.keys().copied().collect()
    }

    pub fn spawned(&self) -> usize {
        self.spawned
    }

    pub fn deferred(&self) -> usize {
        self.deferred
    }

    pub fn send_failures(&self) -> usize {
        self.send_failures
    }

    pub fn bug_fixes(&self) -> usize {
        self.bug_fixes
    }

    pub fn bug_fixes_deferred(&self) -> usize {
        self.bug_fixes_deferred
    }

    /// Functions waiting in the retry backlog.
    pub fn backlogged(&self) -> usize {
        self.backlog.len()
    }

    pub fn distribution(&self) -> &WorkloadDistribution {
        &self.distribution
    }

    /// Whether `function` was spawned in reaction to a build failure.
    fn is_reactive_fix(&self, function: &FunctionAssignment) -> bool {
        function.is_bug_fix && !self.listed.contains(&function.assignment_id)
    }

    fn is_settled(&self) -> bool {
        self.pending.is_empty() && self.backlog.is_empty()
    }
}

/// Fans one code-unit assignment out into function assignments.
pub struct CodeUnitDispatcher {
    id: String,
    queue: Arc<MessageQueue>,
    governor: SpawnGovernor,
    classifier: Arc<dyn WorkClassifier>,
    config: DispatcherConfig,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl CodeUnitDispatcher {
    pub fn new(id: impl Into<String>, queue: Arc<MessageQueue>, governor: SpawnGovernor) -> Self {
        Self {
            id: id.into(),
            queue,
            governor,
            classifier: Arc::new(KeywordClassifier::default()),
            config: DispatcherConfig::default(),
            cancel: CancellationToken::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn WorkClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Token observed by [`Agent::execute`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// How long monitoring may run before the dispatch gives up waiting.
    pub fn monitor_window(&self) -> Duration {
        let policy_timeout = self
            .governor
            .policy()
            .agent_limits(AgentType::CodeUnitDispatcher)
            .timeout();
        self.config.monitor_timeout.min(policy_timeout)
    }

    /// Runs one dispatch to completion.
    ///
    /// # Errors
    ///
    /// Fails only before any work is spawned: an invalid assignment, no
    /// dispatcher slot for the project, or cancellation. Every later problem
    /// is reported in the returned [`DispatchOutcome`].
    pub async fn dispatch(
        &self,
        assignment: CodeUnitAssignment,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        if assignment.code_unit_name.trim().is_empty() {
            return Err(DispatchError::InvalidAssignment(
                "code unit name is empty".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let _dispatcher_permit = self
            .governor
            .try_reserve(AgentType::CodeUnitDispatcher, &assignment.project_id, None)
            .map_err(|denial| DispatchError::CapacityDenied(denial.to_string()))?;

        info!(
            dispatcher_id = %self.id,
            code_unit_assignment_id = %assignment.assignment_id,
            code_unit = %assignment.code_unit_name,
            functions = assignment.function_count(),
            "Dispatch started"
        );

        let mut outcome = DispatchOutcome::new(&assignment);
        let monitor_cancel = cancel.child_token();
        let mut monitor = CompletionMonitor::spawn(
            Arc::clone(&self.queue),
            completion_queue_for(&assignment.assignment_id.to_string()),
            self.config.completion_buffer,
            monitor_cancel,
        );

        // Spawning
        let mut report = self.generate_and_send_assignments(&assignment, cancel).await;
        self.publish_distribution(&report).await;

        // Monitoring
        let deadline = started + self.monitor_window();
        self.monitor_completions(&assignment, &mut report, &mut monitor, deadline, cancel, &mut outcome)
            .await;
        monitor.stop().await;

        let reason = if outcome.cancelled {
            "dispatch cancelled"
        } else {
            "monitoring ended before capacity became available"
        };
        for entry in report.backlog.drain() {
            self.defer(entry.assignment, entry.retries, reason, &mut report).await;
        }
        if !report.pending.is_empty() {
            let unfinished: Vec<&str> = report
                .pending
                .values()
                .map(|p| p.function_name.as_str())
                .collect();
            warn!(
                dispatcher_id = %self.id,
                code_unit_assignment_id = %assignment.assignment_id,
                unfinished = ?unfinished,
                "Monitoring ended with functions still running"
            );
            report.pending.clear();
        }
        if let Err(e) = self.queue.delete_queue(&report.completion_queue).await {
            debug!(queue = %report.completion_queue, error = %e, "Failed to remove completion queue");
        }

        outcome.spawned = report.spawned;
        outcome.deferred = report.deferred;
        outcome.bug_fixes = report.bug_fixes;
        outcome.bug_fixes_deferred = report.bug_fixes_deferred;
        outcome.send_failures = report.send_failures;

        // Notifying
        self.notify_builder(&assignment, &mut outcome).await;

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .record_completion(AgentType::CodeUnitDispatcher.as_str(), outcome.success);
        info!(
            dispatcher_id = %self.id,
            code_unit_assignment_id = %assignment.assignment_id,
            total = outcome.total,
            spawned = outcome.spawned,
            deferred = outcome.deferred,
            completed = outcome.completed,
            failed = outcome.failed,
            timed_out = outcome.timed_out,
            success = outcome.success,
            "Dispatch finished"
        );
        Ok(outcome)
    }

    /// Spawning phase: sends one function assignment per function that gets
    /// capacity and schedules or defers the rest.
    ///
    /// The returned report holds a worker slot for every spawned function;
    /// dropping it releases them.
    pub async fn generate_and_send_assignments(
        &self,
        assignment: &CodeUnitAssignment,
        cancel: &CancellationToken,
    ) -> SpawnReport {
        let mut report = SpawnReport::new(assignment);

        for function in &assignment.functions {
            let function = self.prepare_function(assignment, function, &report.completion_queue);
            report.distribution.count(function.work_type);

            if cancel.is_cancelled() {
                self.defer(function, 0, "dispatch cancelled", &mut report).await;
                continue;
            }
            self.spawn_function(function, 0, &mut report, cancel).await;
        }

        report.distribution.spawned = report.spawned;
        report.distribution.deferred = report.deferred;
        info!(
            dispatcher_id = %self.id,
            code_unit_assignment_id = %assignment.assignment_id,
            spawned = report.spawned,
            backlogged = report.backlog.len(),
            deferred = report.deferred,
            "Function assignments sent"
        );
        report
    }

    fn prepare_function(
        &self,
        unit: &CodeUnitAssignment,
        function: &FunctionAssignment,
        completion_queue: &str,
    ) -> FunctionAssignment {
        let mut function = function.clone();
        function.code_unit_assignment_id = Some(unit.assignment_id);
        function.code_unit_name = unit.code_unit_name.clone();
        if function.project_id.is_empty() {
            function.project_id = unit.project_id.clone();
        }
        if function.due_at.is_none() {
            function.due_at = unit.due_at;
        }
        function.work_type = self.classifier.classify(&function);
        function.completion_queue = Some(completion_queue.to_string());
        function.assigned_at = Utc::now();
        function
    }

    /// Reserves a worker slot for `function` and enqueues it.
    ///
    /// Throttling is waited out in place; ceiling denials go to the backlog
    /// or, without retry budget, are deferred.
    async fn spawn_function(
        &self,
        function: FunctionAssignment,
        retries: u32,
        report: &mut SpawnReport,
        cancel: &CancellationToken,
    ) {
        loop {
            let reserved = self.governor.try_reserve(
                AgentType::FunctionWorker,
                &function.project_id,
                function.code_unit_assignment_id,
            );
            match reserved {
                Ok(permit) => {
                    self.send_function(function, permit, report).await;
                    return;
                }
                Err(SpawnDenial::Throttled { retry_after }) => {
                    debug!(
                        function = %function.function_name,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Spawn throttled, waiting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.defer(function, retries, "dispatch cancelled", report).await;
                            return;
                        }
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
                Err(denial) => {
                    let reason = denial.to_string();
                    let policy = Arc::clone(self.governor.policy());
                    match report
                        .backlog
                        .schedule(function, retries, denial, &policy.retry, Instant::now())
                    {
                        Ok(delay) => info!(
                            dispatcher_id = %self.id,
                            reason = %reason,
                            retry_in_ms = delay.as_millis() as u64,
                            "Spawn capacity denied, function backlogged"
                        ),
                        Err(function) => {
                            warn!(
                                dispatcher_id = %self.id,
                                function = %function.function_name,
                                reason = %reason,
                                "Spawn capacity denied, retries exhausted"
                            );
                            self.defer(function, retries, &reason, report).await;
                        }
                    }
                    return;
                }
            }
        }
    }

    async fn send_function(&self, function: FunctionAssignment, permit: SpawnPermit, report: &mut SpawnReport) {
        let sent = self
            .queue
            .send_priority(
                &self.config.function_queue,
                &function,
                function.queue_priority(),
                None,
            )
            .await;

        match sent {
            Ok(receipt) => {
                if receipt.truncated {
                    warn!(
                        function = %function.function_name,
                        original_bytes = receipt.original_size_bytes,
                        sent_bytes = receipt.size_bytes,
                        "Function assignment truncated to fit queue budget"
                    );
                }
                debug!(
                    function = %function.function_name,
                    assignment_id = %function.assignment_id,
                    work_type = %function.work_type,
                    "Function assignment sent"
                );
                let bug_fix = report.is_reactive_fix(&function);
                if bug_fix {
                    report.bug_fixes += 1;
                } else {
                    report.spawned += 1;
                }
                report.pending.insert(
                    function.assignment_id,
                    PendingFunction {
                        function_name: function.function_name,
                        bug_fix,
                        _permit: permit,
                    },
                );
            }
            Err(e) => {
                error!(
                    function = %function.function_name,
                    error = %e,
                    "Failed to send function assignment"
                );
                report.send_failures += 1;
            }
        }
    }

    /// Hands `function` to capacity planning as a spawn request.
    async fn defer(&self, function: FunctionAssignment, retries: u32, reason: &str, report: &mut SpawnReport) {
        let request = SpawnRequest::for_function(&function, reason, retries + 1);
        match self
            .queue
            .send_priority(names::SPAWN_REQUESTS, &request, function.queue_priority(), None)
            .await
        {
            Ok(_) => {
                self.metrics.record_spawn_decision("deferred");
                info!(
                    function = %function.function_name,
                    reason = reason,
                    "Function deferred to spawn requests"
                );
                if report.is_reactive_fix(&function) {
                    report.bug_fixes_deferred += 1;
                } else {
                    report.deferred += 1;
                }
            }
            Err(e) => {
                error!(
                    function = %function.function_name,
                    error = %e,
                    "Failed to defer function"
                );
                report.send_failures += 1;
            }
        }
    }

    async fn publish_distribution(&self, report: &SpawnReport) {
        let distribution = &report.distribution;
        if let Err(e) = self
            .queue
            .send_priority(names::WORKLOAD_DISTRIBUTION, distribution, 5, None)
            .await
        {
            warn!(
                code_unit_assignment_id = %distribution.code_unit_assignment_id,
                error = %e,
                "Failed to publish workload distribution"
            );
        }
    }

    /// Monitoring phase. Returns once every spawned function reported and
    /// the backlog is empty, at the deadline, or on cancellation.
    async fn monitor_completions(
        &self,
        assignment: &CodeUnitAssignment,
        report: &mut SpawnReport,
        monitor: &mut CompletionMonitor,
        deadline: Instant,
        cancel: &CancellationToken,
        outcome: &mut DispatchOutcome,
    ) {
        while !report.is_settled() {
            let next_retry = report.backlog.next_due();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(code_unit_assignment_id = %assignment.assignment_id, "Monitoring cancelled");
                    outcome.cancelled = true;
                    return;
                }
                completion = monitor.recv() => match completion {
                    Some(completion) => self.handle_completion(assignment, completion, report, outcome, cancel).await,
                    None => {
                        warn!(code_unit_assignment_id = %assignment.assignment_id, "Completion monitor stopped early");
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        code_unit_assignment_id = %assignment.assignment_id,
                        pending = report.pending.len(),
                        backlogged = report.backlog.len(),
                        "Monitoring deadline reached"
                    );
                    outcome.timed_out = true;
                    return;
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or(deadline)), if next_retry.is_some() => {
                    for entry in report.backlog.take_due(Instant::now()) {
                        self.spawn_function(entry.assignment, entry.retries, report, cancel).await;
                    }
                }
            }
        }
    }

    async fn handle_completion(
        &self,
        assignment: &CodeUnitAssignment,
        completion: CompletionMessage,
        report: &mut SpawnReport,
        outcome: &mut DispatchOutcome,
        cancel: &CancellationToken,
    ) {
        if completion.is_build_failure() {
            self.spawn_bug_fix(assignment, &completion, report, cancel).await;
            return;
        }

        match report.pending.remove(&completion.assignment_id) {
            Some(pending) if pending.bug_fix => info!(
                function = %pending.function_name,
                success = completion.success,
                "Bug-fix completion observed"
            ),
            Some(pending) => {
                outcome.completed += 1;
                if !completion.success {
                    outcome.failed += 1;
                }
                info!(
                    function = %pending.function_name,
                    success = completion.success,
                    remaining = report.pending.len(),
                    "Function completion observed"
                );
            }
            None => debug!(
                assignment_id = %completion.assignment_id,
                "Ignoring completion for an assignment not pending in this dispatch"
            ),
        }
    }

    /// Turns a reported build failure into a bug-fix assignment and spawns
    /// it under the same capacity rules as any other function.
    async fn spawn_bug_fix(
        &self,
        assignment: &CodeUnitAssignment,
        completion: &CompletionMessage,
        report: &mut SpawnReport,
        cancel: &CancellationToken,
    ) {
        let language = assignment
            .functions
            .first()
            .map(|f| f.language.clone())
            .unwrap_or_else(|| "rust".to_string());
        let message = completion
            .error
            .as_deref()
            .unwrap_or("build failed without an error message");

        let fix = FunctionAssignment::bug_fix(
            assignment.project_id.clone(),
            assignment.code_unit_name.clone(),
            message,
            language,
        );
        let fix = self.prepare_function(assignment, &fix, &report.completion_queue);
        warn!(
            code_unit = %assignment.code_unit_name,
            bug_fix_id = %fix.assignment_id,
            "Build failed, spawning bug-fix assignment"
        );
        self.spawn_function(fix, 0, report, cancel).await;
    }

    async fn notify_builder(&self, assignment: &CodeUnitAssignment, outcome: &mut DispatchOutcome) {
        let notification = BuilderNotification {
            notification_id: Uuid::new_v4(),
            code_unit_assignment_id: assignment.assignment_id,
            code_unit_name: assignment.code_unit_name.clone(),
            project_id: assignment.project_id.clone(),
            function_count: outcome.total,
            completed_functions: outcome.completed,
            failed_functions: outcome.failed,
            spawned_functions: outcome.spawned,
            deferred_functions: outcome.deferred,
            timed_out: outcome.timed_out,
            created_at: Utc::now(),
        };

        match self
            .queue
            .send_priority(
                names::BUILDER_NOTIFICATIONS,
                &notification,
                assignment.priority.queue_priority(),
                None,
            )
            .await
        {
            Ok(_) => {
                outcome.notification_sent = true;
                outcome.success = true;
            }
            Err(e) => {
                error!(
                    code_unit_assignment_id = %assignment.assignment_id,
                    error = %e,
                    "Failed to send builder notification"
                );
                outcome.error = Some(format!("builder notification failed: {}", e));
            }
        }
    }
}

#[async_trait]
impl Agent for CodeUnitDispatcher {
    type Input = CodeUnitAssignment;
    type Output = DispatchOutcome;

    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        AgentType::CodeUnitDispatcher
    }

    async fn execute(&self, input: CodeUnitAssignment) -> AgentResult<DispatchOutcome> {
        let id = input.assignment_id;
        let name = input.code_unit_name.clone();
        let total = input.function_count();
        match self.dispatch(input, &self.cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(dispatcher_id = %self.id, code_unit_assignment_id = %id, error = %e, "Dispatch rejected");
                Ok(DispatchOutcome::rejected(id, &name, total, &e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PriorityLevel, WorkType};
    use crate::policy::{GlobalLimits, RetryPolicy, SwarmPolicy, ThrottlingPolicy};

    fn policy(max_workers_per_dispatcher: usize, max_attempts: u32) -> Arc<SwarmPolicy> {
        Arc::new(
            SwarmPolicy::default()
                .with_limits(GlobalLimits {
                    max_workers_per_dispatcher,
                    ..GlobalLimits::default()
                })
                .with_throttling(ThrottlingPolicy::disabled())
                .with_retry(RetryPolicy {
                    max_attempts,
                    initial_delay_ms: 10,
                    ..RetryPolicy::default()
                }),
        )
    }

    fn calculator() -> CodeUnitAssignment {
        let functions = ["Add", "Subtract", "Multiply", "Divide"]
            .iter()
            .map(|name| FunctionAssignment::new(format!("spec-{name}"), *name, ""))
            .collect();
        CodeUnitAssignment::new("proj-1", "Calculator", functions)
    }

    fn queue() -> Arc<MessageQueue> {
        Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn test_generate_and_send_assignments() {
        let queue = queue();
        let governor = SpawnGovernor::new(policy(20, 3));
        let dispatcher = CodeUnitDispatcher::new("d1", queue.clone(), governor.clone());
        let unit = calculator();

        let report = dispatcher
            .generate_and_send_assignments(&unit, &CancellationToken::new())
            .await;
        assert_eq!(report.spawned(), 4);
        assert_eq!(report.pending_ids().len(), 4);
        assert_eq!(report.distribution().by_work_type.get(&WorkType::BusinessLogic), Some(&4));
        assert_eq!(governor.active_for_dispatcher(unit.assignment_id), 4);

        let first = queue
            .receive::<FunctionAssignment>(names::FUNCTION_ASSIGNMENTS)
            .await
            .expect("receive should work")
            .expect("assignment should be queued");
        assert_eq!(first.data.code_unit_name, "Calculator");
        assert_eq!(first.data.code_unit_assignment_id, Some(unit.assignment_id));
        assert_eq!(first.data.project_id, "proj-1");
        assert_eq!(first.data.completion_queue.as_deref(), Some(report.completion_queue()));

        drop(report);
        assert_eq!(governor.active_for_dispatcher(unit.assignment_id), 0);
    }

    #[tokio::test]
    async fn test_ceiling_denial_defers_without_retries() {
        let queue = queue();
        let dispatcher = CodeUnitDispatcher::new("d1", queue.clone(), SpawnGovernor::new(policy(3, 0)));
        let unit = calculator();

        let report = dispatcher
            .generate_and_send_assignments(&unit, &CancellationToken::new())
            .await;
        assert_eq!(report.spawned(), 3);
        assert_eq!(report.deferred(), 1);
        assert_eq!(report.backlogged(), 0);

        let request = queue
            .receive::<SpawnRequest>(names::SPAWN_REQUESTS)
            .await
            .expect("receive should work")
            .expect("spawn request should be queued");
        assert_eq!(request.data.function_name, "Divide");
        assert_eq!(request.data.attempts, 1);
    }

    #[tokio::test]
    async fn test_ceiling_denial_backlogs_with_retries() {
        let dispatcher = CodeUnitDispatcher::new("d1", queue(), SpawnGovernor::new(policy(2, 3)));
        let report = dispatcher
            .generate_and_send_assignments(&calculator(), &CancellationToken::new())
            .await;
        assert_eq!(report.spawned(), 2);
        assert_eq!(report.backlogged(), 2);
        assert_eq!(report.deferred(), 0);
    }

    #[tokio::test]
    async fn test_bug_fix_unit_counts_its_own_functions_as_spawned() {
        let dispatcher = CodeUnitDispatcher::new("d1", queue(), SpawnGovernor::new(policy(20, 3)));
        let fix = FunctionAssignment::bug_fix("proj-1", "Calculator", "error[E0599]", "rust");
        let unit = CodeUnitAssignment::new("proj-1", "Calculator", vec![fix]);

        let report = dispatcher
            .generate_and_send_assignments(&unit, &CancellationToken::new())
            .await;
        assert_eq!(report.spawned(), 1);
        assert_eq!(report.bug_fixes(), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_ceiling_rejects_dispatch() {
        let policy = Arc::new(SwarmPolicy::default().with_limits(GlobalLimits {
            max_dispatchers_per_project: 1,
            ..GlobalLimits::default()
        }));
        let governor = SpawnGovernor::new(policy);
        let _held = governor
            .try_reserve(AgentType::CodeUnitDispatcher, "proj-1", None)
            .expect("first dispatcher slot");

        let dispatcher = CodeUnitDispatcher::new("d2", queue(), governor);
        let result = dispatcher.dispatch(calculator(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DispatchError::CapacityDenied(_))));

        let outcome = dispatcher.execute(calculator()).await.expect("execute never fails");
        assert!(!outcome.success);
        assert!(outcome.error.is_some_and(|e| e.contains("capacity")));
    }

    #[tokio::test]
    async fn test_empty_name_is_invalid() {
        let dispatcher = CodeUnitDispatcher::new("d1", queue(), SpawnGovernor::new(policy(20, 3)));
        let unit = CodeUnitAssignment::new("proj-1", "  ", Vec::new());
        let result = dispatcher.dispatch(unit, &CancellationToken::new()).await;
        assert!(matches!(result, Err(DispatchError::InvalidAssignment(_))));
    }

    fn build_failure(message: &str) -> CompletionMessage {
        CompletionMessage::failure("builder-1", AgentType::Builder, Uuid::new_v4(), message)
    }

    #[tokio::test]
    async fn test_build_failure_spawns_bug_fix() {
        let queue = queue();
        let governor = SpawnGovernor::new(policy(20, 3));
        let dispatcher = CodeUnitDispatcher::new("d1", queue.clone(), governor.clone());
        let unit = calculator();
        let mut report = SpawnReport::new(&unit);
        let mut outcome = DispatchOutcome::new(&unit);
        let cancel = CancellationToken::new();

        dispatcher
            .handle_completion(&unit, build_failure("E0308 mismatched types"), &mut report, &mut outcome, &cancel)
            .await;
        assert_eq!(report.bug_fixes(), 1);
        assert_eq!(report.spawned(), 0);
        assert_eq!(governor.active_for_dispatcher(unit.assignment_id), 1);

        let fix = queue
            .receive::<FunctionAssignment>(names::FUNCTION_ASSIGNMENTS)
            .await
            .expect("receive should work")
            .expect("bug fix should be queued");
        assert!(fix.data.is_bug_fix);
        assert_eq!(fix.data.priority, PriorityLevel::Critical);
        assert_eq!(fix.data.function_name, "FixBuildErrorsCalculator");
        assert_eq!(fix.data.code_unit_assignment_id, Some(unit.assignment_id));
        assert_eq!(fix.data.completion_queue.as_deref(), Some(report.completion_queue()));
        assert!(fix.data.description.contains("E0308"));

        // The fix's own completion frees its slot without counting as a function.
        let done = CompletionMessage::success("w1", AgentType::FunctionWorker, fix.data.assignment_id, "fixed");
        dispatcher
            .handle_completion(&unit, done, &mut report, &mut outcome, &cancel)
            .await;
        assert_eq!(outcome.completed, 0);
        assert_eq!(governor.active_for_dispatcher(unit.assignment_id), 0);
    }

    #[tokio::test]
    async fn test_denied_bug_fix_is_deferred_not_sent() {
        let queue = queue();
        let governor = SpawnGovernor::new(policy(4, 0));
        let dispatcher = CodeUnitDispatcher::new("d1", queue.clone(), governor.clone());
        let unit = calculator();
        let cancel = CancellationToken::new();

        let mut report = dispatcher.generate_and_send_assignments(&unit, &cancel).await;
        assert_eq!(report.spawned(), 4);
        let mut outcome = DispatchOutcome::new(&unit);
        dispatcher
            .handle_completion(&unit, build_failure("E0425"), &mut report, &mut outcome, &cancel)
            .await;

        assert_eq!(report.bug_fixes(), 0);
        assert_eq!(report.bug_fixes_deferred(), 1);
        assert_eq!(report.deferred(), 0);
        assert_eq!(governor.active_for_dispatcher(unit.assignment_id), 4);

        let stats = queue
            .stats(names::FUNCTION_ASSIGNMENTS)
            .await
            .expect("stats should work");
        assert_eq!(stats.sent, 4);
        let request = queue
            .receive::<SpawnRequest>(names::SPAWN_REQUESTS)
            .await
            .expect("receive should work")
            .expect("spawn request should be queued");
        assert_eq!(request.data.function_name, "FixBuildErrorsCalculator");
        assert_eq!(request.data.priority, PriorityLevel::Critical);
    }

    #[tokio::test]
    async fn test_denied_bug_fix_is_backlogged_with_retries() {
        let governor = SpawnGovernor::new(policy(4, 3));
        let dispatcher = CodeUnitDispatcher::new("d1", queue(), governor);
        let unit = calculator();
        let cancel = CancellationToken::new();

        let mut report = dispatcher.generate_and_send_assignments(&unit, &cancel).await;
        let mut outcome = DispatchOutcome::new(&unit);
        dispatcher
            .handle_completion(&unit, build_failure("E0425"), &mut report, &mut outcome, &cancel)
            .await;

        assert_eq!(report.bug_fixes(), 0);
        assert_eq!(report.backlogged(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_times_out_and_still_notifies() {
        let queue = queue();
        let dispatcher = CodeUnitDispatcher::new("d1", queue.clone(), SpawnGovernor::new(policy(20, 3)))
            .with_config(DispatcherConfig::default().with_monitor_timeout(Duration::from_secs(2)));

        let outcome = dispatcher
            .dispatch(calculator(), &CancellationToken::new())
            .await
            .expect("dispatch should run");
        assert!(outcome.timed_out);
        assert_eq!(outcome.spawned, 4);
        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.unfinished(), 4);
        assert!(outcome.success);

        let notification = queue
            .receive::<BuilderNotification>(names::BUILDER_NOTIFICATIONS)
            .await
            .expect("receive should work")
            .expect("notification should be queued");
        assert!(notification.data.timed_out);
        assert_eq!(notification.data.function_count, 4);
    }

    #[test]
    fn test_monitor_window_respects_policy_timeout() {
        let dispatcher = CodeUnitDispatcher::new("d1", queue(), SpawnGovernor::new(policy(20, 3)))
            .with_config(DispatcherConfig::default().with_monitor_timeout(Duration::from_secs(7_200)));
        assert_eq!(dispatcher.monitor_window(), Duration::from_secs(1_800));
    }
}
