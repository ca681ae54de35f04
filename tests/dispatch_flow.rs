//! End-to-end dispatch tests: dispatcher and worker pool over the in-memory
//! store with a canned generation service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use swarm_dispatch::dispatcher::{CodeUnitDispatcher, DispatcherConfig};
use swarm_dispatch::llm::{GenerationOutput, GenerationService};
use swarm_dispatch::messages::{
    AgentType, BuilderNotification, CodeUnitAssignment, CompletionMessage, FunctionAssignment,
    PriorityLevel, SpawnRequest,
};
use swarm_dispatch::policy::{
    AgentResourceLimits, GlobalLimits, RetryPolicy, SpawnGovernor, SwarmPolicy, ThrottlingPolicy,
};
use swarm_dispatch::queue::{completion_queue_for, names, MessageQueue};
use swarm_dispatch::worker::{WorkerPool, WorkerPoolConfig};
use swarm_dispatch::LlmError;

/// Answers every stage instantly; fails any prompt mentioning `fail_on`.
struct CannedGenerator {
    fail_on: Option<String>,
}

#[async_trait]
impl GenerationService for CannedGenerator {
    async fn generate(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationOutput, LlmError> {
        if let Some(name) = &self.fail_on {
            if user_prompt.contains(name.as_str()) {
                return Err(LlmError::ApiError {
                    code: 500,
                    message: "upstream error".to_string(),
                });
            }
        }
        let text = if temperature > 0.2 {
            "Inputs are two integers; overflow must be reported.".to_string()
        } else {
            "```rust\npub fn op(a: i64, b: i64) -> Result<i64, CalcError> {\n    // checked\n    if b == 0 { Err(CalcError::Invalid) } else { Ok(a) }\n}\n```\n{\"passed\": true, \"issues\": []}"
                .to_string()
        };
        Ok(GenerationOutput {
            text,
            model: "canned".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            cost: 0.001,
            duration: Duration::from_millis(1),
        })
    }
}

fn queue() -> Arc<MessageQueue> {
    Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)))
}

fn policy(max_workers_per_dispatcher: usize, retry: RetryPolicy) -> Arc<SwarmPolicy> {
    Arc::new(
        SwarmPolicy::default()
            .with_limits(GlobalLimits {
                max_workers_per_dispatcher,
                ..GlobalLimits::default()
            })
            .with_throttling(ThrottlingPolicy::disabled())
            .with_retry(retry),
    )
}

fn no_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 0,
        ..RetryPolicy::default()
    }
}

fn unit(name: &str, functions: &[&str]) -> CodeUnitAssignment {
    let functions = functions
        .iter()
        .map(|f| FunctionAssignment::new(format!("spec-{f}"), *f, name).with_description(format!("{f} two numbers")))
        .collect();
    CodeUnitAssignment::new("proj-calc", name, functions)
}

fn calculator() -> CodeUnitAssignment {
    unit("Calculator", &["Add", "Subtract", "Multiply", "Divide"])
}

fn start_pool(queue: &Arc<MessageQueue>, workers: usize, fail_on: Option<&str>) -> WorkerPool {
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(workers).with_receive_timeout(Duration::from_millis(20)),
        Arc::clone(queue),
        Arc::new(CannedGenerator {
            fail_on: fail_on.map(str::to_string),
        }),
        AgentResourceLimits::default(),
    );
    pool.start().expect("pool should start");
    pool
}

fn dispatcher(queue: &Arc<MessageQueue>, policy: Arc<SwarmPolicy>, monitor_timeout: Duration) -> CodeUnitDispatcher {
    CodeUnitDispatcher::new("test-dispatcher", Arc::clone(queue), SpawnGovernor::new(policy))
        .with_config(DispatcherConfig::default().with_monitor_timeout(monitor_timeout))
}

async fn notification(queue: &MessageQueue) -> BuilderNotification {
    queue
        .receive::<BuilderNotification>(names::BUILDER_NOTIFICATIONS)
        .await
        .expect("receive should work")
        .expect("notification should be queued")
        .data
}

#[tokio::test]
async fn test_calculator_dispatch_completes_all_functions() {
    let queue = queue();
    let mut pool = start_pool(&queue, 2, None);
    let dispatcher = dispatcher(&queue, policy(20, RetryPolicy::default()), Duration::from_secs(30));

    let outcome = dispatcher
        .dispatch(calculator(), &CancellationToken::new())
        .await
        .expect("dispatch should run");
    pool.shutdown().await.expect("pool should stop");

    assert!(outcome.success);
    assert!(outcome.all_completed());
    assert!(!outcome.timed_out);
    assert_eq!(outcome.total, 4);
    assert_eq!(outcome.spawned, 4);
    assert_eq!(outcome.completed, 4);
    assert_eq!(outcome.deferred, 0);

    let function_stats = queue
        .stats(names::FUNCTION_ASSIGNMENTS)
        .await
        .expect("stats should work");
    assert_eq!(function_stats.sent, 4);
    assert_eq!(function_stats.acknowledged, 4);

    let notice = notification(&queue).await;
    assert_eq!(notice.code_unit_name, "Calculator");
    assert_eq!(notice.function_count, 4);
    assert_eq!(notice.completed_functions, 4);
    assert_eq!(notice.failed_functions, 0);
    assert!(queue
        .receive::<BuilderNotification>(names::BUILDER_NOTIFICATIONS)
        .await
        .expect("receive should work")
        .is_none());
}

#[tokio::test]
async fn test_capacity_denial_spawns_n_minus_one_and_defers() {
    let queue = queue();
    let mut pool = start_pool(&queue, 2, None);
    let dispatcher = dispatcher(&queue, policy(3, no_retries()), Duration::from_secs(30));

    let outcome = dispatcher
        .dispatch(calculator(), &CancellationToken::new())
        .await
        .expect("dispatch should run");
    pool.shutdown().await.expect("pool should stop");

    assert!(outcome.success);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.spawned, 3);
    assert_eq!(outcome.deferred, 1);
    assert_eq!(outcome.completed, 3);

    let notice = notification(&queue).await;
    assert_eq!(notice.function_count, 4);
    assert_eq!(notice.completed_functions, 3);
    assert_eq!(notice.deferred_functions, 1);

    let request = queue
        .receive::<SpawnRequest>(names::SPAWN_REQUESTS)
        .await
        .expect("receive should work")
        .expect("spawn request should be queued");
    assert_eq!(request.data.function_name, "Divide");
    assert_eq!(request.data.agent_type, AgentType::FunctionWorker);
}

#[tokio::test]
async fn test_backlog_retries_until_capacity_frees() {
    let queue = queue();
    let mut pool = start_pool(&queue, 2, None);
    let retry = RetryPolicy {
        max_attempts: 50,
        initial_delay_ms: 10,
        backoff_multiplier: 1.0,
        max_delay_ms: 10,
        retryable_errors: None,
    };
    let dispatcher = dispatcher(&queue, policy(2, retry), Duration::from_secs(30));

    let outcome = dispatcher
        .dispatch(calculator(), &CancellationToken::new())
        .await
        .expect("dispatch should run");
    pool.shutdown().await.expect("pool should stop");

    assert_eq!(outcome.spawned, 4);
    assert_eq!(outcome.deferred, 0);
    assert_eq!(outcome.completed, 4);
    assert!(outcome.all_completed());
}

#[tokio::test]
async fn test_failed_function_is_reported_not_retried() {
    let queue = queue();
    let mut pool = start_pool(&queue, 2, Some("Divide"));
    let dispatcher = dispatcher(&queue, policy(20, RetryPolicy::default()), Duration::from_secs(30));

    let outcome = dispatcher
        .dispatch(calculator(), &CancellationToken::new())
        .await
        .expect("dispatch should run");
    pool.shutdown().await.expect("pool should stop");

    assert!(outcome.success);
    assert_eq!(outcome.completed, 4);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.all_completed());

    let notice = notification(&queue).await;
    assert_eq!(notice.failed_functions, 1);
    assert_eq!(pool.stats().assignments_failed, 1);
}

#[tokio::test]
async fn test_build_failure_triggers_bug_fix_during_monitoring() {
    let queue = queue();
    let dispatcher = dispatcher(&queue, policy(20, RetryPolicy::default()), Duration::from_millis(300));
    let assignment = calculator();
    let completion_queue = completion_queue_for(&assignment.assignment_id.to_string());

    let report_build_failure = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failure = CompletionMessage::failure(
            "builder-1",
            AgentType::Builder,
            assignment.assignment_id,
            "error[E0425]: cannot find value `x` in this scope",
        );
        queue
            .send(&completion_queue, &failure, None)
            .await
            .expect("send should work");
    };
    let cancel = CancellationToken::new();
    let (outcome, ()) = tokio::join!(
        dispatcher.dispatch(assignment.clone(), &cancel),
        report_build_failure
    );
    let outcome = outcome.expect("dispatch should run");

    assert_eq!(outcome.bug_fixes, 1);
    assert!(outcome.timed_out);
    assert_eq!(outcome.completed, 0);

    // Critical priority puts the bug fix ahead of the medium-priority functions.
    let fix = queue
        .receive::<FunctionAssignment>(names::FUNCTION_ASSIGNMENTS)
        .await
        .expect("receive should work")
        .expect("bug fix should be queued");
    assert!(fix.data.is_bug_fix);
    assert_eq!(fix.data.priority, PriorityLevel::Critical);
    assert_eq!(fix.data.code_unit_assignment_id, Some(assignment.assignment_id));
    assert!(fix.data.description.contains("E0425"));
}

#[tokio::test]
async fn test_cancellation_returns_promptly_and_notifies() {
    let queue = queue();
    let dispatcher = dispatcher(&queue, policy(20, RetryPolicy::default()), Duration::from_secs(600));
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    };
    let started = std::time::Instant::now();
    let (outcome, ()) = tokio::join!(dispatcher.dispatch(calculator(), &cancel), canceller);
    let outcome = outcome.expect("dispatch should run");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(outcome.cancelled);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.spawned, 4);
    assert!(outcome.notification_sent);
    assert_eq!(notification(&queue).await.completed_functions, 0);
}

#[tokio::test]
async fn test_concurrent_dispatches_keep_their_own_completions() {
    let queue = queue();
    let mut pool = start_pool(&queue, 3, None);
    let policy = policy(20, RetryPolicy::default());
    let first = dispatcher(&queue, Arc::clone(&policy), Duration::from_secs(30));
    let second = dispatcher(&queue, policy, Duration::from_secs(30));
    let never = CancellationToken::new();

    let (a, b) = tokio::join!(
        first.dispatch(unit("Parser", &["Tokenize", "ParseExpr"]), &never),
        second.dispatch(unit("Printer", &["Format", "Indent", "Wrap"]), &never)
    );
    pool.shutdown().await.expect("pool should stop");

    let a = a.expect("first dispatch should run");
    let b = b.expect("second dispatch should run");
    assert_eq!((a.spawned, a.completed), (2, 2));
    assert_eq!((b.spawned, b.completed), (3, 3));
    assert!(a.all_completed() && b.all_completed());
}
