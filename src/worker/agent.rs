//! The agent abstraction shared by workers and dispatchers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use crate::messages::AgentType;

/// A swarm participant that turns one input into one output.
#[async_trait]
pub trait Agent: Send + Sync {
    type Input: Send + 'static;
    type Output: Send;

    fn id(&self) -> &str;

    fn agent_type(&self) -> AgentType;

    async fn execute(&self, input: Self::Input) -> AgentResult<Self::Output>;
}

/// Runs `agent` under `timeout`, logging start, finish and duration.
///
/// # Errors
///
/// Returns `AgentError::Timeout` when the deadline passes first, otherwise
/// whatever the agent returned.
pub async fn instrumented<A>(agent: &A, input: A::Input, timeout: Duration) -> AgentResult<A::Output>
where
    A: Agent + ?Sized,
{
    let start = Instant::now();
    info!(
        agent_id = agent.id(),
        agent_type = %agent.agent_type(),
        timeout_secs = timeout.as_secs(),
        "Agent execution started"
    );

    let result = match tokio::time::timeout(timeout, agent.execute(input)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout(timeout)),
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(
            agent_id = agent.id(),
            agent_type = %agent.agent_type(),
            duration_ms,
            "Agent execution finished"
        ),
        Err(e) => warn!(
            agent_id = agent.id(),
            agent_type = %agent.agent_type(),
            duration_ms,
            error = %e,
            "Agent execution failed"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SleepyAgent {
        delay: Duration,
    }

    #[async_trait]
    impl Agent for SleepyAgent {
        type Input = u32;
        type Output = u32;

        fn id(&self) -> &str {
            "sleepy"
        }

        fn agent_type(&self) -> AgentType {
            AgentType::FunctionWorker
        }

        async fn execute(&self, input: u32) -> AgentResult<u32> {
            tokio::time::sleep(self.delay).await;
            Ok(input * 2)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_instrumented_passes_output_through() {
        let agent = SleepyAgent {
            delay: Duration::from_millis(10),
        };
        let result = instrumented(&agent, 21, Duration::from_secs(1)).await;
        assert_eq!(result.expect("should finish"), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instrumented_enforces_timeout() {
        let agent = SleepyAgent {
            delay: Duration::from_secs(60),
        };
        let result = instrumented(&agent, 1, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AgentError::Timeout(d)) if d == Duration::from_secs(5)));
    }
}
