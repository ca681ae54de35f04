//! Feeds build failures back into dispatch.
//!
//! The build step reacts to a [`BuilderNotification`](crate::messages::BuilderNotification)
//! after the dispatch has finished, so its failures cannot go to the
//! per-dispatch completion queue. They arrive on `builder.errors` instead and
//! each one becomes a one-function bug-fix [`CodeUnitAssignment`] on
//! `swarm.codeunit.assignments`, where any dispatcher service picks it up.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::messages::{BuilderError, CodeUnitAssignment};
use crate::queue::{names, MessageQueue};

/// Moves [`BuilderError`]s from the error queue to the code-unit queue.
pub struct BuildErrorForwarder {
    queue: Arc<MessageQueue>,
    source: String,
    target: String,
    receive_timeout: Duration,
}

impl BuildErrorForwarder {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self {
            queue,
            source: names::BUILDER_ERRORS.to_string(),
            target: names::CODE_UNIT_ASSIGNMENTS.to_string(),
            receive_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_source(mut self, queue: impl Into<String>) -> Self {
        self.source = queue.into();
        self
    }

    pub fn with_target(mut self, queue: impl Into<String>) -> Self {
        self.target = queue.into();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Forwards at most one build error, waiting up to the receive timeout.
    ///
    /// Returns the id of the queued bug-fix code unit. A report that cannot
    /// be forwarded is rejected back to its queue for redelivery.
    pub async fn forward_next(&self, cancel: &CancellationToken) -> Result<Option<Uuid>, QueueError> {
        let Some(item) = self
            .queue
            .receive_blocking::<BuilderError>(&self.source, self.receive_timeout, cancel)
            .await?
        else {
            return Ok(None);
        };

        let unit: CodeUnitAssignment = item.data.to_code_unit_assignment();
        let sent = self
            .queue
            .send_priority(&self.target, &unit, unit.priority.queue_priority(), None)
            .await;
        match sent {
            Ok(_) => {
                if let Err(e) = self.queue.acknowledge(&item).await {
                    debug!(id = %item.id, error = %e, "Failed to acknowledge build error");
                }
                info!(
                    error_id = %item.data.error_id,
                    failed_dispatch = ?item.data.code_unit_assignment_id,
                    code_unit = %unit.code_unit_name,
                    bug_fix_unit = %unit.assignment_id,
                    "Build error forwarded as bug-fix code unit"
                );
                Ok(Some(unit.assignment_id))
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(reject_err) = self.queue.reject(item, true, &reason).await {
                    warn!(error = %reject_err, "Failed to return build error to its queue");
                }
                Err(e)
            }
        }
    }

    /// Forwards until `cancel` fires. Returns how many errors were forwarded.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let mut forwarded = 0;
        debug!(source = %self.source, target = %self.target, "Build error forwarder started");
        while !cancel.is_cancelled() {
            match self.forward_next(&cancel).await {
                Ok(Some(_)) => forwarded += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(source = %self.source, error = %e, "Build error forwarding failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.queue.poll_interval()) => {}
                    }
                }
            }
        }
        debug!(forwarded, "Build error forwarder stopped");
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PriorityLevel;
    use chrono::Utc;

    fn build_error(code_unit: &str) -> BuilderError {
        BuilderError {
            error_id: Uuid::new_v4(),
            project_id: "proj-calc".to_string(),
            code_unit_assignment_id: Some(Uuid::new_v4()),
            code_unit_name: code_unit.to_string(),
            function_name: None,
            error_message: "error[E0425]: cannot find value `x`".to_string(),
            build_output: None,
            language: "rust".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_build_error_becomes_bug_fix_code_unit() {
        let queue = Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)));
        queue
            .send(names::BUILDER_ERRORS, &build_error("Calculator"), None)
            .await
            .expect("send should work");

        let forwarder = BuildErrorForwarder::new(queue.clone()).with_receive_timeout(Duration::from_millis(50));
        let unit_id = forwarder
            .forward_next(&CancellationToken::new())
            .await
            .expect("forward should work")
            .expect("an error was queued");

        let unit = queue
            .receive::<CodeUnitAssignment>(names::CODE_UNIT_ASSIGNMENTS)
            .await
            .expect("receive should work")
            .expect("bug-fix unit should be queued");
        assert_eq!(unit.data.assignment_id, unit_id);
        assert_eq!(unit.data.code_unit_name, "Calculator");
        assert_eq!(unit.data.priority, PriorityLevel::Critical);
        assert!(unit.data.functions[0].is_bug_fix);
        assert!(unit.data.functions[0].description.contains("E0425"));

        let stats = queue.stats(names::BUILDER_ERRORS).await.expect("stats should work");
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_error_queue_forwards_nothing() {
        let queue = Arc::new(MessageQueue::in_memory().with_poll_interval(Duration::from_millis(5)));
        let forwarder = BuildErrorForwarder::new(queue).with_receive_timeout(Duration::from_millis(20));
        let forwarded = forwarder
            .forward_next(&CancellationToken::new())
            .await
            .expect("forward should work");
        assert!(forwarded.is_none());
    }
}
