//! Functions waiting for spawn capacity.

use std::time::Duration;

use tokio::time::Instant;

use crate::messages::FunctionAssignment;
use crate::policy::{RetryPolicy, SpawnDenial};

/// A function that was denied capacity and will be retried.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub assignment: FunctionAssignment,
    /// Retries already scheduled for this entry.
    pub retries: u32,
    pub next_attempt_at: Instant,
    pub last_denial: SpawnDenial,
}

/// Ordered set of functions awaiting a spawn retry.
#[derive(Debug, Default)]
pub struct SpawnBacklog {
    entries: Vec<BacklogEntry>,
}

impl SpawnBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedules a retry for `assignment` unless `policy` says to give up.
    ///
    /// `retries` is how many retries the function has already had. Returns
    /// the retry delay, or hands the assignment back when the retry budget
    /// is spent or the denial is not retryable.
    pub fn schedule(
        &mut self,
        assignment: FunctionAssignment,
        retries: u32,
        denial: SpawnDenial,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Result<Duration, FunctionAssignment> {
        if !policy.should_retry(retries, denial.category()) {
            return Err(assignment);
        }
        let delay = policy.delay_for_attempt(retries);
        self.entries.push(BacklogEntry {
            assignment,
            retries: retries + 1,
            next_attempt_at: now + delay,
            last_denial: denial,
        });
        Ok(delay)
    }

    /// Earliest time any entry becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.next_attempt_at).min()
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<BacklogEntry> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.next_attempt_at <= now);
        self.entries = pending;
        due.sort_by_key(|e| e.next_attempt_at);
        due
    }

    /// Empties the backlog.
    pub fn drain(&mut self) -> Vec<BacklogEntry> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceiling() -> SpawnDenial {
        SpawnDenial::DispatcherCeiling { active: 2, limit: 2 }
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
            retryable_errors: None,
        }
    }

    #[test]
    fn test_schedule_uses_backoff() {
        let now = Instant::now();
        let mut backlog = SpawnBacklog::new();
        let policy = retry(3);

        let first = backlog.schedule(FunctionAssignment::new("s", "A", "U"), 0, ceiling(), &policy, now);
        let second = backlog.schedule(FunctionAssignment::new("s", "B", "U"), 2, ceiling(), &policy, now);
        assert_eq!(first.expect("scheduled"), Duration::from_millis(100));
        assert_eq!(second.expect("scheduled"), Duration::from_millis(400));
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.next_due(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_exhausted_returns_assignment() {
        let mut backlog = SpawnBacklog::new();
        let result = backlog.schedule(
            FunctionAssignment::new("s", "Divide", "U"),
            0,
            ceiling(),
            &retry(0),
            Instant::now(),
        );
        let returned = result.expect_err("no retries allowed");
        assert_eq!(returned.function_name, "Divide");
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_allow_list_blocks_capacity_retries() {
        let mut policy = retry(3);
        policy.retryable_errors = Some(vec!["throttled".to_string()]);
        let mut backlog = SpawnBacklog::new();
        let result = backlog.schedule(FunctionAssignment::new("s", "A", "U"), 0, ceiling(), &policy, Instant::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_take_due_partitions() {
        let now = Instant::now();
        let mut backlog = SpawnBacklog::new();
        let policy = retry(5);
        backlog
            .schedule(FunctionAssignment::new("s", "Late", "U"), 3, ceiling(), &policy, now)
            .expect("scheduled");
        backlog
            .schedule(FunctionAssignment::new("s", "Soon", "U"), 0, ceiling(), &policy, now)
            .expect("scheduled");

        let due = backlog.take_due(now + Duration::from_millis(150));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].assignment.function_name, "Soon");
        assert_eq!(due[0].retries, 1);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.drain().len(), 1);
        assert!(backlog.is_empty());
    }
}
