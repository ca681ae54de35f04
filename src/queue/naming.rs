//! Physical key naming for logical queues.
//!
//! Every key is derived from the logical queue name alone, so any process
//! can address a queue without shared state.

/// Well-known queue names used by the swarm.
pub mod names {
    pub const CODE_UNIT_ASSIGNMENTS: &str = "swarm.codeunit.assignments";
    pub const SPAWN_REQUESTS: &str = "swarm.spawn.requests";
    pub const COMPLETIONS: &str = "swarm.completions";
    pub const FUNCTION_ASSIGNMENTS: &str = "swarm.function.assignments";
    /// Implementation artifacts, kept out of the small completion budget.
    pub const FUNCTION_ARTIFACTS: &str = "swarm.function.artifacts";
    pub const WORKLOAD_DISTRIBUTION: &str = "swarm.workload.distribution";
    pub const BUILDER_NOTIFICATIONS: &str = "builder.notifications";
    pub const BUILDER_ERRORS: &str = "builder.errors";
}

/// Storage keys backing one logical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// FIFO list key.
    pub list: String,
    /// Priority sorted-set key.
    pub priority: String,
    /// Persisted configuration key.
    pub config: String,
    /// Statistics hash key.
    pub stats: String,
    /// Dead letter list key.
    pub dead_letter: String,
}

impl QueueKeys {
    pub fn for_queue(name: &str) -> Self {
        Self {
            list: name.to_string(),
            priority: format!("{}:priority", name),
            config: format!("queue:config:{}", name),
            stats: format!("queue:stats:{}", name),
            dead_letter: format!("{}:dead_letter", name),
        }
    }

    /// Keys holding queued messages (not config or stats).
    pub fn message_keys(&self) -> Vec<String> {
        vec![self.list.clone(), self.priority.clone()]
    }

    /// Every key owned by the queue.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.list.clone(),
            self.priority.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.dead_letter.clone(),
        ]
    }
}

/// Name of the per-dispatch completion queue for a code-unit assignment.
///
/// The dotted suffix lets the queue inherit the `swarm.completions`
/// configuration through prefix resolution.
pub fn completion_queue_for(code_unit_assignment_id: &str) -> String {
    format!("{}.{}", names::COMPLETIONS, code_unit_assignment_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_derive_from_name() {
        let keys = QueueKeys::for_queue("swarm.function.assignments");
        assert_eq!(keys.list, "swarm.function.assignments");
        assert_eq!(keys.priority, "swarm.function.assignments:priority");
        assert_eq!(keys.config, "queue:config:swarm.function.assignments");
        assert_eq!(keys.stats, "queue:stats:swarm.function.assignments");
        assert_eq!(keys.dead_letter, "swarm.function.assignments:dead_letter");
    }

    #[test]
    fn test_message_keys_exclude_bookkeeping() {
        let keys = QueueKeys::for_queue("q");
        let message_keys = keys.message_keys();
        assert_eq!(message_keys.len(), 2);
        assert!(!message_keys.contains(&keys.config));
        assert_eq!(keys.all().len(), 5);
    }

    #[test]
    fn test_completion_queue_for() {
        assert_eq!(completion_queue_for("abc"), "swarm.completions.abc");
    }
}
