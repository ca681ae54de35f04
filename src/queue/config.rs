//! Per-queue configuration and the registry that resolves it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::naming::names;

const KIB: usize = 1024;

/// Configuration for a single queue.
///
/// Immutable once created. Queues without an explicit configuration fall
/// back to [`QueueConfiguration::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfiguration {
    /// Whether the ordered-set priority structure may be used.
    pub enable_priority: bool,
    /// Maximum serialized payload size in bytes.
    pub max_message_size_bytes: usize,
    /// Advisory maximum number of queued messages.
    pub max_queue_depth: usize,
    /// Default time-to-live in seconds.
    pub default_ttl_secs: u64,
    /// Maximum redelivery attempts for rejected messages.
    pub max_retries: u32,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            enable_priority: true,
            max_message_size_bytes: 64 * KIB,
            max_queue_depth: 10_000,
            default_ttl_secs: 3600,
            max_retries: 3,
        }
    }
}

impl QueueConfiguration {
    pub fn new(enable_priority: bool, max_message_size_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            enable_priority,
            max_message_size_bytes,
            default_ttl_secs: default_ttl.as_secs(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// The predefined swarm queue configurations.
pub fn predefined_configs() -> HashMap<String, QueueConfiguration> {
    let hours = |h: u64| Duration::from_secs(h * 3600);
    let entries = [
        (
            names::CODE_UNIT_ASSIGNMENTS,
            QueueConfiguration::new(true, 16 * KIB, hours(4)).with_max_retries(3),
        ),
        (
            names::SPAWN_REQUESTS,
            QueueConfiguration::new(true, KIB, hours(2)).with_max_retries(3),
        ),
        (
            names::COMPLETIONS,
            QueueConfiguration::new(true, 2 * KIB, hours(1)).with_max_retries(2),
        ),
        (
            names::FUNCTION_ASSIGNMENTS,
            QueueConfiguration::new(true, 1536, hours(2)).with_max_retries(3),
        ),
        (
            names::FUNCTION_ARTIFACTS,
            QueueConfiguration::new(false, 256 * KIB, hours(4)).with_max_retries(2),
        ),
        (
            names::WORKLOAD_DISTRIBUTION,
            QueueConfiguration::new(true, KIB, hours(1)).with_max_retries(2),
        ),
        (
            names::BUILDER_NOTIFICATIONS,
            QueueConfiguration::new(true, KIB, Duration::from_secs(30 * 60)).with_max_retries(2),
        ),
        (
            names::BUILDER_ERRORS,
            QueueConfiguration::new(false, 2 * KIB, hours(24)).with_max_retries(1),
        ),
    ];

    entries
        .into_iter()
        .map(|(name, config)| (name.to_string(), config))
        .collect()
}

/// Explicit map of queue configurations handed to the message queue.
#[derive(Debug, Clone, Default)]
pub struct QueueConfigRegistry {
    configs: HashMap<String, QueueConfiguration>,
    fallback: QueueConfiguration,
}

impl QueueConfigRegistry {
    /// Creates an empty registry where every queue uses `fallback`.
    pub fn new(fallback: QueueConfiguration) -> Self {
        Self {
            configs: HashMap::new(),
            fallback,
        }
    }

    /// Creates a registry seeded with the predefined swarm queues.
    pub fn with_predefined() -> Self {
        Self {
            configs: predefined_configs(),
            fallback: QueueConfiguration::default(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, config: QueueConfiguration) {
        self.configs.insert(name.into(), config);
    }

    pub fn remove(&mut self, name: &str) -> Option<QueueConfiguration> {
        self.configs.remove(name)
    }

    /// Exact registry entry for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&QueueConfiguration> {
        self.configs.get(name)
    }

    /// Longest registered dotted prefix of `name`.
    ///
    /// `swarm.completions.abc` resolves to `swarm.completions`.
    pub fn by_prefix(&self, name: &str) -> Option<&QueueConfiguration> {
        self.registered_prefix(name)
            .and_then(|prefix| self.configs.get(prefix))
    }

    /// Name metrics for `name` are recorded under.
    ///
    /// Queues that inherit through a dotted prefix share that prefix, so
    /// per-dispatch queues add no label series of their own.
    pub fn metric_family<'a>(&self, name: &'a str) -> &'a str {
        self.registered_prefix(name).unwrap_or(name)
    }

    fn registered_prefix<'a>(&self, name: &'a str) -> Option<&'a str> {
        let mut candidate = name;
        while let Some(pos) = candidate.rfind('.') {
            candidate = &candidate[..pos];
            if self.configs.contains_key(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn fallback(&self) -> &QueueConfiguration {
        &self.fallback
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.configs.keys()
    }
}
