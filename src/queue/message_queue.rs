//! Durable priority/FIFO hybrid queue.
//!
//! Each logical queue is a FIFO list plus an optional priority ordered set
//! in the backing store. Priority consumers always drain the ordered set
//! before falling back to the list.
//!
//! # Ordering
//!
//! The ordered-set score is `priority * 10^13 - unix_millis`, popped from
//! the top. Higher priority always wins; within a priority the earlier
//! enqueue wins. Producers' wall clocks take part in the ordering, so clock
//! skew between producers can reorder equal-priority messages.
//!
//! # Delivery
//!
//! There is no in-flight state: a consumer that dies mid-processing loses
//! the message. Expired messages are discarded on receive.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{QueueConfigRegistry, QueueConfiguration};
use super::envelope::QueueItem;
use super::naming::QueueKeys;
use super::store::{KeyValueStore, MemoryStore};
use super::truncate::{fit_to_budget, serialized_size, FitOutcome};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Default interval between polls in [`MessageQueue::receive_blocking`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Weight separating priority bands in the ordered-set score.
///
/// Larger than any unix millisecond timestamp for the next few centuries.
const PRIORITY_WEIGHT: f64 = 1e13;

/// Priorities are clamped so every score stays exactly representable.
pub const MAX_PRIORITY: i32 = 900;
pub const MIN_PRIORITY: i32 = -900;

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Id of the enqueued message.
    pub id: Uuid,
    /// Serialized payload size after any truncation.
    pub size_bytes: usize,
    /// Serialized payload size before truncation.
    pub original_size_bytes: usize,
    /// Whether string content was cut to fit the budget.
    pub truncated: bool,
}

/// What happened to a rejected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Returned to the queue with one less retry.
    Requeued,
    /// Moved to the dead letter list.
    DeadLettered,
}

/// Statistic counters kept per queue.
pub mod counters {
    pub const SENT: &str = "sent";
    pub const RECEIVED: &str = "received";
    pub const ACKNOWLEDGED: &str = "acknowledged";
    pub const REJECTED: &str = "rejected";
    pub const REQUEUED: &str = "requeued";
    pub const DEAD_LETTERED: &str = "dead_lettered";
    pub const EXPIRED: &str = "expired";
    pub const CORRUPT: &str = "corrupt";
    pub const TRUNCATED: &str = "truncated";
}

/// Statistics about one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Messages waiting in the FIFO list.
    pub fifo_depth: usize,
    /// Messages waiting in the priority set.
    pub priority_depth: usize,
    /// Messages in the dead letter list.
    pub dead_letter_depth: usize,
    pub sent: u64,
    pub received: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    pub corrupt: u64,
    pub truncated: u64,
}

impl QueueStats {
    /// Messages currently deliverable or awaiting expiry.
    pub fn pending(&self) -> usize {
        self.fifo_depth + self.priority_depth
    }
}

/// Computes the ordered-set score for a message.
pub fn priority_score(priority: i32, enqueued_at: DateTime<Utc>) -> f64 {
    let priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    f64::from(priority) * PRIORITY_WEIGHT - enqueued_at.timestamp_millis() as f64
}

/// Durable queue over a shared key-value store.
pub struct MessageQueue {
    store: Arc<dyn KeyValueStore>,
    configs: RwLock<QueueConfigRegistry>,
    poll_interval: Duration,
    metrics: MetricsCollector,
}

impl MessageQueue {
    /// Creates a queue over `store` resolving configuration from `configs`.
    pub fn new(store: Arc<dyn KeyValueStore>, configs: QueueConfigRegistry) -> Self {
        Self {
            store,
            configs: RwLock::new(configs),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics: MetricsCollector::new(),
        }
    }

    /// In-process queue with the predefined swarm configurations.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            QueueConfigRegistry::with_predefined(),
        )
    }

    /// Sets the poll interval used by blocking receives.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resolves the configuration for `queue`.
    ///
    /// Order: exact registry entry, configuration persisted by
    /// [`create_queue`](Self::create_queue), dotted prefix, fallback.
    pub async fn configuration(&self, queue: &str) -> Result<QueueConfiguration, QueueError> {
        if let Some(config) = self.registry_lookup(|r| r.get(queue).cloned()) {
            return Ok(config);
        }

        let keys = QueueKeys::for_queue(queue);
        if let Some(raw) = self.store.get(&keys.config).await? {
            match serde_json::from_str::<QueueConfiguration>(&raw) {
                Ok(config) => {
                    self.configs
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(queue, config.clone());
                    return Ok(config);
                }
                Err(e) => {
                    warn!(queue = queue, error = %e, "Ignoring unreadable stored queue configuration");
                }
            }
        }

        Ok(self.registry_lookup(|r| {
            r.by_prefix(queue)
                .cloned()
                .unwrap_or_else(|| r.fallback().clone())
        }))
    }

    fn registry_lookup<R>(&self, f: impl FnOnce(&QueueConfigRegistry) -> R) -> R {
        let registry = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        f(&registry)
    }

    /// Pushes `payload` onto the FIFO list of `queue`.
    ///
    /// # Errors
    ///
    /// - `QueueError::Serialization` if the payload cannot be serialized
    /// - `QueueError::MessageTooLarge` if it is over budget after truncation
    /// - `QueueError::Unavailable` if the store cannot be reached
    pub async fn send<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        ttl: Option<Duration>,
    ) -> Result<SendReceipt, QueueError> {
        let config = self.configuration(queue).await?;
        let keys = QueueKeys::for_queue(queue);
        let (item, receipt) = self.prepare(queue, &config, payload, 0, ttl, true)?;

        self.warn_if_deep(queue, &keys, &config).await;
        self.store
            .list_push(&keys.list, serde_json::to_string(&item)?)
            .await?;

        self.after_send(queue, &keys, &receipt).await;
        Ok(receipt)
    }

    /// Like [`send`](Self::send), but never truncates: a payload over the
    /// queue's budget is rejected whole.
    ///
    /// # Errors
    ///
    /// `QueueError::MessageTooLarge` with the untouched payload size, plus
    /// the errors of [`send`](Self::send).
    pub async fn send_intact<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        ttl: Option<Duration>,
    ) -> Result<SendReceipt, QueueError> {
        let config = self.configuration(queue).await?;
        let keys = QueueKeys::for_queue(queue);
        let (item, receipt) = self.prepare(queue, &config, payload, 0, ttl, false)?;

        self.warn_if_deep(queue, &keys, &config).await;
        self.store
            .list_push(&keys.list, serde_json::to_string(&item)?)
            .await?;

        self.after_send(queue, &keys, &receipt).await;
        Ok(receipt)
    }

    /// Inserts `payload` into the priority set of `queue`.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus `QueueError::PriorityNotEnabled` when the
    /// queue is FIFO-only.
    pub async fn send_priority<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        priority: i32,
        ttl: Option<Duration>,
    ) -> Result<SendReceipt, QueueError> {
        let config = self.configuration(queue).await?;
        if !config.enable_priority {
            return Err(QueueError::PriorityNotEnabled(queue.to_string()));
        }

        let keys = QueueKeys::for_queue(queue);
        let (item, receipt) = self.prepare(queue, &config, payload, priority, ttl, true)?;
        let score = priority_score(item.priority, item.timestamp);

        self.warn_if_deep(queue, &keys, &config).await;
        self.store
            .sorted_add(&keys.priority, serde_json::to_string(&item)?, score)
            .await?;

        self.after_send(queue, &keys, &receipt).await;
        Ok(receipt)
    }

    fn prepare<T: Serialize>(
        &self,
        queue: &str,
        config: &QueueConfiguration,
        payload: &T,
        priority: i32,
        ttl: Option<Duration>,
        allow_truncation: bool,
    ) -> Result<(QueueItem<Value>, SendReceipt), QueueError> {
        let value = serde_json::to_value(payload)?;
        let limit = config.max_message_size_bytes;

        let fitted = if allow_truncation {
            fit_to_budget(value, limit)?
        } else {
            let size = serialized_size(&value)?;
            if size <= limit {
                FitOutcome::Fits { value, size }
            } else {
                FitOutcome::TooLarge {
                    original_size: size,
                    size,
                }
            }
        };
        let (data, size, original_size, truncated) = match fitted {
            FitOutcome::Fits { value, size } => (value, size, size, false),
            FitOutcome::Truncated {
                value,
                original_size,
                size,
            } => {
                warn!(
                    queue = queue,
                    original_size = original_size,
                    truncated_size = size,
                    limit = limit,
                    "Message truncated to fit queue size limit"
                );
                (value, size, original_size, true)
            }
            FitOutcome::TooLarge { size, .. } => {
                return Err(QueueError::MessageTooLarge {
                    queue: queue.to_string(),
                    size,
                    limit,
                });
            }
        };

        let item = QueueItem::new(
            data,
            queue,
            priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            ttl.unwrap_or_else(|| config.default_ttl()),
            config.max_retries,
        );
        let receipt = SendReceipt {
            id: item.id,
            size_bytes: size,
            original_size_bytes: original_size,
            truncated,
        };
        Ok((item, receipt))
    }

    async fn warn_if_deep(&self, queue: &str, keys: &QueueKeys, config: &QueueConfiguration) {
        let depth = match self.depths(keys).await {
            Ok((fifo, priority)) => fifo + priority,
            Err(_) => return,
        };
        self.metrics.set_queue_depth(&self.metric_family(queue), depth);
        if depth >= config.max_queue_depth {
            warn!(
                queue = queue,
                depth = depth,
                max_depth = config.max_queue_depth,
                "Queue depth at or above configured maximum"
            );
        }
    }

    async fn after_send(&self, queue: &str, keys: &QueueKeys, receipt: &SendReceipt) {
        self.bump(queue, keys, counters::SENT).await;
        if receipt.truncated {
            self.bump(queue, keys, counters::TRUNCATED).await;
        }
        debug!(queue = queue, id = %receipt.id, size = receipt.size_bytes, "Message sent");
    }

    /// Pops the next deliverable message, or `None`.
    ///
    /// Priority queues drain the ordered set before the FIFO list. Expired
    /// and undecodable messages are discarded, logged, and reported as
    /// `None` so background consumers keep running.
    pub async fn receive<T: DeserializeOwned>(
        &self,
        queue: &str,
    ) -> Result<Option<QueueItem<T>>, QueueError> {
        let config = self.configuration(queue).await?;
        let keys = QueueKeys::for_queue(queue);

        let mut raw = None;
        if config.enable_priority {
            raw = self.store.sorted_pop_max(&keys.priority).await?;
        }
        if raw.is_none() {
            raw = self.store.list_pop(&keys.list).await?;
        }
        let Some(raw) = raw else {
            return Ok(None);
        };

        let item: QueueItem<T> = match serde_json::from_str(&raw) {
            Ok(item) => item,
            Err(e) => {
                warn!(queue = queue, error = %e, "Discarding undecodable message");
                self.bump(queue, &keys, counters::CORRUPT).await;
                return Ok(None);
            }
        };

        if item.is_expired() {
            warn!(
                queue = queue,
                id = %item.id,
                expired_at = %item.expires_at,
                "Discarding expired message"
            );
            self.bump(queue, &keys, counters::EXPIRED).await;
            return Ok(None);
        }

        self.bump(queue, &keys, counters::RECEIVED).await;
        Ok(Some(item))
    }

    /// Polls [`receive`](Self::receive) until a message arrives, `timeout`
    /// elapses or `cancel` fires.
    ///
    /// Returns `Ok(None)` on timeout or cancellation. Never polls faster
    /// than the configured poll interval.
    pub async fn receive_blocking<T: DeserializeOwned>(
        &self,
        queue: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<QueueItem<T>>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(item) = self.receive(queue).await? {
                return Ok(Some(item));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = (now + self.poll_interval).min(deadline);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Records successful processing of `item`.
    pub async fn acknowledge<T>(&self, item: &QueueItem<T>) -> Result<(), QueueError> {
        let keys = QueueKeys::for_queue(&item.queue_name);
        self.store
            .hash_incr(&keys.stats, counters::ACKNOWLEDGED, 1)
            .await?;
        self.metrics
            .record_queue_op(&item.queue_name, counters::ACKNOWLEDGED);
        Ok(())
    }

    /// Returns `item` to its queue or moves it to the dead letter list.
    ///
    /// With `requeue` and remaining retry budget the message goes back with
    /// its original id, priority, and expiry and one less retry; otherwise it is
    /// dead-lettered.
    pub async fn reject<T: Serialize>(
        &self,
        mut item: QueueItem<T>,
        requeue: bool,
        reason: &str,
    ) -> Result<RejectOutcome, QueueError> {
        let queue = item.queue_name.clone();
        let keys = QueueKeys::for_queue(&queue);
        self.bump(&queue, &keys, counters::REJECTED).await;

        if requeue && item.max_retries > 0 {
            item.max_retries -= 1;
            let config = self.configuration(&queue).await?;
            let serialized = serde_json::to_string(&item)?;
            if config.enable_priority {
                let score = priority_score(item.priority, item.timestamp);
                self.store
                    .sorted_add(&keys.priority, serialized, score)
                    .await?;
            } else {
                self.store.list_push_front(&keys.list, serialized).await?;
            }
            self.bump(&queue, &keys, counters::REQUEUED).await;
            debug!(queue = %queue, id = %item.id, remaining = item.max_retries, "Message requeued");
            return Ok(RejectOutcome::Requeued);
        }

        let entry = serde_json::json!({
            "item": item,
            "reason": reason,
            "moved_at": Utc::now().to_rfc3339(),
        });
        self.store
            .list_push(&keys.dead_letter, serde_json::to_string(&entry)?)
            .await?;
        self.bump(&queue, &keys, counters::DEAD_LETTERED).await;
        warn!(queue = %queue, id = %item.id, reason = reason, "Message moved to dead letter queue");
        Ok(RejectOutcome::DeadLettered)
    }

    /// Registers and persists a queue configuration.
    ///
    /// Without an explicit `config` the name is resolved as usual and the
    /// result persisted, so every process agrees on it.
    pub async fn create_queue(
        &self,
        name: &str,
        config: Option<QueueConfiguration>,
    ) -> Result<QueueConfiguration, QueueError> {
        let config = match config {
            Some(config) => config,
            None => self.configuration(name).await?,
        };
        if config.max_message_size_bytes == 0 {
            return Err(QueueError::InvalidConfiguration {
                queue: name.to_string(),
                reason: "max message size must be positive".to_string(),
            });
        }

        let keys = QueueKeys::for_queue(name);
        self.store
            .set(&keys.config, serde_json::to_string(&config)?)
            .await?;
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, config.clone());
        debug!(queue = name, "Queue created");
        Ok(config)
    }

    /// Removes all messages, configuration, and statistics of a queue.
    pub async fn delete_queue(&self, name: &str) -> Result<(), QueueError> {
        self.store.delete(&QueueKeys::for_queue(name).all()).await?;
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    /// Removes all pending messages, keeping configuration and statistics.
    pub async fn clear_queue(&self, name: &str) -> Result<(), QueueError> {
        self.store
            .delete(&QueueKeys::for_queue(name).message_keys())
            .await
    }

    /// Returns depths and counters for a queue.
    pub async fn stats(&self, name: &str) -> Result<QueueStats, QueueError> {
        let keys = QueueKeys::for_queue(name);
        let (fifo_depth, priority_depth) = self.depths(&keys).await?;
        let dead_letter_depth = self.store.list_len(&keys.dead_letter).await?;
        let counts = self.store.hash_get_all(&keys.stats).await?;
        let count = |field: &str| counts.get(field).copied().unwrap_or(0).max(0) as u64;

        Ok(QueueStats {
            queue_name: name.to_string(),
            fifo_depth,
            priority_depth,
            dead_letter_depth,
            sent: count(counters::SENT),
            received: count(counters::RECEIVED),
            acknowledged: count(counters::ACKNOWLEDGED),
            rejected: count(counters::REJECTED),
            requeued: count(counters::REQUEUED),
            dead_lettered: count(counters::DEAD_LETTERED),
            expired: count(counters::EXPIRED),
            corrupt: count(counters::CORRUPT),
            truncated: count(counters::TRUNCATED),
        })
    }

    /// Names of all queues with a registered configuration.
    pub fn known_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry_lookup(|r| r.names().cloned().collect());
        names.sort();
        names
    }

    /// Pushes a raw, already-serialized message. Used for fault injection.
    #[doc(hidden)]
    pub async fn push_raw(&self, queue: &str, raw: String) -> Result<(), QueueError> {
        self.store
            .list_push(&QueueKeys::for_queue(queue).list, raw)
            .await
    }

    fn metric_family(&self, queue: &str) -> String {
        self.registry_lookup(|r| r.metric_family(queue).to_string())
    }

    async fn depths(&self, keys: &QueueKeys) -> Result<(usize, usize), QueueError> {
        let fifo = self.store.list_len(&keys.list).await?;
        let priority = self.store.sorted_len(&keys.priority).await?;
        Ok((fifo, priority))
    }

    /// Best-effort statistics bump; failures are logged, never returned.
    async fn bump(&self, queue: &str, keys: &QueueKeys, field: &str) {
        self.metrics.record_queue_op(&self.metric_family(queue), field);
        if let Err(e) = self.store.hash_incr(&keys.stats, field, 1).await {
            debug!(queue = queue, field = field, error = %e, "Failed to update queue statistics");
        }
    }
}
