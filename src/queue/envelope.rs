//! Message envelope stored on the queues.
//!
//! Wire format (JSON):
//!
//! ```text
//! {"id", "data", "timestamp", "expiresAt", "priority", "queueName", "maxRetries"}
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping a queued payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem<T> {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The payload.
    pub data: T,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// When the message stops being deliverable.
    pub expires_at: DateTime<Utc>,
    /// Priority (higher values are more urgent).
    pub priority: i32,
    /// Owning queue.
    pub queue_name: String,
    /// Remaining redelivery budget.
    pub max_retries: u32,
}

impl<T> QueueItem<T> {
    /// Wraps `data` with a fresh id and an expiry `ttl` from now.
    ///
    /// A zero `ttl` is bumped to one millisecond so that expiry is always
    /// strictly after creation.
    pub fn new(
        data: T,
        queue_name: impl Into<String>,
        priority: i32,
        ttl: Duration,
        max_retries: u32,
    ) -> Self {
        let timestamp = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365))
            .max(chrono::Duration::milliseconds(1));
        Self {
            id: Uuid::new_v4(),
            data,
            timestamp,
            expires_at: timestamp + ttl,
            priority,
            queue_name: queue_name.into(),
            max_retries,
        }
    }

    /// Returns whether the message must no longer be delivered.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Replaces the payload, keeping the envelope metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueueItem<U> {
        QueueItem {
            id: self.id,
            data: f(self.data),
            timestamp: self.timestamp,
            expires_at: self.expires_at,
            priority: self.priority,
            queue_name: self.queue_name,
            max_retries: self.max_retries,
        }
    }
}
