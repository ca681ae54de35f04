//! Durable priority queues over a shared key-value store.
//!
//! This module provides the queue layer every dispatcher and worker talks
//! through:
//!
//! - **MessageQueue**: FIFO + priority queue with size budgets and statistics
//! - **KeyValueStore**: the backing store seam (Redis or in-memory)
//! - **QueueConfigRegistry**: explicit per-queue configuration
//!
//! # Key Layout
//!
//! ```text
//!   Q                  FIFO list
//!   Q:priority         ordered set, score = priority * 10^13 - unix_millis
//!   Q:dead_letter      rejected messages
//!   queue:config:Q     persisted QueueConfiguration
//!   queue:stats:Q      counters hash
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swarm_dispatch::queue::{names, MessageQueue, QueueConfigRegistry, RedisStore};
//!
//! let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//! let queue = MessageQueue::new(store, QueueConfigRegistry::with_predefined());
//!
//! queue.send_priority(names::FUNCTION_ASSIGNMENTS, &assignment, 5, None).await?;
//! let item = queue.receive::<FunctionAssignment>(names::FUNCTION_ASSIGNMENTS).await?;
//! ```

pub mod config;
pub mod envelope;
pub mod message_queue;
pub mod naming;
pub mod redis_store;
pub mod store;
pub mod truncate;

pub use config::{predefined_configs, QueueConfigRegistry, QueueConfiguration};
pub use envelope::QueueItem;
pub use message_queue::{
    priority_score, MessageQueue, QueueStats, RejectOutcome, SendReceipt, DEFAULT_POLL_INTERVAL,
};
pub use naming::{completion_queue_for, names, QueueKeys};
pub use redis_store::RedisStore;
pub use store::{KeyValueStore, MemoryStore};
