//! Backing key-value store abstraction.
//!
//! The message queue only needs list, ordered-set, string and hash
//! primitives. [`RedisStore`](super::redis_store::RedisStore) provides them
//! for multi-process deployments; [`MemoryStore`] provides them in-process.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ordered_float::OrderedFloat;

use crate::error::QueueError;

/// Primitive operations the queue store is built on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Pushes a value onto the head of a list.
    async fn list_push(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Pops a value from the tail of a list (FIFO with [`list_push`](Self::list_push)).
    async fn list_pop(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Pushes a value onto the tail of a list so it is popped next.
    async fn list_push_front(&self, key: &str, value: String) -> Result<(), QueueError>;

    async fn list_len(&self, key: &str) -> Result<usize, QueueError>;

    /// Adds a member to an ordered set with the given score.
    async fn sorted_add(&self, key: &str, member: String, score: f64) -> Result<(), QueueError>;

    /// Atomically removes and returns the highest-scoring member.
    async fn sorted_pop_max(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn sorted_len(&self, key: &str) -> Result<usize, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Deletes the given keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), QueueError>;

    /// Increments a counter field in a hash.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<(), QueueError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, QueueError>;
}

type SortedEntry = (OrderedFloat<f64>, Reverse<u64>, String);

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, BTreeSet<SortedEntry>>,
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, i64>>,
    sequence: u64,
}

/// In-process store for single-process runs and tests.
///
/// Equal scores pop in insertion order.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn list_push(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.with_state(|s| s.lists.entry(key.to_string()).or_default().push_front(value));
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.with_state(|s| s.lists.get_mut(key).and_then(VecDeque::pop_back)))
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.with_state(|s| s.lists.entry(key.to_string()).or_default().push_back(value));
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self.with_state(|s| s.lists.get(key).map_or(0, VecDeque::len)))
    }

    async fn sorted_add(&self, key: &str, member: String, score: f64) -> Result<(), QueueError> {
        self.with_state(|s| {
            s.sequence += 1;
            let seq = s.sequence;
            let set = s.sorted.entry(key.to_string()).or_default();
            // Sorted-set semantics: re-adding a member replaces its score.
            set.retain(|(_, _, existing)| existing != &member);
            set.insert((OrderedFloat(score), Reverse(seq), member));
        });
        Ok(())
    }

    async fn sorted_pop_max(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.with_state(|s| {
            s.sorted
                .get_mut(key)
                .and_then(BTreeSet::pop_last)
                .map(|(_, _, member)| member)
        }))
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self.with_state(|s| s.sorted.get(key).map_or(0, BTreeSet::len)))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.with_state(|s| s.strings.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.with_state(|s| s.strings.insert(key.to_string(), value));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), QueueError> {
        self.with_state(|s| {
            for key in keys {
                s.lists.remove(key);
                s.sorted.remove(key);
                s.strings.remove(key);
                s.hashes.remove(key);
            }
        });
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<(), QueueError> {
        self.with_state(|s| {
            *s.hashes
                .entry(key.to_string())
                .or_default()
                .entry(field.to_string())
                .or_insert(0) += delta;
        });
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, QueueError> {
        Ok(self.with_state(|s| s.hashes.get(key).cloned().unwrap_or_default()))
    }
}
