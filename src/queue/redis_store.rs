//! Redis-backed key-value store.
//!
//! FIFO lists use `LPUSH`/`RPOP`, priority sets use `ZADD`/`ZPOPMAX` (the
//! pop is atomic on the server, so concurrent consumers never receive the
//! same member), statistics use `HINCRBY`.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::store::KeyValueStore;
use crate::error::QueueError;

/// Key-value store backed by a shared Redis server.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Unavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Unavailable(format!("invalid Redis URL: {}", e)))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self { redis })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn list_push(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn sorted_add(&self, key: &str, member: String, score: f64) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_pop_max(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        // Reply is a flat [member, score] array, empty when the set is empty.
        let reply: Vec<String> = redis::cmd("ZPOPMAX")
            .arg(key)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(reply.into_iter().next())
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), QueueError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.del(key);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, QueueError> {
        let mut conn = self.redis.clone();
        let values: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }
}
