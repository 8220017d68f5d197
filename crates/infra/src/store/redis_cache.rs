//! Redis-backed volatile cache.
//!
//! Layout, under a configurable key prefix:
//! - `{prefix}:timeline`: sorted set of record ids scored by `created_at`
//!   in epoch microseconds (exact in an `f64` score)
//! - `{prefix}:records`: hash of record id to JSON-encoded record
//!
//! The sorted set drives ordering, eviction and range removal; the hash holds
//! the payloads. Equal scores are ranked by member, and the hyphenated id
//! string sorts like the id itself, so ties resolve as in Postgres.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use attackmap_core::EventRecord;

use super::r#trait::{StoreError, VolatileCache};

const DEFAULT_PREFIX: &str = "attackmap";

#[derive(Clone)]
pub struct RedisEventCache {
    conn: ConnectionManager,
    prefix: String,
    max_records: usize,
}

impl fmt::Debug for RedisEventCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventCache")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .field("max_records", &self.max_records)
            .finish()
    }
}

impl RedisEventCache {
    pub async fn connect(redis_url: &str, max_records: usize) -> Result<Self, StoreError> {
        info!(url = %redis_url, "connecting to redis cache");

        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("failed to create redis client: {e}")))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to redis: {e}")))?;

        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            max_records,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn timeline_key(&self) -> String {
        format!("{}:timeline", self.prefix)
    }

    fn records_key(&self) -> String {
        format!("{}:records", self.prefix)
    }

    /// Trim the timeline to `max_records`, dropping the lowest scores first.
    async fn evict_overflow(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        let len: usize = redis::cmd("ZCARD")
            .arg(self.timeline_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZCARD", e))?;

        let Some(stop) = overflow_stop(len, self.max_records) else {
            return Ok(());
        };

        let evicted: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.timeline_key())
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGE", e))?;

        debug!(evicted = evicted.len(), "cache over capacity");
        self.forget(&evicted).await
    }

    async fn forget(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.timeline_key())
            .arg(ids)
            .ignore()
            .cmd("HDEL")
            .arg(self.records_key())
            .arg(ids)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZREM/HDEL", e))?;
        Ok(())
    }
}

#[async_trait]
impl VolatileCache for RedisEventCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn capacity(&self) -> usize {
        self.max_records
    }

    async fn put(&self, records: &[EventRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            let id = record.id.to_string();
            let json = serde_json::to_string(record)
                .map_err(|e| StoreError::Corrupt(format!("failed to serialize record: {e}")))?;
            pipe.cmd("HSET")
                .arg(self.records_key())
                .arg(&id)
                .arg(json)
                .ignore();
            pipe.cmd("ZADD")
                .arg(self.timeline_key())
                .arg(score_of(record.created_at))
                .arg(&id)
                .ignore();
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HSET/ZADD", e))?;

        self.evict_overflow().await
    }

    async fn update(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let id = record.id.to_string();

        let cached: bool = redis::cmd("HEXISTS")
            .arg(self.records_key())
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HEXISTS", e))?;
        if !cached {
            return Ok(());
        }

        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::Corrupt(format!("failed to serialize record: {e}")))?;
        let _: () = redis::cmd("HSET")
            .arg(self.records_key())
            .arg(&id)
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HSET", e))?;
        Ok(())
    }

    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.timeline_key())
            .arg("-inf")
            .arg(exclusive_bound(cutoff))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;

        self.forget(&expired).await?;
        Ok(expired.len() as u64)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.timeline_key())
            .arg(self.records_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("DEL", e))?;
        Ok(())
    }

    async fn recent(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();

        let min = since.map(|s| score_of(s).to_string()).unwrap_or_else(|| "-inf".to_string());
        let ids: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(self.timeline_key())
            .arg("+inf")
            .arg(min)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZREVRANGEBYSCORE", e))?;

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.records_key())
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HMGET", e))?;

        // Entries evicted between the two reads come back as nil and are skipped.
        payloads
            .into_iter()
            .flatten()
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| StoreError::Corrupt(format!("failed to deserialize cached record: {e}")))
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("PING", e))?;
        Ok(())
    }
}

fn score_of(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

/// `(us` excludes the bound itself, matching `created_at < cutoff`.
fn exclusive_bound(cutoff: DateTime<Utc>) -> String {
    format!("({}", score_of(cutoff))
}

/// Last rank to drop so that `max` entries remain, if any must go.
fn overflow_stop(len: usize, max: usize) -> Option<usize> {
    (len > max).then(|| len - max - 1)
}

fn map_redis_error(command: &str, err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        StoreError::Unavailable(format!("redis {command} failed: {err}"))
    } else {
        StoreError::Backend(format!("redis {command} failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attackmap_core::EventId;
    use chrono::TimeZone;

    #[test]
    fn cutoff_bound_is_exclusive_microseconds() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(score_of(at), 1_700_000_000_123_456);
        assert_eq!(exclusive_bound(at), "(1700000000123456");
    }

    #[test]
    fn scores_keep_sub_millisecond_order_exactly() {
        let a = Utc.timestamp_opt(1_700_000_000, 123_001_000).unwrap();
        let b = Utc.timestamp_opt(1_700_000_000, 123_002_000).unwrap();
        assert!((score_of(a) as f64) < (score_of(b) as f64));
    }

    #[test]
    fn member_strings_sort_like_ids() {
        let mut ids: Vec<EventId> = (0..32).map(|i| EventId::stable("radar", &i.to_string())).collect();
        let mut members: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        ids.sort();
        members.sort();
        assert_eq!(members, ids.iter().map(|id| id.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn overflow_keeps_newest_max() {
        assert_eq!(overflow_stop(5, 10), None);
        assert_eq!(overflow_stop(10, 10), None);
        assert_eq!(overflow_stop(11, 10), Some(0));
        assert_eq!(overflow_stop(15, 10), Some(4));
    }
}
