//! Cache Service
//!
//! Key/value cache trait and its Redis implementation, used as the backing
//! store of presence entries.
//!
//! This module provides:
//! - A `KeyValueCache` trait defining the presence cache contract
//! - A `RedisCache` implementation using Redis as the backing store
//! - Cursor-bounded scan helpers that always terminate
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::infrastructure::cache::{KeyValueCache, RedisCache};
//!
//! let cache = RedisCache::new(redis_connection);
//!
//! cache.set_ex("presence:U1", r#"{"user_id":"U1"}"#, 300).await?;
//! let keys = cache.scan_match("presence:*").await?;
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use tracing::{debug, instrument, warn};

use crate::shared::error::CacheError;

/// Keys requested per SCAN round.
const SCAN_BATCH: usize = 100;

/// Upper bound on SCAN rounds for a single operation.
pub const MAX_SCAN_ROUNDS: usize = 10_000;

/// GET and DEL in one server-side step.
static DELETE_IF_EQ: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#,
    )
});

/// Presence cache contract.
///
/// Values are opaque strings; callers own the encoding. Patterns follow
/// Redis glob syntax (`*`, `?`, `\` escapes).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Round-trip to the backend.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Retrieves a value by key; `Ok(None)` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores a value with a time-to-live in seconds.
    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), CacheError>;

    /// Deletes a key; `Ok(true)` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Deletes a key only while it still holds `expected`; `Ok(true)` if it did.
    ///
    /// The comparison and the delete are one atomic step.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Every key matching the pattern, found by cursor iteration.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Deletes every key matching the pattern; returns how many were removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError>;
}

/// Redis-backed cache implementation.
///
/// Uses a Redis ConnectionManager for efficient connection pooling and
/// automatic reconnection handling.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// One SCAN round starting at `cursor`.
    async fn scan_round(&self, cursor: u64, pattern: &str) -> Result<(u64, Vec<String>), CacheError> {
        let mut conn = self.conn.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        debug!(key = %key, hit = value.is_some(), "Cache get");
        Ok(value)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, seconds).await?;
        debug!(key = %key, ttl = seconds, "Cache set with expiry");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(key).await?;
        debug!(key = %key, deleted = deleted > 0, "Cache delete");
        Ok(deleted > 0)
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: u64 = DELETE_IF_EQ
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %key, deleted = deleted > 0, "Cache compare and delete");
        Ok(deleted > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        // SCAN may return a key more than once
        let mut found = BTreeSet::new();
        let mut cursor = 0u64;

        for _ in 0..MAX_SCAN_ROUNDS {
            let (next, keys) = self.scan_round(cursor, pattern).await?;
            found.extend(keys);
            if next == 0 {
                return Ok(found.into_iter().collect());
            }
            cursor = next;
        }

        warn!(pattern = %pattern, rounds = MAX_SCAN_ROUNDS, "Scan round limit reached");
        Ok(found.into_iter().collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut deleted = 0u64;
        let mut cursor = 0u64;

        for _ in 0..MAX_SCAN_ROUNDS {
            let (next, keys) = self.scan_round(cursor, pattern).await?;
            if !keys.is_empty() {
                let mut conn = self.conn.clone();
                let removed: u64 = conn.del(keys.as_slice()).await?;
                deleted += removed;
            }
            if next == 0 {
                debug!(pattern = %pattern, deleted, "Cache delete matching");
                return Ok(deleted);
            }
            cursor = next;
        }

        warn!(pattern = %pattern, rounds = MAX_SCAN_ROUNDS, deleted, "Scan round limit reached");
        Ok(deleted)
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}
