//! Cache Module
//!
//! Redis connection management and the key/value cache behind presence.
//!
//! This module provides:
//! - Redis connection management with bounded startup retries
//! - A `KeyValueCache` trait abstracting the cache operations presence needs
//! - A `RedisCache` implementation and an in-process `MemoryCache`
//! - Glob helpers for prefix and suffix scans
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! |   PresenceStore   |
//! +-------------------+
//!          |
//!          v
//! +-------------------+
//! | KeyValueCache     |  <-- Abstract interface
//! +-------------------+
//!      |         |
//!      v         v
//! RedisCache  MemoryCache
//!      |
//!      v
//! +-------------------+
//! | ConnectionManager |  <-- Redis connection pool
//! +-------------------+
//! ```

mod cache_service;
mod memory;
pub mod pattern;

pub use cache_service::{KeyValueCache, RedisCache, MAX_SCAN_ROUNDS};
#[cfg(test)]
pub use cache_service::MockKeyValueCache;
pub use memory::MemoryCache;

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::{sleep, timeout};
use tracing::{info, instrument, warn};

use crate::config::RedisSettings;
use crate::shared::error::StartupError;

/// Creates the presence cache connection manager.
///
/// The connection manager handles connection pooling and automatic
/// reconnection once the first connection is up.
///
/// # Errors
/// `StartupError::Unreachable` when every attempt fails.
#[instrument(skip(settings))]
pub async fn create_redis_client(settings: &RedisSettings) -> Result<ConnectionManager, StartupError> {
    connect_with_retry(
        "presence cache",
        &settings.url,
        settings.connect_attempts,
        settings.dial_timeout(),
        settings.connect_backoff(),
    )
    .await
}

/// Creates a `RedisCache` instance from configuration settings.
pub async fn create_redis_cache(settings: &RedisSettings) -> Result<RedisCache, StartupError> {
    let conn = create_redis_client(settings).await?;
    Ok(RedisCache::new(conn))
}

/// Dial Redis at most `attempts` times, waiting `backoff` between tries.
pub async fn connect_with_retry(
    dependency: &'static str,
    url: &str,
    attempts: u32,
    dial_timeout: Duration,
    backoff: Duration,
) -> Result<ConnectionManager, StartupError> {
    let client = Client::open(url)?;
    let attempts = attempts.max(1);
    let mut reason = String::new();

    for attempt in 1..=attempts {
        info!(dependency, attempt, "Connecting to Redis...");
        match timeout(dial_timeout, ConnectionManager::new(client.clone())).await {
            Ok(Ok(manager)) => {
                info!(dependency, "Redis connection established");
                return Ok(manager);
            }
            Ok(Err(e)) => reason = e.to_string(),
            Err(_) => reason = format!("dial timed out after {:?}", dial_timeout),
        }

        warn!(dependency, attempt, attempts, error = %reason, "Redis connection attempt failed");
        if attempt < attempts {
            sleep(backoff).await;
        }
    }

    Err(StartupError::Unreachable {
        dependency,
        attempts,
        reason,
    })
}
