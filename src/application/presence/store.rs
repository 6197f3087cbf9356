//! Presence Store
//!
//! Records which users are online and on which instance, as JSON entries
//! under `<key_prefix><user id>` in the key/value cache.
//!
//! Writes (`set_online`, `clear`) are best-effort: a cache outage is logged
//! and counted but never fails a chat operation. Reads surface their errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PresenceSettings;
use crate::infrastructure::cache::pattern::{prefix_pattern, suffix_pattern};
use crate::infrastructure::cache::KeyValueCache;
use crate::infrastructure::metrics;
use crate::shared::error::PresenceError;

/// One online user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub instance_id: String,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>, instance_id: impl Into<String>, connection_id: Uuid) -> Self {
        Self {
            user_id: user_id.into(),
            instance_id: instance_id.into(),
            connection_id,
            connected_at: Utc::now(),
        }
    }
}

pub struct PresenceStore {
    cache: Arc<dyn KeyValueCache>,
    key_prefix: String,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(cache: Arc<dyn KeyValueCache>, settings: &PresenceSettings) -> Self {
        Self {
            cache,
            key_prefix: settings.key_prefix.clone(),
            ttl: settings.ttl(),
        }
    }

    /// Cache key of a user's entry.
    pub fn key(&self, user_id: &str) -> String {
        format!("{}{}", self.key_prefix, user_id)
    }

    /// Configured entry expiry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn ping(&self) -> Result<(), PresenceError> {
        Ok(self.cache.ping().await?)
    }

    /// Store or refresh an entry. Best-effort.
    pub async fn set_online(&self, entry: &PresenceEntry, ttl: Duration) {
        let key = self.key(&entry.user_id);
        let value = match serde_json::to_string(entry) {
            Ok(value) => value,
            Err(e) => {
                metrics::record_presence_failure("set_online");
                warn!(user_id = %entry.user_id, error = %e, "Failed to encode presence entry");
                return;
            }
        };

        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        match self.cache.set_ex(&key, &value, seconds).await {
            Ok(()) => debug!(user_id = %entry.user_id, ttl = seconds, "Presence set"),
            Err(e) => {
                metrics::record_presence_failure("set_online");
                warn!(user_id = %entry.user_id, error = %e, "Failed to set presence");
            }
        }
    }

    /// Remove the entry written for this connection, leaving a newer one in
    /// place. Best-effort.
    pub async fn clear_if(&self, entry: &PresenceEntry) {
        let key = self.key(&entry.user_id);
        let expected = match serde_json::to_string(entry) {
            Ok(value) => value,
            Err(e) => {
                metrics::record_presence_failure("clear");
                warn!(user_id = %entry.user_id, error = %e, "Failed to encode presence entry");
                return;
            }
        };

        match self.cache.delete_if_eq(&key, &expected).await {
            Ok(true) => debug!(user_id = %entry.user_id, connection_id = %entry.connection_id, "Presence cleared"),
            Ok(false) => debug!(
                user_id = %entry.user_id,
                connection_id = %entry.connection_id,
                "Presence belongs to another connection, kept"
            ),
            Err(e) => {
                metrics::record_presence_failure("clear");
                warn!(user_id = %entry.user_id, error = %e, "Failed to clear presence");
            }
        }
    }

    /// Remove a user's entry whatever connection wrote it. Best-effort.
    pub async fn clear(&self, user_id: &str) {
        match self.cache.delete(&self.key(user_id)).await {
            Ok(existed) => debug!(user_id = %user_id, existed, "Presence cleared"),
            Err(e) => {
                metrics::record_presence_failure("clear");
                warn!(user_id = %user_id, error = %e, "Failed to clear presence");
            }
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Result<Option<PresenceEntry>, PresenceError> {
        match self.cache.get(&self.key(user_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// The single key starting with `prefix`.
    ///
    /// `Ok(None)` when nothing matches; `PresenceError::Ambiguous` when more
    /// than one key does.
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Option<String>, PresenceError> {
        self.find_unique(prefix_pattern(prefix)).await
    }

    /// The single key ending with `suffix`.
    pub async fn find_by_suffix(&self, suffix: &str) -> Result<Option<String>, PresenceError> {
        self.find_unique(suffix_pattern(suffix)).await
    }

    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, PresenceError> {
        Ok(self.cache.delete_matching(&prefix_pattern(prefix)).await?)
    }

    pub async fn delete_by_suffix(&self, suffix: &str) -> Result<u64, PresenceError> {
        Ok(self.cache.delete_matching(&suffix_pattern(suffix)).await?)
    }

    /// Delete every entry under the presence namespace.
    pub async fn purge(&self) -> Result<u64, PresenceError> {
        let deleted = self.cache.delete_matching(&prefix_pattern(&self.key_prefix)).await?;
        info!(deleted, prefix = %self.key_prefix, "Presence entries purged");
        Ok(deleted)
    }

    async fn find_unique(&self, pattern: String) -> Result<Option<String>, PresenceError> {
        let mut keys = self.cache.scan_match(&pattern).await?;
        match keys.len() {
            0 => Ok(None),
            1 => Ok(keys.pop()),
            matches => Err(PresenceError::Ambiguous { pattern, matches }),
        }
    }
}

impl std::fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
