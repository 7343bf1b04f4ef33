//! Presence store bridge.
//!
//! Presence records live in the TTL store under `presence:{user_id}`, so a
//! crashed gateway that never wrote its disconnects self-heals within one
//! TTL. Absence of the key is equivalent to offline. The record is
//! last-write-wins: a user connected through two instances shows whichever
//! instance wrote most recently.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use beacon_protocol::PresenceStatus;

use crate::traits::{KeyValueStore, StoreError};

/// Key prefix for presence records.
const PRESENCE_KEY_PREFIX: &str = "presence:";

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn presence_key(user_id: &str) -> String {
    format!("{PRESENCE_KEY_PREFIX}{user_id}")
}

/// A user's presence record as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub username: String,
    pub status: PresenceStatus,
    /// The connection that wrote this record most recently.
    pub connection_id: String,
    /// Epoch milliseconds of the last write.
    pub last_seen: u64,
}

/// Typed presence operations over a TTL key-value store.
#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl PresenceStore {
    /// Create a bridge writing records with the given TTL.
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Write a presence record with a fresh TTL.
    ///
    /// Called at connect (online), on every heartbeat (sliding refresh), and
    /// at disconnect (an explicit offline write, not a delete, so late
    /// readers still see it until natural expiry).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable; callers log and skip.
    pub async fn set_presence(
        &self,
        user_id: &str,
        username: &str,
        status: PresenceStatus,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        let record = UserPresence {
            user_id: user_id.to_string(),
            username: username.to_string(),
            status,
            connection_id: connection_id.to_string(),
            last_seen: epoch_ms(),
        };
        let value = serde_json::to_string(&record)?;
        self.store
            .set_with_ttl(&presence_key(user_id), &value, self.ttl)
            .await
    }

    /// Read a user's presence record. `None` means offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn get_presence(&self, user_id: &str) -> Result<Option<UserPresence>, StoreError> {
        match self.store.get(&presence_key(user_id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Read every live presence record, paging through the key space.
    ///
    /// Records that vanish between the scan and the read (TTL races) are
    /// skipped; unparseable records are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn scan_all(&self) -> Result<Vec<UserPresence>, StoreError> {
        let pattern = format!("{PRESENCE_KEY_PREFIX}*");
        let mut records = Vec::new();

        for key in self.store.scan_keys(&pattern).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str(&value) {
                Ok(record) => records.push(record),
                Err(error) => warn!(key = %key, %error, "Skipping unparseable presence record"),
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn presence_over_memory(ttl_secs: u64) -> PresenceStore {
        PresenceStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(ttl_secs))
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let presence = presence_over_memory(300);
        presence
            .set_presence("u1", "alice", PresenceStatus::Online, "conn-1")
            .await
            .unwrap();

        let record = presence.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.status, PresenceStatus::Online);
        assert_eq!(record.connection_id, "conn-1");
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_offline() {
        let presence = presence_over_memory(300);
        assert!(presence.get_presence("ghost").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefreshed_presence_expires() {
        let presence = presence_over_memory(300);
        presence
            .set_presence("u1", "alice", PresenceStatus::Online, "conn-1")
            .await
            .unwrap();

        // No heartbeat refresh and no disconnect write: the record must
        // still become unobservable once the TTL elapses.
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(presence.get_presence("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_write_is_visible_until_expiry() {
        let presence = presence_over_memory(300);
        presence
            .set_presence("u1", "alice", PresenceStatus::Online, "conn-1")
            .await
            .unwrap();
        presence
            .set_presence("u1", "alice", PresenceStatus::Offline, "conn-1")
            .await
            .unwrap();

        let record = presence.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_scan_all_returns_records() {
        let presence = presence_over_memory(300);
        presence
            .set_presence("u1", "alice", PresenceStatus::Online, "c1")
            .await
            .unwrap();
        presence
            .set_presence("u2", "bob", PresenceStatus::Online, "c2")
            .await
            .unwrap();

        let mut usernames: Vec<String> = presence
            .scan_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.username)
            .collect();
        usernames.sort();
        assert_eq!(usernames, vec!["alice".to_string(), "bob".to_string()]);
    }
}
