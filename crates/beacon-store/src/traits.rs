//! Store and bus boundary traits.
//!
//! These traits define the interface the gateway needs from its soft-state
//! backend, allowing the core to run against Redis in production and an
//! in-memory backend in tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Bus channel carrying presence updates; every instance delivers them as a
/// global broadcast.
pub const PRESENCE_CHANNEL: &str = "presence:updates";

/// Bus channel carrying room-scoped broadcasts; the payload names the room.
pub const MESSAGE_CHANNEL: &str = "message:broadcast";

/// Store and bus errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or dropped the operation.
    #[error("Store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A stored record failed to serialize or parse.
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A message received from a pub/sub bus subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message arrived on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// A key-value store with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set a key with a fresh TTL, overwriting any previous value and expiry.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Get a key's value. Expired and absent keys both read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// List keys matching a glob-style pattern.
    ///
    /// Implementations must page through the key space with a cursor rather
    /// than issue one blocking full-keyspace command.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// A publish/subscribe bus for cross-instance fan-out.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload to a channel (fire-and-forget, at-most-once).
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a set of channels, yielding messages until the backend
    /// connection drops.
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, BusMessage>, StoreError>;
}
