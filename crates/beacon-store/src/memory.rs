//! In-process backend for the store and bus traits.
//!
//! Backs unit tests and store-less development runs. Expiry is lazy: an
//! entry past its deadline reads as absent and is dropped on access. The
//! bus is a process-local broadcast channel, so "cross-instance" delivery
//! loops back to local subscribers the same way Redis pub/sub does.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::traits::{BusMessage, EventBus, KeyValueStore, StoreError};

/// Buffered bus messages per subscriber before lagging drops old ones.
const BUS_CAPACITY: usize = 256;

/// In-memory key-value store and loopback bus.
pub struct MemoryStore {
    entries: DashMap<String, (String, Instant)>,
    bus: broadcast::Sender<BusMessage>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            entries: DashMap::new(),
            bus,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (value, deadline) = entry.value();
                if Instant::now() < *deadline {
                    return Ok(Some(value.clone()));
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && now < entry.value().1)
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[async_trait]
impl EventBus for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // A send with no subscribers is not an error; pub/sub is fire-and-forget.
        let _ = self.bus.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, BusMessage>, StoreError> {
        let wanted = channels.to_vec();
        let rx = self.bus.subscribe();

        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if wanted.contains(&msg.channel) => return Some((msg, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(stream)
    }
}
