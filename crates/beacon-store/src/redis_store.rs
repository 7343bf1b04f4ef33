//! Redis backend for the store and bus traits.
//!
//! One `redis::Client` serves both concerns: a multiplexed
//! `ConnectionManager` for commands, and a dedicated pub/sub connection per
//! `subscribe` call (Redis requires pub/sub connections to be exclusive).

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use crate::traits::{BusMessage, EventBus, KeyValueStore, StoreError};

/// Page size for cursor-based SCAN.
const SCAN_PAGE_SIZE: usize = 100;

/// Redis-backed key-value store and pub/sub bus.
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and build the shared command connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        info!("Connected to Redis");
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await?;

            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "Scanned keys");
        Ok(keys)
    }
}

#[async_trait]
impl EventBus for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, BusMessage>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        info!(channels = ?channels, "Subscribed to bus channels");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(BusMessage { channel, payload }),
                    Err(_) => None,
                }
            })
            .boxed();

        Ok(stream)
    }
}
