//! Typing indicator store bridge.
//!
//! Typing indicators are written under `typing:{room_id}:{user_id}` with a
//! short TTL. There is no "stopped typing" signal: clients treat indicator
//! absence after the TTL as stopped, and the gateway pushes a broadcast the
//! moment the indicator is set.

use std::sync::Arc;
use std::time::Duration;

use crate::traits::{KeyValueStore, StoreError};

fn typing_key(room_id: &str, user_id: &str) -> String {
    format!("typing:{room_id}:{user_id}")
}

/// Typed typing-indicator operations over a TTL key-value store.
#[derive(Clone)]
pub struct TypingStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl TypingStore {
    /// Create a bridge writing indicators with the given TTL.
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mark a user as typing in a room until the TTL elapses.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable; callers log and skip.
    pub async fn set_typing(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
    ) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(&typing_key(room_id, user_id), username, self.ttl)
            .await
    }
}
