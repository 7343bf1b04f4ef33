//! # beacon-store
//!
//! Soft-state store and pub/sub bus clients for the Beacon gateway.
//!
//! Presence and typing indicators are soft state: valid only while
//! periodically refreshed, expiring on their own via TTL. This crate
//! provides the boundary to the store that holds them:
//!
//! - **KeyValueStore / EventBus** - backend traits
//! - **RedisStore** - the production backend, implementing both
//! - **MemoryStore** - an in-process backend for tests and store-less runs
//! - **PresenceStore / TypingStore** - typed bridges over a backend
//!
//! Store failures are recoverable by design: callers log and skip the
//! failing operation, and the gateway keeps serving local traffic.

pub mod memory;
pub mod presence;
pub mod redis_store;
pub mod traits;
pub mod typing;

pub use memory::MemoryStore;
pub use presence::{PresenceStore, UserPresence};
pub use redis_store::RedisStore;
pub use traits::{
    BusMessage, EventBus, KeyValueStore, StoreError, MESSAGE_CHANNEL, PRESENCE_CHANNEL,
};
pub use typing::TypingStore;
