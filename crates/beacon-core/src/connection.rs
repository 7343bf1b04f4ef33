//! Live connection records.
//!
//! A `Connection` is created on successful handshake and owned by the
//! registry for its lifetime. The heartbeat timestamp is an atomic so the
//! owning connection's tasks and the watchdog can share it lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use beacon_protocol::ServerMessage;
use dashmap::DashSet;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Wall-clock time in milliseconds since the UNIX epoch.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An item queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A protocol frame to serialize and send.
    Frame(ServerMessage),
    /// Close the socket with the given code, then stop writing.
    Close { code: u16, reason: String },
}

/// One live socket and its gateway-side state.
#[derive(Debug)]
pub struct Connection {
    id: String,
    /// Verified user id from the handshake token.
    pub user_id: String,
    /// Verified username from the handshake token.
    pub username: String,
    /// When the connection registered (epoch milliseconds).
    pub connected_at: u64,
    /// Last application-level ping (epoch milliseconds).
    last_heartbeat: AtomicU64,
    /// Room ids this connection is subscribed to.
    pub subscriptions: DashSet<String>,
    /// Handle to the connection's writer task.
    sender: UnboundedSender<Outbound>,
}

impl Connection {
    /// Create a new connection record with a fresh unique id.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        sender: UnboundedSender<Outbound>,
    ) -> Self {
        let now = epoch_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            username: username.into(),
            connected_at: now,
            last_heartbeat: AtomicU64::new(now),
            subscriptions: DashSet::new(),
            sender,
        }
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record a heartbeat at the current time.
    pub fn touch_heartbeat(&self) {
        self.touch_heartbeat_at(epoch_ms());
    }

    /// Record a heartbeat at an explicit timestamp (epoch milliseconds).
    pub fn touch_heartbeat_at(&self, at_ms: u64) {
        self.last_heartbeat.store(at_ms, Ordering::Relaxed);
    }

    /// Time since the last heartbeat.
    #[must_use]
    pub fn heartbeat_age(&self) -> Duration {
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        Duration::from_millis(epoch_ms().saturating_sub(last))
    }

    /// Queue an item for the writer task.
    ///
    /// Returns `false` if the writer is gone, which means the connection is
    /// already tearing down.
    pub fn send(&self, outbound: Outbound) -> bool {
        self.sender.send(outbound).is_ok()
    }
}
