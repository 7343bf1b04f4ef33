//! Message types for the Beacon protocol.
//!
//! Messages are the fundamental unit of communication between clients and
//! the gateway. Each message is a JSON object tagged by a `type` field and
//! carries only the fields relevant to its variant.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// WebSocket close codes used by the gateway.
pub mod close_codes {
    /// Authentication failure or liveness timeout.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Unexpected server-side failure on this connection.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Numeric codes carried by outbound `error` frames.
pub mod error_codes {
    /// Malformed or unrecognized inbound frame. Recoverable.
    pub const BAD_FRAME: u16 = 400;
    /// Unexpected failure while handling a frame. The connection is closed.
    pub const SERVER_ERROR: u16 = 500;
}

/// Presence status for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// The room a frame addresses: exactly one of a channel or a DM session.
///
/// Subscribe/unsubscribe/typing frames carry these fields inline; a frame
/// with both or neither id is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomTarget {
    /// Channel id, for channel-scoped frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// DM session id, for direct-message frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_id: Option<String>,
}

impl RoomTarget {
    /// Create a channel-scoped target.
    #[must_use]
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(id.into()),
            dm_id: None,
        }
    }

    /// Create a DM-scoped target.
    #[must_use]
    pub fn dm(id: impl Into<String>) -> Self {
        Self {
            channel_id: None,
            dm_id: Some(id.into()),
        }
    }

    /// Resolve the single room id this target addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if both or neither of `channel_id` and `dm_id` are set.
    pub fn room_id(&self) -> Result<&str, ProtocolError> {
        match (&self.channel_id, &self.dm_id) {
            (Some(channel), None) => Ok(channel),
            (None, Some(dm)) => Ok(dm),
            (Some(_), Some(_)) => Err(ProtocolError::AmbiguousRoom),
            (None, None) => Err(ProtocolError::MissingRoom),
        }
    }
}

/// A frame sent by a client to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to a room (channel or DM).
    Subscribe {
        #[serde(flatten)]
        target: RoomTarget,
    },

    /// Unsubscribe from a room.
    Unsubscribe {
        #[serde(flatten)]
        target: RoomTarget,
    },

    /// Announce that the user is typing in a room.
    Typing {
        #[serde(flatten)]
        target: RoomTarget,
    },

    /// Application-level heartbeat.
    Ping,
}

/// A frame sent by the gateway to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Heartbeat acknowledgment carrying the server's current timestamp
    /// (epoch milliseconds).
    Pong { timestamp: u64 },

    /// Subscription confirmed.
    Subscribed {
        #[serde(flatten)]
        target: RoomTarget,
    },

    /// Unsubscription confirmed.
    Unsubscribed {
        #[serde(flatten)]
        target: RoomTarget,
    },

    /// A user's presence changed.
    Presence {
        user_id: String,
        username: String,
        status: PresenceStatus,
        timestamp: u64,
    },

    /// A user is typing in a room.
    Typing {
        #[serde(flatten)]
        target: RoomTarget,
        user_id: String,
        username: String,
    },

    /// A chat message broadcast, relayed verbatim from the message bus.
    Message { data: serde_json::Value },

    /// A recoverable protocol error; the connection stays open.
    Error { error: String, code: u16 },
}

impl ServerMessage {
    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: u64) -> Self {
        ServerMessage::Pong { timestamp }
    }

    /// Create a new Subscribed frame echoing the request's target.
    #[must_use]
    pub fn subscribed(target: RoomTarget) -> Self {
        ServerMessage::Subscribed { target }
    }

    /// Create a new Unsubscribed frame echoing the request's target.
    #[must_use]
    pub fn unsubscribed(target: RoomTarget) -> Self {
        ServerMessage::Unsubscribed { target }
    }

    /// Create a new Presence frame.
    #[must_use]
    pub fn presence(
        user_id: impl Into<String>,
        username: impl Into<String>,
        status: PresenceStatus,
        timestamp: u64,
    ) -> Self {
        ServerMessage::Presence {
            user_id: user_id.into(),
            username: username.into(),
            status,
            timestamp,
        }
    }

    /// Create a new Typing broadcast frame.
    #[must_use]
    pub fn typing(
        target: RoomTarget,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        ServerMessage::Typing {
            target,
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            code,
        }
    }
}
