//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon realtime gateway.
//!
//! This crate defines the JSON frame protocol spoken over the gateway's
//! WebSocket endpoint, tagged by a `type` string field.
//!
//! ## Frame Types
//!
//! - `Subscribe` / `Unsubscribe` - Room membership (channel or DM)
//! - `Typing` - Typing indicator for a room
//! - `Ping` / `Pong` - Application-level heartbeat
//! - `Presence` / `Typing` / `Message` broadcasts - Server-pushed events
//! - `Error` - Structured, recoverable protocol errors
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ClientMessage};
//!
//! let frame = codec::decode(r#"{"type":"subscribe","channel_id":"general"}"#).unwrap();
//! assert!(matches!(frame, ClientMessage::Subscribe { .. }));
//! ```

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, ProtocolError};
pub use messages::{
    close_codes, error_codes, ClientMessage, PresenceStatus, RoomTarget, ServerMessage,
};
