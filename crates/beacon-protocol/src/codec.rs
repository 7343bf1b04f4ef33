//! Codec for encoding and decoding Beacon frames.
//!
//! Frames travel as JSON text over the WebSocket. Inbound text is size-checked
//! before parsing; a malformed or unrecognized frame yields a `ProtocolError`
//! that the dispatcher answers with a single `error` frame.

use thiserror::Error;

use crate::messages::{ClientMessage, ServerMessage};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur while interpreting frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Malformed JSON or unknown `type` tag.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame addressed both a channel and a DM.
    #[error("Frame must carry exactly one of channel_id or dm_id, got both")]
    AmbiguousRoom,

    /// Frame addressed neither a channel nor a DM.
    #[error("Frame must carry exactly one of channel_id or dm_id, got neither")]
    MissingRoom,
}

/// Decode an inbound text frame.
///
/// # Errors
///
/// Returns an error if the frame is oversized, malformed, or carries an
/// unknown `type` tag.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode an outbound frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}
