//! Fan-out engine: local broadcasts plus cross-instance bus publication.
//!
//! Presence updates travel over the bus and loop back to this instance's
//! own subscriber, so one path serves local and remote delivery. Typing
//! indicators are delivered locally first and published origin-tagged so the
//! bus subscriber can skip its own copy. Store or bus failures degrade to
//! local-only delivery; they never fail a connection.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use beacon_core::{epoch_ms, Connection, Outbound};
use beacon_protocol::{PresenceStatus, RoomTarget, ServerMessage};
use beacon_store::{MESSAGE_CHANNEL, PRESENCE_CHANNEL};

use crate::handlers::AppState;
use crate::metrics;

/// Write a user's presence record and announce the change everywhere.
pub async fn announce_presence(
    state: &Arc<AppState>,
    user_id: &str,
    username: &str,
    status: PresenceStatus,
    connection_id: &str,
) {
    if let Err(error) = state
        .presence
        .set_presence(user_id, username, status, connection_id)
        .await
    {
        metrics::record_error("store");
        warn!(%error, user = %username, "Presence write skipped, store unavailable");
    }
    broadcast_presence(state, user_id, username, status).await;
}

/// Publish a presence update on the bus. Every instance, this one included,
/// delivers it as a global broadcast; if the bus is unreachable the update
/// is delivered to local connections directly.
pub async fn broadcast_presence(
    state: &Arc<AppState>,
    user_id: &str,
    username: &str,
    status: PresenceStatus,
) {
    let message = ServerMessage::presence(user_id, username, status, epoch_ms());
    let Ok(payload) = serde_json::to_string(&message) else {
        return;
    };

    if let Err(error) = state.bus.publish(PRESENCE_CHANNEL, &payload).await {
        metrics::record_error("bus");
        warn!(%error, user = %username, "Bus unavailable, presence update stays local");
        state.registry.broadcast_global(&message);
    }
}

/// Store a typing indicator and fan it out: the local room immediately,
/// then the bus for other instances.
///
/// # Errors
///
/// Returns an error only on a serialization failure, which is fatal to the
/// calling connection.
pub async fn broadcast_typing(
    state: &Arc<AppState>,
    conn: &Connection,
    target: RoomTarget,
    room_id: &str,
) -> Result<()> {
    if let Err(error) = state
        .typing
        .set_typing(room_id, &conn.user_id, &conn.username)
        .await
    {
        metrics::record_error("store");
        warn!(%error, room = %room_id, "Typing write skipped, store unavailable");
    }

    let message = ServerMessage::typing(target, &conn.user_id, &conn.username);
    state.registry.broadcast_room(room_id, &message, None);

    // Origin-tagged copy for the other instances; the subscriber drops the
    // tag's own loopback so the room is not notified twice.
    let mut payload = serde_json::to_value(&message)?;
    payload["room_id"] = json!(room_id);
    payload["origin"] = json!(state.instance_id);

    if let Err(error) = state.bus.publish(MESSAGE_CHANNEL, &payload.to_string()).await {
        metrics::record_error("bus");
        warn!(%error, room = %room_id, "Bus unavailable, typing indicator stays local");
    }

    Ok(())
}

/// Tear down a connection: registry removal, offline presence write, and
/// offline broadcast.
///
/// Idempotent across racing callers (watchdog, dispatcher, write failures):
/// only whoever wins the registry removal performs the cleanup.
pub async fn teardown_connection(
    state: &Arc<AppState>,
    connection_id: &str,
    close: Option<(u16, &str)>,
) {
    let Some(conn) = state.registry.remove(connection_id) else {
        return;
    };

    if let Some((code, reason)) = close {
        let _ = conn.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    metrics::set_active_rooms(state.registry.room_count());

    announce_presence(
        state,
        &conn.user_id,
        &conn.username,
        PresenceStatus::Offline,
        connection_id,
    )
    .await;

    info!(connection = %connection_id, user = %conn.username, "Connection closed");
}
