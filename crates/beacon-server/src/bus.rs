//! Cross-instance bus bridge.
//!
//! A single process-wide task subscribes to the two gateway channels at
//! startup and feeds the fan-out engine, so bus consumption is decoupled
//! from every connection's own receive loop. Presence updates become global
//! broadcasts; message broadcasts are room-scoped by the `room_id` carried
//! in the payload. This instance's own origin-tagged publications are
//! dropped because they were already delivered locally.

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_protocol::ServerMessage;
use beacon_store::{BusMessage, MESSAGE_CHANNEL, PRESENCE_CHANNEL};

use crate::handlers::AppState;
use crate::metrics;

/// Delay between subscribe attempts after the bus connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Spawn the process-wide bus subscriber task.
pub fn spawn_subscriber(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channels = [
            PRESENCE_CHANNEL.to_string(),
            MESSAGE_CHANNEL.to_string(),
        ];

        loop {
            match state.bus.subscribe(&channels).await {
                Ok(mut stream) => {
                    info!("Bus subscriber running");
                    while let Some(message) = stream.next().await {
                        if let Err(error) = deliver(&state, &message) {
                            metrics::record_error("bus");
                            warn!(%error, channel = %message.channel, "Dropped bus message");
                        }
                    }
                    warn!("Bus subscription ended, resubscribing");
                }
                Err(error) => {
                    metrics::record_error("bus");
                    warn!(%error, "Bus subscribe failed, retrying");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

/// Deliver one bus message to local connections.
fn deliver(state: &AppState, message: &BusMessage) -> Result<()> {
    match message.channel.as_str() {
        PRESENCE_CHANNEL => {
            let frame: ServerMessage = serde_json::from_str(&message.payload)?;
            state.registry.broadcast_global(&frame);
        }
        MESSAGE_CHANNEL => {
            let value: Value = serde_json::from_str(&message.payload)?;

            if value.get("origin").and_then(Value::as_str) == Some(state.instance_id.as_str()) {
                // Our own publication; the room already got it directly.
                return Ok(());
            }

            let room_id = value
                .get("room_id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("message broadcast without room_id"))?
                .to_string();

            let frame: ServerMessage = serde_json::from_value(value)?;
            state.registry.broadcast_room(&room_id, &frame, None);
        }
        other => debug!(channel = %other, "Ignoring unknown bus channel"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Outbound;
    use beacon_protocol::PresenceStatus;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn bus_message(channel: &str, payload: Value) -> BusMessage {
        BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn test_presence_update_broadcast_globally() {
        let state = AppState::for_tests();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = state.registry.register("u1", "alice", tx);

        let payload = json!({
            "type": "presence",
            "user_id": "u2",
            "username": "bob",
            "status": "online",
            "timestamp": 1_700_000_000_000u64,
        });
        deliver(&state, &bus_message(PRESENCE_CHANNEL, payload)).unwrap();

        match rx.try_recv() {
            Ok(Outbound::Frame(ServerMessage::Presence { status, .. })) => {
                assert_eq!(status, PresenceStatus::Online);
            }
            other => panic!("Expected presence frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_broadcast_is_room_scoped() {
        let state = AppState::for_tests();
        let (tx_in, mut rx_in) = mpsc::unbounded_channel();
        let (tx_out, mut rx_out) = mpsc::unbounded_channel();
        let subscriber = state.registry.register("u1", "alice", tx_in);
        let _outsider = state.registry.register("u2", "bob", tx_out);
        state.registry.subscribe(subscriber.id(), "general");

        let payload = json!({
            "type": "message",
            "data": {"message_id": "m1", "content": "hi"},
            "room_id": "general",
        });
        deliver(&state, &bus_message(MESSAGE_CHANNEL, payload)).unwrap();

        assert!(matches!(
            rx_in.try_recv(),
            Ok(Outbound::Frame(ServerMessage::Message { .. }))
        ));
        assert!(rx_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_own_origin_is_skipped() {
        let state = AppState::for_tests();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = state.registry.register("u1", "alice", tx);
        state.registry.subscribe(conn.id(), "general");

        let own = json!({
            "type": "typing",
            "channel_id": "general",
            "user_id": "u1",
            "username": "alice",
            "room_id": "general",
            "origin": state.instance_id,
        });
        deliver(&state, &bus_message(MESSAGE_CHANNEL, own)).unwrap();
        assert!(rx.try_recv().is_err());

        let peer = json!({
            "type": "typing",
            "channel_id": "general",
            "user_id": "u2",
            "username": "bob",
            "room_id": "general",
            "origin": "some-other-instance",
        });
        deliver(&state, &bus_message(MESSAGE_CHANNEL, peer)).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Frame(ServerMessage::Typing { .. }))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_without_room_id_is_rejected() {
        let state = AppState::for_tests();
        let payload = json!({"type": "message", "data": {}});
        assert!(deliver(&state, &bus_message(MESSAGE_CHANNEL, payload)).is_err());
    }
}
