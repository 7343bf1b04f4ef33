//! Read-only REST surface: presence snapshots and health.
//!
//! Consumed by the other services and the frontend; everything here is a
//! single store read away, with the offline default standing in for expired
//! or never-written presence.

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use beacon_store::UserPresence;

use crate::handlers::AppState;
use crate::metrics;

fn presence_json(record: &UserPresence) -> Value {
    json!({
        "user_id": record.user_id,
        "username": record.username,
        "status": record.status,
        "last_seen": record.last_seen,
    })
}

/// `GET /health`
pub fn health(state: &AppState) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "beacon-gateway",
        "active_connections": state.registry.len(),
    }))
}

/// `GET /presence/{user_id}` - single snapshot, offline default.
pub async fn user_presence(state: &AppState, user_id: &str) -> Result<Json<Value>, StatusCode> {
    match state.presence.get_presence(user_id).await {
        Ok(Some(record)) => Ok(Json(presence_json(&record))),
        Ok(None) => Ok(Json(json!({
            "user_id": user_id,
            "status": "offline",
            "last_seen": null,
        }))),
        Err(err) => {
            metrics::record_error("store");
            error!(error = %err, user = %user_id, "Presence read failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// `GET /presence` - every live record, via a paged key scan.
pub async fn all_presence(state: &AppState) -> Result<Json<Value>, StatusCode> {
    match state.presence.scan_all().await {
        Ok(records) => {
            let users: Vec<Value> = records.iter().map(presence_json).collect();
            Ok(Json(json!({
                "users": users,
                "count": users.len(),
            })))
        }
        Err(err) => {
            metrics::record_error("store");
            error!(error = %err, "Presence scan failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::PresenceStatus;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_health_reports_connection_count() {
        let state = AppState::for_tests();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.registry.register("u1", "alice", tx);

        let Json(body) = health(&state);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_connections"], 1);
    }

    #[tokio::test]
    async fn test_user_presence_snapshot() {
        let state = AppState::for_tests();
        state
            .presence
            .set_presence("u1", "alice", PresenceStatus::Online, "conn-1")
            .await
            .unwrap();

        let Json(body) = user_presence(&state, "u1").await.unwrap();
        assert_eq!(body["username"], "alice");
        assert_eq!(body["status"], "online");
    }

    #[tokio::test]
    async fn test_unknown_user_defaults_to_offline() {
        let state = AppState::for_tests();

        let Json(body) = user_presence(&state, "ghost").await.unwrap();
        assert_eq!(body["status"], "offline");
        assert_eq!(body["last_seen"], Value::Null);
    }

    #[tokio::test]
    async fn test_all_presence_lists_records() {
        let state = AppState::for_tests();
        state
            .presence
            .set_presence("u1", "alice", PresenceStatus::Online, "c1")
            .await
            .unwrap();
        state
            .presence
            .set_presence("u2", "bob", PresenceStatus::Offline, "c2")
            .await
            .unwrap();

        let Json(body) = all_presence(&state).await.unwrap();
        assert_eq!(body["count"], 2);
        assert_eq!(body["users"].as_array().unwrap().len(), 2);
    }
}
