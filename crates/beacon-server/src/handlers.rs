//! Connection handling for the Beacon gateway.
//!
//! This module owns the WebSocket entry point and the per-connection
//! protocol dispatcher. A connection moves through
//! CONNECTING -> AUTHENTICATED -> ACTIVE -> CLOSING -> CLOSED: the token is
//! verified before any state exists, the registry entry and watchdog are
//! created together, frames are interpreted until the peer goes away, and
//! one idempotent teardown path serves client closes, liveness timeouts,
//! and write failures alike.

use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use beacon_core::{epoch_ms, Connection, Outbound, Registry};
use beacon_protocol::{
    close_codes, codec, error_codes, ClientMessage, PresenceStatus, ServerMessage,
};
use beacon_store::{EventBus, KeyValueStore, PresenceStore, RedisStore, TypingStore};

use crate::auth::TokenVerifier;
use crate::config::{Config, CorsConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::{bus, fanout, heartbeat, rest};

/// Shared server state, constructed once at startup and passed into every
/// component.
pub struct AppState {
    /// The connection registry and room index.
    pub registry: Registry,
    /// Presence soft-state bridge.
    pub presence: PresenceStore,
    /// Typing indicator bridge.
    pub typing: TypingStore,
    /// Cross-instance pub/sub bus.
    pub bus: Arc<dyn EventBus>,
    /// Token verifier for the upgrade handshake.
    pub verifier: TokenVerifier,
    /// Server configuration.
    pub config: Config,
    /// Distinguishes this instance's bus publications from its peers'.
    pub instance_id: String,
}

impl AppState {
    /// Create new app state over the given store and bus backends.
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn EventBus>,
        verifier: TokenVerifier,
    ) -> Self {
        Self {
            registry: Registry::new(),
            presence: PresenceStore::new(Arc::clone(&store), config.presence_ttl()),
            typing: TypingStore::new(store, config.typing_ttl()),
            bus,
            verifier,
            instance_id: Uuid::new_v4().to_string(),
            config,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        use beacon_store::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let kv: Arc<dyn KeyValueStore> = store.clone();
        let bus: Arc<dyn EventBus> = store;
        Arc::new(Self::new(
            Config::default(),
            kv,
            bus,
            TokenVerifier::hs256(b"test-secret"),
        ))
    }
}

/// Run the gateway.
///
/// # Errors
///
/// Returns an error if the verifier is misconfigured, the store is
/// unreachable at startup, or the listener fails to bind.
pub async fn run_server(config: Config) -> Result<()> {
    let verifier = TokenVerifier::from_config(&config.auth)?;
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let kv: Arc<dyn KeyValueStore> = store.clone();
    let bus_client: Arc<dyn EventBus> = store;

    let state = Arc::new(AppState::new(config.clone(), kv, bus_client, verifier));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // One process-wide bus subscriber feeds cross-instance fan-out.
    let _bus_task = bus::spawn_subscriber(Arc::clone(&state));

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon gateway listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router: the realtime endpoint plus the read-only REST
/// surface.
fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/presence/:user_id", get(user_presence_handler))
        .route("/presence", get(all_presence_handler))
        .route("/health", get(health_handler))
        .layer(cors_layer(&state.config.cors))
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    rest::health(&state)
}

async fn user_presence_handler(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    rest::user_presence(&state, &user_id).await
}

async fn all_presence_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    rest::all_presence(&state).await
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

/// Drive one WebSocket connection through its lifecycle.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    // CONNECTING: verify the credential before any gateway state exists.
    let identity = match token.as_deref().map(|t| state.verifier.verify(t)) {
        Some(Ok(identity)) => identity,
        outcome => {
            metrics::record_error("auth");
            match outcome {
                Some(Err(error)) => warn!(%error, "Rejected connection: invalid token"),
                _ => warn!("Rejected connection: missing token"),
            }
            close_unauthenticated(socket).await;
            return;
        }
    };

    // AUTHENTICATED: register, announce presence, ack, start the watchdog.
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let conn = state
        .registry
        .register(identity.user_id.as_str(), identity.username.as_str(), tx);
    let connection_id = conn.id().to_string();
    info!(
        connection = %connection_id,
        user = %conn.username,
        "Connection established"
    );

    fanout::announce_presence(
        &state,
        &conn.user_id,
        &conn.username,
        PresenceStatus::Online,
        &connection_id,
    )
    .await;

    let writer = tokio::spawn(write_outbound(sink, rx));

    // Initial pong confirms connectivity to the client.
    state
        .registry
        .send_to(&connection_id, ServerMessage::pong(epoch_ms()));

    let watchdog = heartbeat::spawn_watchdog(Arc::clone(&state), connection_id.clone());

    // ACTIVE: interpret frames until the peer goes away.
    run_dispatch_loop(&state, &conn, stream).await;

    // CLOSING: stop the watchdog, then run the shared teardown. Both are
    // safe against the watchdog having torn the connection down already.
    watchdog.abort();
    fanout::teardown_connection(&state, &connection_id, None).await;
    writer.abort();
}

/// Close an unauthenticated socket with a policy-violation code.
async fn close_unauthenticated(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_codes::POLICY_VIOLATION,
            reason: "authentication failed".into(),
        })))
        .await;
}

/// Writer task: drains the connection's outbound queue onto the socket.
///
/// All socket writes for a connection funnel through here, so broadcasts
/// never block on I/O while holding registry guards.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                let text = match codec::encode(&frame) {
                    Ok(text) => text,
                    Err(error) => {
                        error!(%error, "Failed to encode outbound frame");
                        continue;
                    }
                };
                metrics::record_frame(text.len(), "outbound");
                if sink.send(Message::Text(text)).await.is_err() {
                    // Write failure means the peer is gone; the read half
                    // observes the same and runs the teardown.
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Read frames until transport close or error.
async fn run_dispatch_loop(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    mut stream: SplitStream<WebSocket>,
) {
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => {
                let start = Instant::now();
                metrics::record_frame(text.len(), "inbound");

                if let Err(error) = dispatch_frame(state, conn, &text).await {
                    // Fatal to this connection only; siblings are untouched.
                    metrics::record_error("internal");
                    error!(connection = %conn.id(), %error, "Internal error, closing connection");
                    fanout::teardown_connection(
                        state,
                        conn.id(),
                        Some((close_codes::INTERNAL_ERROR, "internal server error")),
                    )
                    .await;
                    break;
                }

                metrics::record_latency(start.elapsed().as_secs_f64());
            }
            Ok(Message::Binary(_)) => {
                metrics::record_error("protocol");
                state.registry.send_to(
                    conn.id(),
                    ServerMessage::error(error_codes::BAD_FRAME, "binary frames are not supported"),
                );
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Transport-level keepalive; liveness runs on protocol pings.
            }
            Ok(Message::Close(_)) => {
                debug!(connection = %conn.id(), "Received close frame");
                break;
            }
            Err(error) => {
                metrics::record_error("websocket");
                warn!(connection = %conn.id(), %error, "WebSocket error");
                break;
            }
        }
    }
}

/// Interpret one inbound frame.
///
/// Malformed frames answer with a recoverable `error` frame and leave the
/// connection ACTIVE. An `Err` here is fatal to the connection.
async fn dispatch_frame(state: &Arc<AppState>, conn: &Arc<Connection>, text: &str) -> Result<()> {
    let message = match codec::decode(text) {
        Ok(message) => message,
        Err(error) => {
            metrics::record_error("protocol");
            debug!(connection = %conn.id(), %error, "Malformed frame");
            state.registry.send_to(
                conn.id(),
                ServerMessage::error(error_codes::BAD_FRAME, error.to_string()),
            );
            return Ok(());
        }
    };

    match message {
        ClientMessage::Subscribe { target } => match target.room_id() {
            Ok(room_id) => {
                state.registry.subscribe(conn.id(), room_id);
                metrics::record_subscription();
                metrics::set_active_rooms(state.registry.room_count());
                state
                    .registry
                    .send_to(conn.id(), ServerMessage::subscribed(target.clone()));
            }
            Err(error) => reply_bad_frame(state, conn, &error.to_string()),
        },

        ClientMessage::Unsubscribe { target } => match target.room_id() {
            Ok(room_id) => {
                state.registry.unsubscribe(conn.id(), room_id);
                metrics::set_active_rooms(state.registry.room_count());
                state
                    .registry
                    .send_to(conn.id(), ServerMessage::unsubscribed(target.clone()));
            }
            Err(error) => reply_bad_frame(state, conn, &error.to_string()),
        },

        ClientMessage::Typing { target } => match target.room_id() {
            Ok(room_id) => {
                let room_id = room_id.to_string();
                fanout::broadcast_typing(state, conn, target.clone(), &room_id).await?;
            }
            Err(error) => reply_bad_frame(state, conn, &error.to_string()),
        },

        ClientMessage::Ping => {
            conn.touch_heartbeat();
            // Sliding presence refresh; status is unchanged while connected.
            if let Err(error) = state
                .presence
                .set_presence(&conn.user_id, &conn.username, PresenceStatus::Online, conn.id())
                .await
            {
                metrics::record_error("store");
                warn!(%error, user = %conn.username, "Presence refresh skipped, store unavailable");
            }
            state
                .registry
                .send_to(conn.id(), ServerMessage::pong(epoch_ms()));
        }
    }

    Ok(())
}

fn reply_bad_frame(state: &Arc<AppState>, conn: &Arc<Connection>, error: &str) {
    metrics::record_error("protocol");
    state
        .registry
        .send_to(conn.id(), ServerMessage::error(error_codes::BAD_FRAME, error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::RoomTarget;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(
        state: &Arc<AppState>,
        user: &str,
    ) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.registry.register(user, user, tx), rx)
    }

    fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> Option<ServerMessage> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_replies_and_registers() {
        let state = AppState::for_tests();
        let (conn, mut rx) = connect(&state, "alice");

        dispatch_frame(&state, &conn, r#"{"type":"subscribe","channel_id":"general"}"#)
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut rx),
            Some(ServerMessage::subscribed(RoomTarget::channel("general")))
        );
        assert_eq!(state.registry.room_members("general").len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_replies_and_prunes() {
        let state = AppState::for_tests();
        let (conn, mut rx) = connect(&state, "alice");
        state.registry.subscribe(conn.id(), "general");

        dispatch_frame(
            &state,
            &conn,
            r#"{"type":"unsubscribe","channel_id":"general"}"#,
        )
        .await
        .unwrap();

        assert_eq!(
            next_frame(&mut rx),
            Some(ServerMessage::unsubscribed(RoomTarget::channel("general")))
        );
        assert_eq!(state.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_bogus_frame_is_recoverable() {
        let state = AppState::for_tests();
        let (conn, mut rx) = connect(&state, "alice");

        dispatch_frame(&state, &conn, r#"{"type":"bogus"}"#)
            .await
            .unwrap();

        // Exactly one 400-class error frame.
        match next_frame(&mut rx) {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, error_codes::BAD_FRAME),
            other => panic!("Expected error frame, got {other:?}"),
        }
        assert!(next_frame(&mut rx).is_none());

        // The connection stays ACTIVE: a subsequent ping is still answered.
        dispatch_frame(&state, &conn, r#"{"type":"ping"}"#)
            .await
            .unwrap();
        assert!(matches!(
            next_frame(&mut rx),
            Some(ServerMessage::Pong { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_with_both_room_ids_is_malformed() {
        let state = AppState::for_tests();
        let (conn, mut rx) = connect(&state, "alice");

        dispatch_frame(
            &state,
            &conn,
            r#"{"type":"subscribe","channel_id":"general","dm_id":"dm_1"}"#,
        )
        .await
        .unwrap();

        assert!(matches!(
            next_frame(&mut rx),
            Some(ServerMessage::Error { code, .. }) if code == error_codes::BAD_FRAME
        ));
        assert_eq!(state.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_touches_heartbeat_and_refreshes_presence() {
        let state = AppState::for_tests();
        let (conn, mut rx) = connect(&state, "alice");
        conn.touch_heartbeat_at(epoch_ms().saturating_sub(25_000));

        dispatch_frame(&state, &conn, r#"{"type":"ping"}"#)
            .await
            .unwrap();

        assert!(conn.heartbeat_age().as_secs() < 1);
        assert!(matches!(
            next_frame(&mut rx),
            Some(ServerMessage::Pong { .. })
        ));

        let record = state.presence.get_presence("alice").await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
        assert_eq!(record.connection_id, conn.id());
    }

    #[tokio::test]
    async fn test_typing_reaches_room_subscribers() {
        let state = AppState::for_tests();
        let (alice, mut rx_alice) = connect(&state, "alice");
        let (bob, _rx_bob) = connect(&state, "bob");
        state.registry.subscribe(alice.id(), "general");
        state.registry.subscribe(bob.id(), "general");

        dispatch_frame(&state, &bob, r#"{"type":"typing","channel_id":"general"}"#)
            .await
            .unwrap();

        match next_frame(&mut rx_alice) {
            Some(ServerMessage::Typing {
                target, username, ..
            }) => {
                assert_eq!(target.channel_id.as_deref(), Some("general"));
                assert_eq!(username, "bob");
            }
            other => panic!("Expected typing broadcast, got {other:?}"),
        }
    }
}
