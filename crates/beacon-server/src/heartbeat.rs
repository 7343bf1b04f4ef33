//! Per-connection liveness watchdog.
//!
//! One watchdog task per connection, started right after registration.
//! Each wake-up it re-checks the connection's heartbeat age; a connection
//! silent for twice the interval is closed with a policy-violation code and
//! torn down through the same path as a client-initiated close. The
//! watchdog retires on its own when the connection leaves the registry.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use beacon_protocol::close_codes;

use crate::fanout;
use crate::handlers::AppState;
use crate::metrics;

/// Spawn the watchdog for a registered connection.
pub fn spawn_watchdog(state: Arc<AppState>, connection_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.config.heartbeat_interval();
        let timeout = interval * 2;

        loop {
            tokio::time::sleep(interval).await;

            let Some(conn) = state.registry.connection(&connection_id) else {
                break;
            };

            if conn.heartbeat_age() > timeout {
                metrics::record_error("liveness_timeout");
                warn!(
                    connection = %connection_id,
                    timeout_secs = timeout.as_secs(),
                    "No heartbeat, closing connection"
                );
                fanout::teardown_connection(
                    &state,
                    &connection_id,
                    Some((close_codes::POLICY_VIOLATION, "liveness timeout")),
                )
                .await;
                break;
            }
        }
    })
}
