//! Per-server connection lifecycle.
//!
//! Each registered server gets one [`ConnectionState`] driven through:
//!
//! ```text
//! disconnected -> connecting -> connected
//! connected    -> failed                  (probe or call failure)
//! failed       -> reconnecting            (while consecutive_errors <= max_retries)
//! reconnecting -> connected | failed
//! ```
//!
//! Connect, probe and reconnect for one server are serialized by a per-server
//! async lock, so the health monitor never races an explicit `connect()`.
//! The state itself sits behind a short `parking_lot` lock and can be read at
//! any time without waiting for an in-flight probe.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::reconnect::ReconnectPolicy;
use crate::{
    error::{OrchestrationError, OrchestrationResult},
    source::ToolSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub consecutive_errors: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            consecutive_errors: 0,
            last_health_check: None,
            last_error: None,
            last_latency_ms: None,
        }
    }
}

struct ManagedConnection {
    source: Arc<dyn ToolSource>,
    state: Mutex<ConnectionState>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ManagedConnection {
    fn new(source: Arc<dyn ToolSource>) -> Self {
        Self {
            source,
            state: Mutex::new(ConnectionState::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn snapshot(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    fn mark_connected(&self, started: Instant) {
        let mut state = self.state.lock();
        state.status = ConnectionStatus::Connected;
        state.consecutive_errors = 0;
        state.last_error = None;
        state.last_health_check = Some(Utc::now());
        state.last_latency_ms = Some(started.elapsed().as_millis() as u64);
    }

    /// Returns the new consecutive error count.
    fn mark_failed(&self, error: &OrchestrationError, checked: bool) -> u32 {
        let mut state = self.state.lock();
        state.status = ConnectionStatus::Failed;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error = Some(error.to_string());
        if checked {
            state.last_health_check = Some(Utc::now());
        }
        state.consecutive_errors
    }
}

pub struct ConnectionManager {
    connections: DashMap<String, Arc<ManagedConnection>>,
    policy: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            connections: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start tracking a server in the `disconnected` state.
    pub fn register(&self, server_id: &str, source: Arc<dyn ToolSource>) {
        self.connections
            .insert(server_id.to_string(), Arc::new(ManagedConnection::new(source)));
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.connections.contains_key(server_id)
    }

    pub fn source(&self, server_id: &str) -> Option<Arc<dyn ToolSource>> {
        self.connections
            .get(server_id)
            .map(|c| Arc::clone(&c.source))
    }

    pub fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.connections.get(server_id).map(|c| c.snapshot())
    }

    pub fn status(&self, server_id: &str) -> Option<ConnectionStatus> {
        self.connections
            .get(server_id)
            .map(|c| c.state.lock().status)
    }

    fn get(&self, server_id: &str) -> OrchestrationResult<Arc<ManagedConnection>> {
        self.connections
            .get(server_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| OrchestrationError::ServerNotFound(server_id.to_string()))
    }

    /// Open the client and run a health probe.
    ///
    /// Success resets `consecutive_errors`; failure leaves the server `failed`
    /// with the error recorded.
    pub async fn connect(&self, server_id: &str) -> OrchestrationResult<()> {
        let conn = self.get(server_id)?;
        let _guard = conn.op_lock.lock().await;
        Self::connect_locked(server_id, &conn, ConnectionStatus::Connecting).await
    }

    async fn connect_locked(
        server_id: &str,
        conn: &ManagedConnection,
        via: ConnectionStatus,
    ) -> OrchestrationResult<()> {
        conn.set_status(via);
        let started = Instant::now();
        let result = match conn.source.connect().await {
            Ok(()) => conn.source.probe().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                conn.mark_connected(started);
                info!(
                    server_id = %server_id,
                    address = %conn.source.address(),
                    "Server connected"
                );
                Ok(())
            }
            Err(e) => {
                let errors = conn.mark_failed(&e, true);
                warn!(
                    server_id = %server_id,
                    consecutive_errors = errors,
                    "Connection failed: {}", e
                );
                Err(e)
            }
        }
    }

    /// Re-run the health check. Never fails; the outcome lands in the state.
    ///
    /// Returns `None` only for unknown servers.
    pub async fn probe(&self, server_id: &str) -> Option<ConnectionState> {
        let conn = self.get(server_id).ok()?;
        let _guard = conn.op_lock.lock().await;

        let started = Instant::now();
        match conn.source.probe().await {
            Ok(()) => {
                let was = conn.snapshot().status;
                conn.mark_connected(started);
                if was != ConnectionStatus::Connected {
                    info!(server_id = %server_id, "Server recovered on probe");
                }
            }
            Err(e) => {
                let errors = conn.mark_failed(&e, true);
                warn!(
                    server_id = %server_id,
                    consecutive_errors = errors,
                    "Health probe failed: {}", e
                );
            }
        }
        Some(conn.snapshot())
    }

    /// Whether a failed server is still within its reconnect budget.
    pub fn needs_reconnect(&self, server_id: &str) -> bool {
        self.state(server_id).is_some_and(|s| {
            s.status == ConnectionStatus::Failed && self.policy.should_retry(s.consecutive_errors)
        })
    }

    /// Wait `base_delay * consecutive_errors` (capped), then connect again.
    pub async fn reconnect(&self, server_id: &str) -> OrchestrationResult<()> {
        let conn = self.get(server_id)?;
        let _guard = conn.op_lock.lock().await;

        let state = conn.snapshot();
        if state.status == ConnectionStatus::Connected {
            return Ok(());
        }
        if !self.policy.should_retry(state.consecutive_errors) {
            return Err(OrchestrationError::Connection {
                target: server_id.to_string(),
                message: state
                    .last_error
                    .unwrap_or_else(|| "reconnect budget exhausted".to_string()),
                attempts: state.consecutive_errors,
            });
        }

        conn.set_status(ConnectionStatus::Reconnecting);
        // Cancelled mid-backoff: fall back to `failed` instead of staying `reconnecting`
        let reset = scopeguard::guard(&conn, |c| {
            let mut s = c.state.lock();
            if s.status == ConnectionStatus::Reconnecting {
                s.status = ConnectionStatus::Failed;
            }
        });

        let delay = self.policy.calculate_backoff(state.consecutive_errors);
        debug!(server_id = %server_id, ?delay, "Reconnecting after backoff");
        tokio::time::sleep(delay).await;

        if let Err(e) = conn.source.disconnect().await {
            debug!(server_id = %server_id, "Ignoring disconnect error before reconnect: {}", e);
        }
        let result = Self::connect_locked(server_id, &conn, ConnectionStatus::Reconnecting).await;
        drop(reset);
        result
    }

    /// Stop tracking a server and close its client. Errors are logged, never returned.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let Some((_, conn)) = self.connections.remove(server_id) else {
            return false;
        };
        let _guard = conn.op_lock.lock().await;
        if let Err(e) = conn.source.disconnect().await {
            warn!(server_id = %server_id, "Error during disconnect: {}", e);
        }
        conn.set_status(ConnectionStatus::Disconnected);
        debug!(server_id = %server_id, "Server disconnected");
        true
    }

    /// Stop tracking a server without closing it; the caller owns the returned source.
    pub fn detach(&self, server_id: &str) -> Option<Arc<dyn ToolSource>> {
        self.connections
            .remove(server_id)
            .map(|(_, conn)| Arc::clone(&conn.source))
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// A call through this server hit a transport failure.
    pub fn record_failure(&self, server_id: &str, error: &OrchestrationError) {
        if let Some(conn) = self.connections.get(server_id) {
            let errors = conn.mark_failed(error, false);
            debug!(server_id = %server_id, consecutive_errors = errors, "Recorded call failure");
        }
    }

    /// A call through this server succeeded; a failed server is usable again.
    pub fn record_success(&self, server_id: &str) {
        if let Some(conn) = self.connections.get(server_id) {
            let mut state = conn.state.lock();
            if matches!(
                state.status,
                ConnectionStatus::Failed | ConnectionStatus::Reconnecting
            ) {
                state.status = ConnectionStatus::Connected;
            }
            state.consecutive_errors = 0;
            state.last_error = None;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
