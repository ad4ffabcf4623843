//! Server registry: the set of registered servers and the router to their tools.
//!
//! A server only becomes visible once its first connection test succeeds, so a
//! failed `add_server` leaves nothing behind. Discovery is isolated per
//! server: one failing listing empties that server's tools for the pass and
//! never aborts the others.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    config::{HealthConfig, RetryPolicy, ServerConfig},
    connection::{ConnectionManager, ConnectionStatus},
    pool::ConnectionPool,
};
use crate::{
    error::{OrchestrationError, OrchestrationResult},
    inventory::{ToolInventory, UnifiedTool},
    source::{Connector, LocalToolSet, RawToolOutput, RemoteToolSource, SourceKind, ToolSource},
};

/// Upper bound on the best-effort disconnect done by `remove_server`.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct ServerEntry {
    name: String,
    kind: SourceKind,
    address: String,
    seq: u64,
    retry: Option<RetryPolicy>,
    config: Map<String, Value>,
    registered_at: DateTime<Utc>,
}

/// Public view of one registered server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub name: String,
    pub address: String,
    pub kind: SourceKind,
    pub connection_status: ConnectionStatus,
    pub consecutive_errors: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    pub tool_count: usize,
    pub registered_at: DateTime<Utc>,
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub failed_servers: usize,
    pub servers: Vec<ServerRecord>,
}

/// Result of a fresh connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct ServerTestResult {
    pub server_id: String,
    pub status: ConnectionStatus,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthPassSummary {
    pub probed: usize,
    pub reconnected: usize,
    pub skipped: usize,
}

struct HealthMonitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ServerRegistry {
    servers: DashMap<String, ServerEntry>,
    /// Names reserved by registrations still running their connection test
    pending_names: DashSet<String>,
    registration: Mutex<()>,
    next_seq: AtomicU64,
    connections: Arc<ConnectionManager>,
    inventory: Arc<ToolInventory>,
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    default_timeout: Duration,
    health: HealthConfig,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl ServerRegistry {
    pub fn new(
        connections: Arc<ConnectionManager>,
        inventory: Arc<ToolInventory>,
        pool: Arc<ConnectionPool>,
        connector: Arc<dyn Connector>,
        default_timeout: Duration,
        health: HealthConfig,
    ) -> Self {
        Self {
            servers: DashMap::new(),
            pending_names: DashSet::new(),
            registration: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            connections,
            inventory,
            pool,
            connector,
            default_timeout,
            health,
            monitor: Mutex::new(None),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn inventory(&self) -> &Arc<ToolInventory> {
        &self.inventory
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a remote server. The record is committed only if the initial
    /// connection test passes.
    pub async fn add_server(&self, config: ServerConfig) -> OrchestrationResult<String> {
        config.validate()?;
        let server_id = Uuid::new_v4().to_string();
        let timeout = config.timeout(self.default_timeout.as_secs());
        let source = Arc::new(RemoteToolSource::new(
            &server_id,
            config.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.connector),
            timeout,
        ));
        self.register(server_id, &config.name, source, config.redacted(), config.retry)
            .await
    }

    /// Register an in-process tool set.
    pub async fn add_local_server(&self, tools: Arc<LocalToolSet>) -> OrchestrationResult<String> {
        let name = tools.name().to_string();
        let mut config = Map::new();
        config.insert("protocol".to_string(), "local".into());
        self.add_source(&name, tools, config).await
    }

    /// Register any [`ToolSource`] under `name`.
    pub async fn add_source(
        &self,
        name: &str,
        source: Arc<dyn ToolSource>,
        config: Map<String, Value>,
    ) -> OrchestrationResult<String> {
        self.register(Uuid::new_v4().to_string(), name, source, config, None)
            .await
    }

    async fn register(
        &self,
        server_id: String,
        name: &str,
        source: Arc<dyn ToolSource>,
        config: Map<String, Value>,
        retry: Option<RetryPolicy>,
    ) -> OrchestrationResult<String> {
        self.reserve_name(name)?;
        // Runs on every exit, including the caller dropping this future mid-connect
        let pending_id = server_id.clone();
        let mut committed = scopeguard::guard(false, move |committed| {
            self.pending_names.remove(name);
            if !committed {
                self.abandon_connection(&pending_id);
            }
        });

        let kind = source.kind();
        let address = source.address();
        self.connections.register(&server_id, Arc::clone(&source));

        if let Err(e) = self.connections.connect(&server_id).await {
            self.connections.disconnect(&server_id).await;
            warn!(server = %name, address = %address, "Registration rejected: {}", e);
            return Err(e);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.servers.insert(
            server_id.clone(),
            ServerEntry {
                name: name.to_string(),
                kind,
                address: address.clone(),
                seq,
                retry,
                config,
                registered_at: Utc::now(),
            },
        );
        self.inventory.register_server(&server_id, name, kind, seq);
        *committed = true;
        info!(server_id = %server_id, server = %name, %kind, address = %address, "Server registered");

        if let Err(e) = self.discover_server(&server_id).await {
            warn!(server_id = %server_id, "Initial discovery failed: {}", e);
        }
        Ok(server_id)
    }

    /// Drop the connection entry of a registration that never committed.
    ///
    /// Closing is async, so it runs on a spawned task.
    fn abandon_connection(&self, server_id: &str) {
        let Some(source) = self.connections.detach(server_id) else {
            return;
        };
        debug!(server_id = %server_id, "Discarding uncommitted registration");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let server_id = server_id.to_string();
                handle.spawn(async move {
                    if let Err(e) = source.disconnect().await {
                        debug!(server_id = %server_id, "Ignoring close error: {}", e);
                    }
                });
            }
            Err(_) => warn!(server_id = %server_id, "No runtime to close abandoned connection"),
        }
    }

    fn reserve_name(&self, name: &str) -> OrchestrationResult<()> {
        let _guard = self.registration.lock();
        let taken = self.pending_names.contains(name)
            || self.servers.iter().any(|entry| entry.name == name);
        if taken {
            return Err(OrchestrationError::ExternalServer(format!(
                "a server named '{}' is already registered",
                name
            )));
        }
        self.pending_names.insert(name.to_string());
        Ok(())
    }

    /// Close a server, then drop its record and tools. Returns false for unknown ids.
    ///
    /// The close is bounded; a peer that never answers is removed anyway.
    pub async fn remove_server(&self, server_id: &str) -> bool {
        if !self.servers.contains_key(server_id) {
            return false;
        }

        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.connections.disconnect(server_id)).await
        {
            Ok(_) => {}
            Err(_) => warn!(server_id = %server_id, "Disconnect timed out; removing server anyway"),
        }

        let Some((_, entry)) = self.servers.remove(server_id) else {
            return false;
        };
        self.inventory.remove_server(server_id);
        info!(server_id = %server_id, server = %entry.name, "Server removed");
        true
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Registered ids in registration order.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<(u64, String)> = self
            .servers
            .iter()
            .map(|e| (e.seq, e.key().clone()))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<String> {
        self.servers
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.key().clone())
    }

    pub fn retry_policy(&self, server_id: &str) -> Option<RetryPolicy> {
        self.servers.get(server_id).and_then(|e| e.retry)
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Refresh every server's tools and return the merged list.
    pub async fn list_all_tools(&self) -> Vec<UnifiedTool> {
        let ids = self.server_ids();
        let results = join_all(ids.iter().map(|id| self.discover_server(id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            debug!(failed, total = ids.len(), "Discovery pass finished with failures");
        }
        self.inventory.list_tools()
    }

    /// Re-list one server's tools. On failure the server contributes no tools
    /// until its next successful discovery.
    pub async fn discover_server(&self, server_id: &str) -> OrchestrationResult<usize> {
        let source = self
            .connections
            .source(server_id)
            .ok_or_else(|| OrchestrationError::ServerNotFound(server_id.to_string()))?;

        match source.list_tools().await {
            Ok(tools) => {
                // Holding the entry keeps a concurrent remove from interleaving
                let Some(_entry) = self.servers.get(server_id) else {
                    return Err(OrchestrationError::ServerNotFound(server_id.to_string()));
                };
                let count = self.inventory.replace_server_tools(server_id, tools);
                self.connections.record_success(server_id);
                debug!(server_id = %server_id, tools = count, "Discovered tools");
                Ok(count)
            }
            Err(e) => {
                warn!(server_id = %server_id, "Tool discovery failed: {}", e);
                self.inventory.clear_server_tools(server_id);
                if e.is_retryable() {
                    self.connections.record_failure(server_id, &e);
                }
                Err(e)
            }
        }
    }

    /// First match by name, in server registration order. Runs discovery once
    /// on a miss.
    pub async fn get_tool_info(&self, tool_name: &str) -> OrchestrationResult<UnifiedTool> {
        if let Some(tool) = self.inventory.get_tool(tool_name) {
            return Ok(tool);
        }
        self.list_all_tools().await;
        self.inventory
            .get_tool(tool_name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(tool_name.to_string()))
    }

    /// Lookup by `(server_id, tool_name)`.
    pub async fn get_tool_on(
        &self,
        server_id: &str,
        tool_name: &str,
    ) -> OrchestrationResult<UnifiedTool> {
        if !self.contains(server_id) {
            return Err(OrchestrationError::ServerNotFound(server_id.to_string()));
        }
        if let Some(tool) = self.inventory.get_tool_qualified(server_id, tool_name) {
            return Ok(tool);
        }
        // A failed rediscovery simply leaves the tool unknown
        let _ = self.discover_server(server_id).await;
        self.inventory
            .get_tool_qualified(server_id, tool_name)
            .ok_or_else(|| {
                OrchestrationError::ToolNotFound(format!("{}:{}", server_id, tool_name))
            })
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Resolve by name, count the use, and run once on the owning server.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        let tool = self.get_tool_info(tool_name).await?;
        self.record_usage(&tool);
        self.call_routed(&tool.owning_server_id, &tool.name, arguments)
            .await
    }

    pub fn record_usage(&self, tool: &UnifiedTool) -> u64 {
        self.inventory
            .record_usage(&tool.owning_server_id, &tool.name)
    }

    /// Send one call to a known server. Transport failures mark the server failed.
    pub async fn call_routed(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        let source = self
            .connections
            .source(server_id)
            .ok_or_else(|| OrchestrationError::ServerNotFound(server_id.to_string()))?;

        match source.call_tool(tool_name, arguments).await {
            Ok(output) => {
                self.connections.record_success(server_id);
                Ok(output)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.connections.record_failure(server_id, &e);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Health and management views
    // ========================================================================

    pub fn server_record(&self, server_id: &str) -> Option<ServerRecord> {
        let (name, kind, address, config, registered_at) = {
            let entry = self.servers.get(server_id)?;
            (
                entry.name.clone(),
                entry.kind,
                entry.address.clone(),
                entry.config.clone(),
                entry.registered_at,
            )
        };
        let state = self.connections.state(server_id).unwrap_or_default();
        Some(ServerRecord {
            server_id: server_id.to_string(),
            name,
            address,
            kind,
            connection_status: state.status,
            consecutive_errors: state.consecutive_errors,
            last_health_check: state.last_health_check,
            last_error: state.last_error,
            last_latency_ms: state.last_latency_ms,
            tool_count: self.inventory.list_server_tools(server_id).len(),
            registered_at,
            config,
        })
    }

    pub fn list_servers(&self) -> Vec<ServerRecord> {
        self.server_ids()
            .iter()
            .filter_map(|id| self.server_record(id))
            .collect()
    }

    pub fn list_server_tools(&self, server_id: &str) -> OrchestrationResult<Vec<UnifiedTool>> {
        if !self.contains(server_id) {
            return Err(OrchestrationError::ServerNotFound(server_id.to_string()));
        }
        Ok(self.inventory.list_server_tools(server_id))
    }

    /// Latest known state of every server. Never probes.
    pub fn get_health(&self) -> RegistryHealth {
        let servers = self.list_servers();
        let connected_servers = servers
            .iter()
            .filter(|s| s.connection_status == ConnectionStatus::Connected)
            .count();
        let failed_servers = servers
            .iter()
            .filter(|s| s.connection_status == ConnectionStatus::Failed)
            .count();
        RegistryHealth {
            total_servers: servers.len(),
            connected_servers,
            failed_servers,
            servers,
        }
    }

    /// Probe now, regardless of freshness.
    pub async fn test_server(&self, server_id: &str) -> OrchestrationResult<ServerTestResult> {
        if !self.contains(server_id) {
            return Err(OrchestrationError::ServerNotFound(server_id.to_string()));
        }
        let state = self
            .connections
            .probe(server_id)
            .await
            .ok_or_else(|| OrchestrationError::ServerNotFound(server_id.to_string()))?;
        let reachable = state.status == ConnectionStatus::Connected;
        Ok(ServerTestResult {
            server_id: server_id.to_string(),
            status: state.status,
            reachable,
            latency_ms: if reachable { state.last_latency_ms } else { None },
            error: state.last_error,
        })
    }

    pub async fn refresh_server_tools(&self, server_id: &str) -> OrchestrationResult<usize> {
        if !self.contains(server_id) {
            return Err(OrchestrationError::ServerNotFound(server_id.to_string()));
        }
        self.discover_server(server_id).await
    }

    // ========================================================================
    // Health monitor
    // ========================================================================

    /// One monitor tick: reconnect failed servers within budget, re-probe
    /// servers whose last check is older than the freshness window.
    pub async fn run_health_pass(&self) -> HealthPassSummary {
        let freshness = chrono::Duration::seconds(self.health.freshness_secs as i64);
        let now = Utc::now();

        let outcomes = join_all(self.server_ids().into_iter().map(|id| async move {
            let Some(state) = self.connections.state(&id) else {
                return HealthPassSummary::default();
            };
            match state.status {
                ConnectionStatus::Failed if self.connections.needs_reconnect(&id) => {
                    match self.connections.reconnect(&id).await {
                        Ok(()) => {
                            if let Err(e) = self.discover_server(&id).await {
                                debug!(server_id = %id, "Rediscovery after reconnect failed: {}", e);
                            }
                            HealthPassSummary {
                                reconnected: 1,
                                ..Default::default()
                            }
                        }
                        Err(e) => {
                            debug!(server_id = %id, "Reconnect attempt failed: {}", e);
                            HealthPassSummary {
                                probed: 1,
                                ..Default::default()
                            }
                        }
                    }
                }
                ConnectionStatus::Failed
                | ConnectionStatus::Connecting
                | ConnectionStatus::Reconnecting => HealthPassSummary {
                    skipped: 1,
                    ..Default::default()
                },
                _ => {
                    let stale = state
                        .last_health_check
                        .map_or(true, |at| now.signed_duration_since(at) >= freshness);
                    if stale {
                        self.connections.probe(&id).await;
                        HealthPassSummary {
                            probed: 1,
                            ..Default::default()
                        }
                    } else {
                        HealthPassSummary {
                            skipped: 1,
                            ..Default::default()
                        }
                    }
                }
            }
        }))
        .await;

        outcomes
            .into_iter()
            .fold(HealthPassSummary::default(), |acc, s| HealthPassSummary {
                probed: acc.probed + s.probed,
                reconnected: acc.reconnected + s.reconnected,
                skipped: acc.skipped + s.skipped,
            })
    }

    /// Spawn the periodic monitor. Returns false if one is already running.
    pub fn start_health_monitor(self: &Arc<Self>) -> bool {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let interval = Duration::from_secs(self.health.interval_secs.max(1));
        let registry: Weak<Self> = Arc::downgrade(self);
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    summary = registry.run_health_pass() => {
                        debug!(
                            probed = summary.probed,
                            reconnected = summary.reconnected,
                            skipped = summary.skipped,
                            "Health pass complete"
                        );
                    }
                }
            }
            debug!("Health monitor stopped");
        });

        info!(interval_secs = interval.as_secs(), "Health monitor started");
        *slot = Some(HealthMonitor { token, handle });
        true
    }

    pub fn health_monitor_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Cancel the monitor and wait for its task to finish.
    pub async fn stop_health_monitor(&self) {
        let monitor = self.monitor.lock().take();
        let Some(monitor) = monitor else {
            return;
        };
        monitor.token.cancel();
        if let Err(e) = monitor.handle.await {
            warn!("Health monitor task ended abnormally: {}", e);
        }
    }

    /// Stop the monitor, disconnect everything, forget all servers and tools.
    pub async fn shutdown(&self) {
        self.stop_health_monitor().await;
        for id in self.server_ids() {
            self.remove_server(&id).await;
        }
        self.connections.disconnect_all().await;
        self.pool.close_all().await;
        self.inventory.clear_all();
    }
}
