//! Tool orchestrator: the entry point for listing, calling and managing tools.
//!
//! Composes the [`ServerRegistry`], the [`ExecutionEngine`] and the
//! [`DiscoveryCache`]. Construct one per process and share it behind an `Arc`.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    cache::{CacheStats, DiscoveryCache, DiscoverySnapshot},
    config::{HubConfig, ServerConfig},
    connection::{ConnectionManager, ConnectionStatus},
    engine::{ExecutionContext, ExecutionEngine, ExecutionResult},
    metrics::{ExecutionMetrics, MetricsSnapshot},
    pool::{ConnectionPool, PoolStats},
    reconnect::ReconnectPolicy,
    registry::{RegistryHealth, ServerRecord, ServerRegistry, ServerTestResult},
};
use crate::{
    error::{ErrorKind, OrchestrationError, OrchestrationResult},
    inventory::{InventoryCounts, ToolInventory, UnifiedTool},
    source::{Connector, LocalToolSet, TransportConnector},
};

/// How long `shutdown` waits for in-flight calls.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of [`ToolOrchestrator::list_all_tools`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolListing {
    pub tools: Vec<UnifiedTool>,
    pub counts: InventoryCounts,
    pub generated_at: DateTime<Utc>,
    pub cache_hit: bool,
}

impl ToolListing {
    fn from_snapshot(snapshot: &DiscoverySnapshot, cache_hit: bool) -> Self {
        Self {
            tools: snapshot.tools.clone(),
            counts: snapshot.counts,
            generated_at: snapshot.generated_at,
            cache_hit,
        }
    }
}

/// One entry of a batch.
#[derive(Debug, Clone)]
pub struct ToolCallInput {
    /// Caller-chosen identifier echoed in the output
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutput {
    pub call_id: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalToolsHealth {
    pub server_id: Option<String>,
    pub status: ConnectionStatus,
    pub tools: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionHealth {
    pub request_count: u64,
    pub error_count: u64,
    pub average_latency_ms: u64,
    pub success_rate: f64,
    pub metrics: MetricsSnapshot,
}

/// Aggregate status document.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthVerdict,
    pub checked_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub registry: RegistryHealth,
    pub execution: ExecutionHealth,
    pub local: LocalToolsHealth,
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub health_monitor_running: bool,
    pub shutting_down: bool,
}

pub struct ToolOrchestrator {
    config: HubConfig,
    registry: Arc<ServerRegistry>,
    engine: ExecutionEngine,
    cache: DiscoveryCache,
    local_tools: Arc<LocalToolSet>,
    local_server_id: RwLock<Option<String>>,
    shutdown_token: CancellationToken,
    started_at: Instant,
}

impl ToolOrchestrator {
    /// Build an orchestrator whose remote servers use the configured transports.
    pub fn new(config: HubConfig) -> OrchestrationResult<Self> {
        let connector = Arc::new(TransportConnector::new(Duration::from_secs(
            config.execution.default_timeout_secs,
        )));
        Self::with_connector(config, connector)
    }

    /// Build with a custom [`Connector`], e.g. an in-process fake.
    pub fn with_connector(
        config: HubConfig,
        connector: Arc<dyn Connector>,
    ) -> OrchestrationResult<Self> {
        config.validate()?;

        let registry = Arc::new(ServerRegistry::new(
            Arc::new(ConnectionManager::new(ReconnectPolicy::from(
                &config.reconnect,
            ))),
            Arc::new(ToolInventory::new()),
            Arc::new(ConnectionPool::new(&config.pool)),
            connector,
            Duration::from_secs(config.execution.default_timeout_secs),
            config.health.clone(),
        ));

        Ok(Self {
            engine: ExecutionEngine::new(&config.execution),
            cache: DiscoveryCache::new(Duration::from_secs(config.cache.ttl_secs)),
            local_tools: Arc::new(LocalToolSet::builtin()),
            local_server_id: RwLock::new(None),
            shutdown_token: CancellationToken::new(),
            started_at: Instant::now(),
            registry,
            config,
        })
    }

    /// Register the built-in tool set and every configured server, then start
    /// the health monitor.
    ///
    /// Unreachable servers are logged and skipped unless marked `required`.
    pub async fn initialize(&self) -> OrchestrationResult<()> {
        if self.local_server_id.read().is_none() {
            let id = self
                .registry
                .add_local_server(Arc::clone(&self.local_tools))
                .await?;
            *self.local_server_id.write() = Some(id);
        }

        for server in &self.config.servers {
            match self.registry.add_server(server.clone()).await {
                Ok(id) => info!(server_id = %id, server = %server.name, "Configured server ready"),
                Err(e) if server.required => {
                    error!(server = %server.name, "Required server unavailable: {}", e);
                    self.cache.invalidate();
                    return Err(e);
                }
                Err(e) => warn!(server = %server.name, "Skipping unavailable server: {}", e),
            }
        }
        self.cache.invalidate();

        if self.config.health.enabled {
            self.registry.start_health_monitor();
        }
        info!(servers = self.registry.len(), "Tool orchestrator initialized");
        Ok(())
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetrics> {
        self.engine.metrics()
    }

    /// The built-in tool set. Call [`refresh_server_tools`](Self::refresh_server_tools)
    /// with [`local_server_id`](Self::local_server_id) after registering more tools.
    pub fn local_tools(&self) -> &Arc<LocalToolSet> {
        &self.local_tools
    }

    pub fn local_server_id(&self) -> Option<String> {
        self.local_server_id.read().clone()
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Every tool of every server, served from the cache while it is fresh.
    pub async fn list_all_tools(&self) -> ToolListing {
        if let Some(snapshot) = self.cache.get() {
            return ToolListing::from_snapshot(&snapshot, true);
        }

        let generation = self.cache.generation();
        let started = Instant::now();
        let tools = self.registry.list_all_tools().await;
        let snapshot = Arc::new(DiscoverySnapshot {
            tools,
            counts: self.registry.inventory().counts(),
            generated_at: Utc::now(),
        });
        self.cache.store(Arc::clone(&snapshot), generation, started);
        debug!(tools = snapshot.tools.len(), "Rebuilt discovery snapshot");
        ToolListing::from_snapshot(&snapshot, false)
    }

    pub async fn get_tool_info(&self, tool_name: &str) -> OrchestrationResult<UnifiedTool> {
        self.registry.get_tool_info(tool_name).await
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Call a tool by name. The first server (in registration order) exposing
    /// the name wins.
    ///
    /// A tool that ran but reported failure comes back as
    /// [`OrchestrationError::ToolExecution`].
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<ExecutionResult> {
        self.execute(ExecutionContext::new(tool_name, arguments))
            .await
    }

    /// Call a tool on a specific server, bypassing name resolution.
    pub async fn execute_tool_on(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<ExecutionResult> {
        let ctx = ExecutionContext::new(tool_name, arguments);
        let result = self.run(&ctx, Some(server_id)).await?;
        Self::require_success(&ctx, result)
    }

    pub async fn execute(&self, ctx: ExecutionContext) -> OrchestrationResult<ExecutionResult> {
        let result = self.run(&ctx, None).await?;
        Self::require_success(&ctx, result)
    }

    /// Run every call in order. Failures become failure envelopes; the batch
    /// itself never fails.
    pub async fn execute_tools(&self, inputs: Vec<ToolCallInput>) -> Vec<ToolCallOutput> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let ctx = ExecutionContext::new(&input.tool_name, input.arguments)
                .with_metadata("call_id", Value::String(input.call_id.clone()));
            let result = match self.run(&ctx, None).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(call_id = %input.call_id, tool = %input.tool_name, "Batch call failed: {}", e);
                    ExecutionResult::from_error(&ctx.tool_name, &ctx.request_id, &e)
                }
            };
            outputs.push(ToolCallOutput {
                call_id: input.call_id,
                result,
            });
        }
        outputs
    }

    fn require_success(
        ctx: &ExecutionContext,
        result: ExecutionResult,
    ) -> OrchestrationResult<ExecutionResult> {
        if result.success {
            return Ok(result);
        }
        Err(OrchestrationError::tool_execution(
            &ctx.tool_name,
            result
                .error_message
                .unwrap_or_else(|| "tool reported an error".to_string()),
        ))
    }

    /// Resolve, validate, call with retry, normalize. A failure envelope is `Ok`.
    async fn run(
        &self,
        ctx: &ExecutionContext,
        server_id: Option<&str>,
    ) -> OrchestrationResult<ExecutionResult> {
        let metrics = Arc::clone(self.engine.metrics());
        metrics.record_call_start();
        let _guard = scopeguard::guard(Arc::clone(&metrics), |m| m.record_call_finished());

        if self.shutdown_token.is_cancelled() {
            let err = OrchestrationError::ExternalServer("orchestrator is shutting down".to_string());
            metrics.record_error(err.kind());
            return Err(err);
        }

        let resolved = match server_id {
            Some(id) => self.registry.get_tool_on(id, &ctx.tool_name).await,
            None => self.registry.get_tool_info(&ctx.tool_name).await,
        };
        let tool = match resolved {
            Ok(tool) => tool,
            Err(e) => {
                metrics.record_error(e.kind());
                return Err(e);
            }
        };

        let registry = &self.registry;
        let policy = registry.retry_policy(&tool.owning_server_id);
        let owner = tool.owning_server_id.clone();
        let name = tool.name.clone();

        let execution = self.engine.execute(ctx, &tool, policy, |args| {
            registry.call_routed(&owner, &name, args)
        });
        let result = match AssertUnwindSafe(execution).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(tool = %tool.qualified_name(), request_id = %ctx.request_id, "Tool call panicked");
                let err = OrchestrationError::Internal(format!(
                    "tool '{}' panicked",
                    tool.qualified_name()
                ));
                metrics.record_error(err.kind());
                Err(err)
            }
        };

        if !matches!(&result, Err(e) if e.kind() == ErrorKind::Validation) {
            registry.record_usage(&tool);
        }
        result
    }

    // ========================================================================
    // Server management
    // ========================================================================

    /// Register a remote server. The discovery cache is invalidated either way.
    pub async fn add_external_server(&self, config: ServerConfig) -> OrchestrationResult<String> {
        let result = self.registry.add_server(config).await;
        self.cache.invalidate();
        result
    }

    pub async fn add_local_server(&self, tools: Arc<LocalToolSet>) -> OrchestrationResult<String> {
        let result = self.registry.add_local_server(tools).await;
        self.cache.invalidate();
        result
    }

    /// Remove a server. The discovery cache is invalidated either way.
    pub async fn remove_external_server(&self, server_id: &str) -> bool {
        let removed = self.registry.remove_server(server_id).await;
        self.cache.invalidate();
        if removed && self.local_server_id().as_deref() == Some(server_id) {
            *self.local_server_id.write() = None;
        }
        removed
    }

    pub fn list_servers(&self) -> Vec<ServerRecord> {
        self.registry.list_servers()
    }

    pub fn get_server(&self, server_id: &str) -> OrchestrationResult<ServerRecord> {
        self.registry
            .server_record(server_id)
            .ok_or_else(|| OrchestrationError::ServerNotFound(server_id.to_string()))
    }

    pub fn list_server_tools(&self, server_id: &str) -> OrchestrationResult<Vec<UnifiedTool>> {
        self.registry.list_server_tools(server_id)
    }

    pub async fn test_server(&self, server_id: &str) -> OrchestrationResult<ServerTestResult> {
        self.registry.test_server(server_id).await
    }

    pub async fn refresh_server_tools(&self, server_id: &str) -> OrchestrationResult<usize> {
        let result = self.registry.refresh_server_tools(server_id).await;
        self.cache.invalidate();
        result
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Merge registry, execution and local tool health. Never probes.
    pub fn get_server_health(&self) -> HealthReport {
        let registry = self.registry.get_health();
        let snapshot = self.engine.metrics().snapshot();

        let local_id = self.local_server_id();
        let local = LocalToolsHealth {
            status: local_id
                .as_deref()
                .and_then(|id| self.registry.connections().status(id))
                .unwrap_or(ConnectionStatus::Disconnected),
            server_id: local_id,
            tools: self.local_tools.len(),
        };

        let shutting_down = self.shutdown_token.is_cancelled();
        let status = Self::verdict(&registry, &local, shutting_down);

        HealthReport {
            status,
            checked_at: Utc::now(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            execution: ExecutionHealth {
                request_count: snapshot.total_calls,
                error_count: snapshot.error_count,
                average_latency_ms: snapshot.average_latency_ms,
                success_rate: snapshot.success_rate(),
                metrics: snapshot,
            },
            registry,
            local,
            pool: self.registry.pool().stats(),
            cache: self.cache.stats(),
            health_monitor_running: self.registry.health_monitor_running(),
            shutting_down,
        }
    }

    fn verdict(
        registry: &RegistryHealth,
        local: &LocalToolsHealth,
        shutting_down: bool,
    ) -> HealthVerdict {
        if shutting_down {
            return HealthVerdict::Unhealthy;
        }
        if registry.total_servers == 0 {
            return HealthVerdict::Healthy;
        }
        if registry.connected_servers == 0 {
            return HealthVerdict::Unhealthy;
        }
        let local_down = local.server_id.is_some() && local.status != ConnectionStatus::Connected;
        if registry.connected_servers < registry.total_servers || local_down {
            return HealthVerdict::Degraded;
        }
        HealthVerdict::Healthy
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop the monitor, drain in-flight calls (bounded), close every server.
    pub async fn shutdown(&self) {
        info!("Starting graceful shutdown of ToolOrchestrator");
        self.shutdown_token.cancel();
        self.registry.stop_health_monitor().await;

        let started = Instant::now();
        while self.engine.metrics().active_executions() > 0 {
            if started.elapsed() >= SHUTDOWN_DRAIN_TIMEOUT {
                warn!(
                    active = self.engine.metrics().active_executions(),
                    "Shutdown timeout reached; abandoning in-flight executions"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.registry.shutdown().await;
        *self.local_server_id.write() = None;
        self.cache.invalidate();
        info!("ToolOrchestrator shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tool_protocol::ToolDescriptor;

    use super::*;

    fn config() -> HubConfig {
        let mut config = HubConfig::default();
        config.health.enabled = false;
        config
    }

    async fn orchestrator() -> ToolOrchestrator {
        let orchestrator = ToolOrchestrator::new(config()).unwrap();
        orchestrator.initialize().await.unwrap();
        orchestrator
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_builtin_echo_round_trip() {
        let orchestrator = orchestrator().await;

        let err = orchestrator
            .execute_tool("echo", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("text"));

        let result = orchestrator
            .execute_tool("echo", args(json!({"text": "hi"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.payload, json!("hi"));

        let tool = orchestrator.get_tool_info("echo").await.unwrap();
        assert_eq!(tool.usage_count, 1);
    }

    #[tokio::test]
    async fn test_listing_is_cached_until_topology_changes() {
        let orchestrator = orchestrator().await;
        let first = orchestrator.list_all_tools().await;
        assert!(!first.cache_hit);
        let second = orchestrator.list_all_tools().await;
        assert!(second.cache_hit);
        assert_eq!(first.tools, second.tools);

        let extra = Arc::new(LocalToolSet::new("extra"));
        extra.register_fn(ToolDescriptor::new("ping", "Ping"), |_| async {
            Ok(json!("pong"))
        });
        orchestrator.add_local_server(extra).await.unwrap();

        let third = orchestrator.list_all_tools().await;
        assert!(!third.cache_hit);
        assert_eq!(third.tools.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_metrics() {
        let orchestrator = orchestrator().await;
        let err = orchestrator
            .execute_tool("missing", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);

        let health = orchestrator.get_server_health();
        assert_eq!(health.execution.request_count, 1);
        assert_eq!(health.execution.error_count, 1);
        assert_eq!(health.execution.metrics.active_executions, 0);
    }

    #[tokio::test]
    async fn test_failure_envelope_becomes_tool_execution_error() {
        let orchestrator = orchestrator().await;
        orchestrator.local_tools().register_fn(
            ToolDescriptor::new("boom", "Always fails"),
            |_| async { Err(OrchestrationError::tool_execution("boom", "exploded")) },
        );
        let id = orchestrator.local_server_id().unwrap();
        orchestrator.refresh_server_tools(&id).await.unwrap();

        let err = orchestrator
            .execute_tool_on(&id, "boom", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecution);

        let outputs = orchestrator
            .execute_tools(vec![
                ToolCallInput {
                    call_id: "1".to_string(),
                    tool_name: "boom".to_string(),
                    arguments: Map::new(),
                },
                ToolCallInput {
                    call_id: "2".to_string(),
                    tool_name: "echo".to_string(),
                    arguments: args(json!({"text": "ok"})),
                },
            ])
            .await;
        assert_eq!(outputs.len(), 2);
        assert!(!outputs[0].result.success);
        assert_eq!(outputs[0].result.error_kind, Some(ErrorKind::ToolExecution));
        assert!(outputs[1].result.success);
    }

    #[tokio::test]
    async fn test_panicking_tool_is_contained() {
        let orchestrator = orchestrator().await;
        orchestrator.local_tools().register_fn(
            ToolDescriptor::new("panic", "Panics"),
            |_| async {
                if true {
                    panic!("bad tool");
                }
                Ok(Value::Null)
            },
        );
        let id = orchestrator.local_server_id().unwrap();
        orchestrator.refresh_server_tools(&id).await.unwrap();

        let err = orchestrator
            .execute_tool("panic", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(orchestrator.metrics().active_executions(), 0);
    }

    #[tokio::test]
    async fn test_health_verdicts() {
        let orchestrator = ToolOrchestrator::new(config()).unwrap();
        assert_eq!(orchestrator.get_server_health().status, HealthVerdict::Healthy);

        orchestrator.initialize().await.unwrap();
        let report = orchestrator.get_server_health();
        assert_eq!(report.status, HealthVerdict::Healthy);
        assert_eq!(report.local.tools, 1);
        assert_eq!(report.registry.total_servers, 1);

        orchestrator.shutdown().await;
        let report = orchestrator.get_server_health();
        assert_eq!(report.status, HealthVerdict::Unhealthy);
        assert!(orchestrator.list_servers().is_empty());
        assert!(orchestrator.execute_tool("echo", Map::new()).await.is_err());
    }
}
