//! Orchestration core: configuration, connections, registry and execution.

pub mod cache;
pub mod config;
pub mod connection;
pub mod engine;
pub mod handler;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod reconnect;
pub mod registry;

pub use cache::{CacheStats, DiscoveryCache, DiscoverySnapshot};
pub use config::{
    CacheConfig, ExecutionConfig, HealthConfig, HubConfig, PoolConfig, ReconnectConfig,
    RetryPolicy, ServerConfig, Transport,
};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use engine::{
    coerce_arguments, format_result, validate_parameters, ExecutionContext, ExecutionEngine,
    ExecutionResult,
};
pub use handler::ToolProtocolHandler;
pub use metrics::{ExecutionMetrics, LatencySnapshot, MetricsSnapshot};
pub use orchestrator::{
    ExecutionHealth, HealthReport, HealthVerdict, LocalToolsHealth, ToolCallInput,
    ToolCallOutput, ToolListing, ToolOrchestrator,
};
pub use pool::{ConnectionPool, PoolKey, PoolStats};
pub use reconnect::ReconnectPolicy;
pub use registry::{HealthPassSummary, RegistryHealth, ServerRecord, ServerRegistry, ServerTestResult};
