//! Tool orchestration: one registry and execution surface over local and
//! remote tool servers.
//!
//! ## Modules
//!
//! - [`core`]: configuration, connection lifecycle, server registry, execution
//!   engine, the [`ToolOrchestrator`] facade and the protocol handler
//! - [`inventory`]: tool storage and name resolution
//! - [`source`]: local tool sets and remote (MCP or JSON-RPC over HTTP) adapters

pub mod core;
pub mod error;
pub mod inventory;
pub mod source;

pub use core::{
    ExecutionContext, ExecutionResult, HealthReport, HealthVerdict, HubConfig, ServerConfig,
    ToolCallInput, ToolCallOutput, ToolListing, ToolOrchestrator, ToolProtocolHandler, Transport,
};
pub use error::{ErrorKind, OrchestrationError, OrchestrationResult};
pub use inventory::{InventoryCounts, QualifiedToolName, ToolInventory, UnifiedTool};
pub use source::{LocalTool, LocalToolSet, RawToolOutput, SourceKind, ToolSource};
