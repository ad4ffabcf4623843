//! Tool source adapters.
//!
//! A [`ToolSource`] can list its tools and run one by name. Two families exist:
//!
//! - [`local`]: an in-process table of tools
//! - [`remote`]: a pooled wire client (rmcp stdio/SSE/streamable HTTP, or JSON-RPC over HTTP)

pub mod local;
pub mod remote;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tool_protocol::ToolDescriptor;

pub use local::{EchoTool, LocalTool, LocalToolSet};
pub use remote::{
    Connector, JsonRpcHttpClient, McpToolClient, RemoteClient, RemoteToolSource,
    TransportConnector,
};

use crate::error::OrchestrationResult;

/// Where a server's tools run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::Remote => "remote",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw result of one tool call, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawToolOutput {
    /// Value returned by an in-process tool
    Local(Value),
    /// `result` member of a Tool Protocol JSON-RPC response
    JsonRpc(Value),
    /// MCP content array plus its `isError` flag
    Content { content: Vec<Value>, is_error: bool },
}

#[async_trait]
pub trait ToolSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// URL, command line, or a `local://` name
    fn address(&self) -> String;

    /// Open (or reopen) the underlying client.
    async fn connect(&self) -> OrchestrationResult<()>;

    /// Lightweight liveness check against an open client.
    async fn probe(&self) -> OrchestrationResult<()>;

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput>;

    /// Release client resources. Callers log failures and move on.
    async fn disconnect(&self) -> OrchestrationResult<()>;
}
