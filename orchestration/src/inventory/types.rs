//! Core types for the tool inventory.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tool_protocol::{ToolDescriptor, ToolDetails};

use crate::source::SourceKind;

/// Unique tool identifier: `server_id:tool_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedToolName {
    pub server_id: String,
    pub tool_name: String,
}

impl QualifiedToolName {
    pub fn new(server_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Parse from "server:tool" format.
    pub fn parse(s: &str) -> Option<Self> {
        let (server, tool) = s.split_once(':')?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self::new(server, tool))
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.tool_name)
    }
}

/// Source-agnostic view of one discovered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTool {
    pub name: String,
    pub description: String,
    pub owning_server_id: String,
    pub server_name: String,
    pub source: SourceKind,
    pub input_schema: Value,
    pub usage_count: u64,
}

impl UnifiedTool {
    pub fn qualified_name(&self) -> QualifiedToolName {
        QualifiedToolName::new(&self.owning_server_id, &self.name)
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(&self.name, &self.description).with_input_schema(self.input_schema.clone())
    }

    pub fn details(&self) -> ToolDetails {
        ToolDetails {
            descriptor: self.descriptor(),
            server_id: self.owning_server_id.clone(),
            server_name: self.server_name.clone(),
            source: self.source.as_str().to_string(),
            usage_count: self.usage_count,
        }
    }
}

/// Registration facts the inventory needs about a server.
#[derive(Debug, Clone)]
pub(crate) struct ServerSlot {
    pub name: String,
    pub source: SourceKind,
    /// Registration order; lower wins name collisions
    pub seq: u64,
    pub discovered_at: Option<Instant>,
}

/// One tool as stored in the index.
#[derive(Debug, Clone)]
pub(crate) struct ToolEntry {
    pub qualified_name: QualifiedToolName,
    pub descriptor: ToolDescriptor,
}
