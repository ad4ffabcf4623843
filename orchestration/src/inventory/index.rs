//! Qualified tool index with multi-key lookup.
//!
//! Thread-safe store of every discovered tool across all registered servers.
//! Provides multiple indices for efficient lookup:
//! - By qualified name (server + tool)
//! - By simple name (collisions resolved by server registration order)
//! - By server (discovery order, for bulk replacement and removal)
//!
//! Usage counters live beside the indices so a rediscovery keeps them; only
//! removing the server drops them.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tool_protocol::ToolDescriptor;
use tracing::{debug, warn};

use super::types::{QualifiedToolName, ServerSlot, ToolEntry, UnifiedTool};
use crate::source::SourceKind;

pub struct ToolInventory {
    servers: DashMap<String, ServerSlot>,
    tools_by_qualified: DashMap<QualifiedToolName, ToolEntry>,
    tools_by_simple_name: DashMap<String, Vec<QualifiedToolName>>,
    tools_by_server: DashMap<String, Vec<String>>,
    usage: DashMap<QualifiedToolName, u64>,
}

impl ToolInventory {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            tools_by_qualified: DashMap::new(),
            tools_by_simple_name: DashMap::new(),
            tools_by_server: DashMap::new(),
            usage: DashMap::new(),
        }
    }
}

impl Default for ToolInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolInventory {
    /// Make a server known. Tools for unknown servers are ignored.
    pub fn register_server(&self, server_id: &str, name: &str, source: SourceKind, seq: u64) {
        self.servers.insert(
            server_id.to_string(),
            ServerSlot {
                name: name.to_string(),
                source,
                seq,
                discovered_at: None,
            },
        );
    }

    pub fn has_server(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    /// Time since the server's tools were last replaced.
    pub fn discovery_age(&self, server_id: &str) -> Option<std::time::Duration> {
        self.servers
            .get(server_id)
            .and_then(|s| s.discovered_at.map(|at| at.elapsed()))
    }

    /// Swap a server's tool set for a fresh discovery result.
    ///
    /// Duplicate names within one listing keep the first. Returns the number
    /// of tools stored.
    pub fn replace_server_tools(&self, server_id: &str, tools: Vec<ToolDescriptor>) -> usize {
        if !self.has_server(server_id) {
            debug!(server_id = %server_id, "Dropping tools for unregistered server");
            return 0;
        }

        self.clear_server_tools(server_id);

        let mut names = Vec::with_capacity(tools.len());
        let mut seen = HashSet::new();
        for descriptor in tools {
            if !seen.insert(descriptor.name.clone()) {
                warn!(
                    server_id = %server_id,
                    tool = %descriptor.name,
                    "Server listed the same tool twice; keeping the first"
                );
                continue;
            }
            let qualified = QualifiedToolName::new(server_id, &descriptor.name);
            let tool_name = descriptor.name.clone();

            if let Some(existing) = self.tools_by_simple_name.get(&tool_name) {
                let existing_servers: Vec<&str> = existing.iter().map(|q| q.server_id()).collect();
                warn!(
                    "Tool name collision: '{}' registered by {:?}, adding from '{}'",
                    tool_name, existing_servers, server_id
                );
            }

            self.tools_by_qualified.insert(
                qualified.clone(),
                ToolEntry {
                    qualified_name: qualified.clone(),
                    descriptor,
                },
            );
            self.tools_by_simple_name
                .entry(tool_name.clone())
                .or_default()
                .push(qualified);
            names.push(tool_name);
        }

        let live: HashSet<&str> = names.iter().map(String::as_str).collect();
        self.usage
            .retain(|q, _| q.server_id() != server_id || live.contains(q.tool_name()));

        let count = names.len();
        self.tools_by_server.insert(server_id.to_string(), names);
        if let Some(mut slot) = self.servers.get_mut(server_id) {
            slot.discovered_at = Some(Instant::now());
        }
        count
    }

    /// Drop a server's tools (failed discovery). Usage counters are kept.
    pub fn clear_server_tools(&self, server_id: &str) {
        if let Some((_, tool_names)) = self.tools_by_server.remove(server_id) {
            for tool_name in tool_names {
                let qualified = QualifiedToolName::new(server_id, &tool_name);
                self.tools_by_qualified.remove(&qualified);

                if let Some(mut entry) = self.tools_by_simple_name.get_mut(&tool_name) {
                    entry.retain(|q| q != &qualified);
                }
                self.tools_by_simple_name
                    .remove_if(&tool_name, |_, v| v.is_empty());
            }
        }
    }

    /// Forget a server entirely, including its usage counters.
    pub fn remove_server(&self, server_id: &str) {
        self.clear_server_tools(server_id);
        self.servers.remove(server_id);
        self.usage.retain(|q, _| q.server_id() != server_id);
    }

    /// Returns the tool from the earliest-registered server on collision.
    /// Use `get_tool_qualified()` for a specific server.
    pub fn get_tool(&self, tool_name: &str) -> Option<UnifiedTool> {
        let candidates = self.tools_by_simple_name.get(tool_name)?.value().clone();
        candidates
            .iter()
            .filter_map(|q| {
                let seq = self.servers.get(q.server_id())?.seq;
                Some((seq, q))
            })
            .min_by_key(|(seq, _)| *seq)
            .and_then(|(_, q)| self.get_tool_qualified(q.server_id(), q.tool_name()))
    }

    pub fn get_tool_qualified(&self, server_id: &str, tool_name: &str) -> Option<UnifiedTool> {
        let qualified = QualifiedToolName::new(server_id, tool_name);
        let entry = self.tools_by_qualified.get(&qualified)?.value().clone();
        self.to_unified(&entry)
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools_by_simple_name.contains_key(tool_name)
    }

    /// Every server exposing `tool_name`, in registration order.
    pub fn get_tool_servers(&self, tool_name: &str) -> Vec<String> {
        let Some(candidates) = self
            .tools_by_simple_name
            .get(tool_name)
            .map(|v| v.value().clone())
        else {
            return Vec::new();
        };
        let mut ranked: Vec<(u64, String)> = candidates
            .into_iter()
            .filter_map(|q| {
                let seq = self.servers.get(q.server_id())?.seq;
                Some((seq, q.server_id))
            })
            .collect();
        ranked.sort_by_key(|(seq, _)| *seq);
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    /// All tools, ordered by server registration then discovery position.
    /// Collisions are all included.
    pub fn list_tools(&self) -> Vec<UnifiedTool> {
        let mut servers: Vec<(u64, String)> = self
            .servers
            .iter()
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        servers.sort_by_key(|(seq, _)| *seq);

        servers
            .into_iter()
            .flat_map(|(_, server_id)| self.list_server_tools(&server_id))
            .collect()
    }

    pub fn list_server_tools(&self, server_id: &str) -> Vec<UnifiedTool> {
        let names = match self.tools_by_server.get(server_id) {
            Some(names) => names.value().clone(),
            None => return Vec::new(),
        };
        names
            .iter()
            .filter_map(|name| self.get_tool_qualified(server_id, name))
            .collect()
    }

    /// Count one call. Returns the new total.
    pub fn record_usage(&self, server_id: &str, tool_name: &str) -> u64 {
        let mut count = self
            .usage
            .entry(QualifiedToolName::new(server_id, tool_name))
            .or_insert(0);
        *count += 1;
        *count
    }

    pub fn usage_count(&self, server_id: &str, tool_name: &str) -> u64 {
        self.usage
            .get(&QualifiedToolName::new(server_id, tool_name))
            .map_or(0, |c| *c)
    }

    pub fn counts(&self) -> InventoryCounts {
        InventoryCounts {
            tools: self.tools_by_qualified.len(),
            unique_names: self.tools_by_simple_name.len(),
            servers: self.servers.len(),
            servers_with_tools: self.tools_by_server.len(),
        }
    }

    pub fn clear_all(&self) {
        self.tools_by_qualified.clear();
        self.tools_by_simple_name.clear();
        self.tools_by_server.clear();
        self.servers.clear();
        self.usage.clear();
    }

    fn to_unified(&self, entry: &ToolEntry) -> Option<UnifiedTool> {
        let server_id = entry.qualified_name.server_id();
        let (server_name, source) = {
            let slot = self.servers.get(server_id)?;
            (slot.name.clone(), slot.source)
        };
        Some(UnifiedTool {
            name: entry.descriptor.name.clone(),
            description: entry.descriptor.description.clone(),
            owning_server_id: server_id.to_string(),
            server_name,
            source,
            input_schema: entry.descriptor.input_schema.clone(),
            usage_count: self.usage_count(server_id, entry.qualified_name.tool_name()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryCounts {
    pub tools: usize,
    pub unique_names: usize,
    pub servers: usize,
    pub servers_with_tools: usize,
}
