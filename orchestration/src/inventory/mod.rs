//! Tool inventory and indexing.
//!
//! This module provides tool storage and lookup with support for:
//! - Qualified tool names (handling collisions across servers)
//! - First-registered-wins lookup by simple name
//! - Per-tool usage counters

pub mod index;
pub mod types;

pub use index::{InventoryCounts, ToolInventory};
pub use types::{QualifiedToolName, UnifiedTool};
