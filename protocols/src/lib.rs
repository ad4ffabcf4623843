//! Tool Protocol wire types.
//!
//! The Tool Protocol is JSON-RPC 2.0 shaped: every message carries
//! `jsonrpc: "2.0"` and an `id`, and every response carries either a
//! `result` or an `error`. This crate only defines the payloads; transport
//! and dispatch live in `tool-orchestration`.
//!
//! ## Modules
//!
//! - [`jsonrpc`]: request/response envelopes and standard error codes
//! - [`tools`]: `initialize`, `tools/list`, `tools/call` and `tools/get` payloads

pub mod jsonrpc;
pub mod tools;

pub use jsonrpc::{error_codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use tools::{
    methods, CallToolParams, CallToolResult, Content, GetToolParams, Implementation,
    InitializeParams, InitializeResult, ListToolsResult, ServerCapabilities, ToolDescriptor,
    ToolDetails, ToolsCapability, PROTOCOL_VERSION,
};
