//! Tool Protocol server-side dispatch.
//!
//! Answers `initialize`, `ping`, `tools/list`, `tools/call` and `tools/get`
//! against a [`ToolOrchestrator`]. Transport-agnostic: feed it parsed
//! requests or raw JSON text and write back whatever it returns.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tool_protocol::{
    methods, CallToolParams, CallToolResult, Content, GetToolParams, Implementation,
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RequestId, ServerCapabilities, ToolsCapability, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use super::{engine::ExecutionContext, orchestrator::ToolOrchestrator};

pub struct ToolProtocolHandler {
    orchestrator: Arc<ToolOrchestrator>,
    server_info: Implementation,
}

impl ToolProtocolHandler {
    pub fn new(orchestrator: Arc<ToolOrchestrator>) -> Self {
        Self {
            orchestrator,
            server_info: Implementation::new("toolhub", env!("CARGO_PKG_VERSION")),
        }
    }

    #[must_use]
    pub fn with_server_info(mut self, server_info: Implementation) -> Self {
        self.server_info = server_info;
        self
    }

    pub fn orchestrator(&self) -> &Arc<ToolOrchestrator> {
        &self.orchestrator
    }

    /// Handle one line of JSON text. `None` means nothing should be written back.
    pub async fn handle_str(&self, raw: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await?,
            Err(e) => {
                debug!("Unparseable message: {}", e);
                response_value(JsonRpcResponse::failure(
                    None,
                    JsonRpcError::parse_error(format!("Parse error: {}", e)),
                ))
            }
        };
        match serde_json::to_string(&response) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to serialize response: {}", e);
                None
            }
        }
    }

    /// Handle a single message or a batch array.
    pub async fn handle_value(&self, value: Value) -> Option<Value> {
        match value {
            Value::Array(items) if items.is_empty() => Some(response_value(JsonRpcResponse::failure(
                None,
                JsonRpcError::invalid_request("Empty batch"),
            ))),
            Value::Array(items) => {
                let mut responses = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(response) = self.handle_message(item).await {
                        responses.push(response_value(response));
                    }
                }
                (!responses.is_empty()).then_some(Value::Array(responses))
            }
            single => self.handle_message(single).await.map(response_value),
        }
    }

    async fn handle_message(&self, value: Value) -> Option<JsonRpcResponse> {
        let id = value.get("id").cloned().and_then(|id| serde_json::from_value(id).ok());
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) if request.jsonrpc == "2.0" => self.handle(request).await,
            Ok(_) => Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            )),
            Err(e) => Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::invalid_request(format!("Invalid request: {}", e)),
            )),
        }
    }

    /// Dispatch a parsed request. Notifications never get a response.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        let Some(id) = id else {
            self.handle_notification(&method);
            return None;
        };

        let result = match method.as_str() {
            methods::INITIALIZE => self.initialize(params),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(self.list_tools().await),
            methods::TOOLS_CALL => self.call_tool(&id, params).await,
            methods::TOOLS_GET => self.get_tool(params).await,
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(Some(id), value),
            Err(error) => JsonRpcResponse::failure(Some(id), error),
        })
    }

    fn handle_notification(&self, method: &str) {
        match method {
            methods::INITIALIZED_NOTIFICATION => debug!("Client finished initialization"),
            other => debug!(method = %other, "Ignoring notification"),
        }
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: Option<InitializeParams> = parse_optional_params(params)?;
        if let Some(client) = params.as_ref().and_then(|p| p.client_info.as_ref()) {
            info!(client = %client.name, version = %client.version, "Client connected");
        }
        to_result(&InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: self.server_info.clone(),
        })
    }

    async fn list_tools(&self) -> Value {
        let listing = self.orchestrator.list_all_tools().await;
        let result = ListToolsResult {
            tools: listing.tools.iter().map(|t| t.descriptor()).collect(),
            next_cursor: None,
        };
        serde_json::to_value(result).unwrap_or_else(|_| json!({"tools": []}))
    }

    async fn call_tool(&self, id: &RequestId, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallToolParams = parse_params(params)?;
        let ctx = ExecutionContext::new(params.name, params.arguments.unwrap_or_default())
            .with_metadata("jsonrpc_id", Value::String(id.to_string()));

        match self.orchestrator.execute(ctx).await {
            Ok(result) => to_result(&CallToolResult::success(vec![Content::text(
                result.payload_text(),
            )])),
            Err(e) => Err(e.to_jsonrpc()),
        }
    }

    async fn get_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: GetToolParams = parse_params(params)?;
        let tool = self
            .orchestrator
            .get_tool_info(&params.name)
            .await
            .map_err(|e| e.to_jsonrpc())?;
        to_result(&tool.details())
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

fn parse_optional_params<T: DeserializeOwned>(
    params: Option<Value>,
) -> Result<Option<T>, JsonRpcError> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e))),
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}

fn response_value(response: JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or(Value::Null)
}
