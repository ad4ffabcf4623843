//! Remote tool sources.
//!
//! [`RemoteToolSource`] is the adapter the registry sees. It borrows a live
//! [`RemoteClient`] from the shared [`ConnectionPool`], creating one through a
//! [`Connector`] on a miss, and bounds every outbound call with the server's
//! timeout. Retryable failures evict the pooled client so the next call
//! reconnects.

use std::{
    borrow::Cow,
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use rmcp::{
    model::CallToolRequestParam,
    service::{RunningService, ServiceError},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde_json::{json, Map, Value};
use tool_protocol::{
    error_codes, methods, Implementation, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, ToolDescriptor, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use super::{RawToolOutput, SourceKind, ToolSource};
use crate::{
    core::{
        config::{ServerConfig, Transport},
        pool::{ConnectionPool, PoolKey},
    },
    error::{OrchestrationError, OrchestrationResult},
};

type McpClient = RunningService<RoleClient, ()>;

/// Upper bound on `tools/list` pages followed for one discovery.
const MAX_LIST_PAGES: usize = 64;

/// A live connection to one remote tool server.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn probe(&self) -> OrchestrationResult<()>;

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput>;

    async fn close(&self);
}

/// Opens [`RemoteClient`]s for server configs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> OrchestrationResult<Arc<dyn RemoteClient>>;
}

// ============================================================================
// MCP client (rmcp)
// ============================================================================

pub struct McpToolClient {
    name: String,
    inner: RwLock<Option<Arc<McpClient>>>,
}

impl McpToolClient {
    fn new(name: &str, client: McpClient) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(Some(Arc::new(client))),
        }
    }

    fn client(&self) -> OrchestrationResult<Arc<McpClient>> {
        self.inner.read().clone().ok_or_else(|| {
            OrchestrationError::Transport(format!("client for '{}' is closed", self.name))
        })
    }

    pub async fn stdio(
        name: &str,
        command: &str,
        args: &[String],
        envs: &HashMap<String, String>,
    ) -> OrchestrationResult<Self> {
        let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
            |cmd| {
                cmd.args(args)
                    .envs(envs.iter())
                    .stderr(std::process::Stdio::inherit());
            },
        ))
        .map_err(|e| OrchestrationError::Transport(format!("create stdio transport: {}", e)))?;

        let client = ().serve(transport).await.map_err(|e| {
            OrchestrationError::connection(command, format!("initialize stdio client: {}", e))
        })?;

        info!(server = %name, "Connected to stdio server");
        Ok(Self::new(name, client))
    }

    pub async fn sse(name: &str, url: &str, http: reqwest::Client) -> OrchestrationResult<Self> {
        let cfg = SseClientConfig {
            sse_endpoint: url.to_string().into(),
            ..Default::default()
        };
        let transport = SseClientTransport::start_with_client(http, cfg)
            .await
            .map_err(|e| OrchestrationError::connection(url, format!("create SSE transport: {}", e)))?;

        let client = ().serve(transport).await.map_err(|e| {
            OrchestrationError::connection(url, format!("initialize SSE client: {}", e))
        })?;

        info!(server = %name, url = %url, "Connected to SSE server");
        Ok(Self::new(name, client))
    }

    pub async fn streamable(
        name: &str,
        url: &str,
        http: reqwest::Client,
    ) -> OrchestrationResult<Self> {
        let transport = StreamableHttpClientTransport::with_client(
            http,
            StreamableHttpClientTransportConfig::with_uri(url.to_string()),
        );

        let client = ().serve(transport).await.map_err(|e| {
            OrchestrationError::connection(url, format!("initialize streamable client: {}", e))
        })?;

        info!(server = %name, url = %url, "Connected to streamable HTTP server");
        Ok(Self::new(name, client))
    }

    fn map_service_error(&self, tool_name: Option<&str>, err: ServiceError) -> OrchestrationError {
        match (err, tool_name) {
            (ServiceError::McpError(data), Some(tool)) => {
                OrchestrationError::tool_execution(tool, data.message.to_string())
            }
            (ServiceError::McpError(data), None) => {
                OrchestrationError::ExternalServer(format!("{}: {}", self.name, data.message))
            }
            (other, _) => OrchestrationError::Transport(format!("{}: {}", self.name, other)),
        }
    }
}

#[async_trait]
impl RemoteClient for McpToolClient {
    async fn probe(&self) -> OrchestrationResult<()> {
        let client = self.client()?;
        client
            .list_tools(None)
            .await
            .map(|_| ())
            .map_err(|e| self.map_service_error(None, e))
    }

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
        let client = self.client()?;
        let tools = client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| self.map_service_error(None, e))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        let client = self.client()?;
        let request = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments: Some(arguments),
        };
        let result = client
            .call_tool(request)
            .await
            .map_err(|e| self.map_service_error(Some(name), e))?;

        let mut content = match serde_json::to_value(&result.content)? {
            Value::Array(items) => items,
            other => vec![other],
        };
        if let Some(structured) = result.structured_content {
            if content.is_empty() {
                content.push(json!({"type": "json", "json": structured}));
            }
        }
        Ok(RawToolOutput::Content {
            content,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn close(&self) {
        let client = self.inner.write().take();
        let Some(client) = client else {
            return;
        };
        match Arc::try_unwrap(client) {
            Ok(client) => {
                if let Err(e) = client.cancel().await {
                    warn!(server = %self.name, "Error closing MCP client: {}", e);
                }
            }
            Err(_) => {
                warn!(server = %self.name, "MCP client still in use on close; dropping reference");
            }
        }
    }
}

// ============================================================================
// Tool Protocol over HTTP
// ============================================================================

/// Plain JSON-RPC 2.0 client: one HTTP POST per request.
pub struct JsonRpcHttpClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicI64,
}

impl JsonRpcHttpClient {
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request. The outer error is transport-level; the inner one is
    /// the server's JSON-RPC error object.
    async fn rpc(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> OrchestrationResult<Result<Value, JsonRpcError>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        debug!(url = %self.url, method = %method, id, "Sending JSON-RPC request");

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    OrchestrationError::connection(&self.url, e.to_string())
                } else {
                    OrchestrationError::Transport(format!("{}: {}", self.url, e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(OrchestrationError::Transport(format!(
                "{} returned {}",
                self.url, status
            )));
        }
        if !status.is_success() {
            return Err(OrchestrationError::ExternalServer(format!(
                "{} returned {}",
                self.url, status
            )));
        }

        let body: JsonRpcResponse = response.json().await.map_err(|e| {
            OrchestrationError::ExternalServer(format!(
                "invalid JSON-RPC response from {}: {}",
                self.url, e
            ))
        })?;
        Ok(body.into_result())
    }

    /// Protocol handshake; establishes that the server speaks the Tool Protocol.
    pub async fn initialize(&self) -> OrchestrationResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            client_info: Some(Implementation::new(
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            )),
        };
        let result = self
            .rpc(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?
            .map_err(|e| {
                OrchestrationError::ExternalServer(format!("{} rejected initialize: {}", self.url, e))
            })?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl RemoteClient for JsonRpcHttpClient {
    /// Any well-formed JSON-RPC reply, error or not, counts as alive.
    async fn probe(&self) -> OrchestrationResult<()> {
        self.rpc(methods::PING, None).await.map(|_| ())
    }

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page = self
                .rpc(methods::TOOLS_LIST, Some(params))
                .await?
                .map_err(|e| {
                    OrchestrationError::ExternalServer(format!("{} tools/list: {}", self.url, e))
                })?;
            let page: ListToolsResult = serde_json::from_value(page)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        warn!(url = %self.url, "tools/list pagination exceeded {} pages; truncating", MAX_LIST_PAGES);
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        let params = json!({ "name": name, "arguments": arguments });
        match self.rpc(methods::TOOLS_CALL, Some(params)).await? {
            Ok(result) => Ok(RawToolOutput::JsonRpc(result)),
            Err(e) => Err(match e.error_code() {
                Some("TOOL_NOT_FOUND") => OrchestrationError::ToolNotFound(name.to_string()),
                Some("VALIDATION_ERROR") => OrchestrationError::Validation {
                    tool_name: name.to_string(),
                    errors: vec![e.message],
                },
                _ if e.code == error_codes::METHOD_NOT_FOUND => {
                    OrchestrationError::ExternalServer(format!("{}: {}", self.url, e.message))
                }
                _ => OrchestrationError::tool_execution(name, e.message),
            }),
        }
    }

    async fn close(&self) {}
}

// ============================================================================
// Connector
// ============================================================================

/// Builds clients according to each server's configured transport.
pub struct TransportConnector {
    default_timeout: Duration,
}

impl TransportConnector {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn default_headers(
    token: Option<&str>,
    headers: &HashMap<String, String>,
) -> OrchestrationResult<HeaderMap> {
    let mut header_map = HeaderMap::new();
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| OrchestrationError::Config(format!("auth token: {}", e)))?;
        header_map.insert(AUTHORIZATION, value);
    }
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| OrchestrationError::Config(format!("header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| OrchestrationError::Config(format!("header '{}': {}", name, e)))?;
        header_map.insert(name, value);
    }
    Ok(header_map)
}

/// `streaming` clients (SSE, streamable HTTP) keep responses open, so they
/// only get a connect timeout.
fn build_http_client(
    token: Option<&str>,
    headers: &HashMap<String, String>,
    timeout: Duration,
    streaming: bool,
) -> OrchestrationResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .default_headers(default_headers(token, headers)?);
    if !streaming {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| OrchestrationError::Transport(format!("build HTTP client: {}", e)))
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, config: &ServerConfig) -> OrchestrationResult<Arc<dyn RemoteClient>> {
        let timeout = config.timeout_secs.map_or(self.default_timeout, Duration::from_secs);
        info!(
            server = %config.name,
            "Connecting to tool server via {:?}",
            config.transport
        );

        let client: Arc<dyn RemoteClient> = match &config.transport {
            Transport::Stdio {
                command,
                args,
                envs,
            } => Arc::new(McpToolClient::stdio(&config.name, command, args, envs).await?),
            Transport::Sse {
                url,
                token,
                headers,
            } => {
                let http = build_http_client(token.as_deref(), headers, timeout, true)?;
                Arc::new(McpToolClient::sse(&config.name, url, http).await?)
            }
            Transport::Streamable {
                url,
                token,
                headers,
            } => {
                let http = build_http_client(token.as_deref(), headers, timeout, true)?;
                Arc::new(McpToolClient::streamable(&config.name, url, http).await?)
            }
            Transport::Http {
                url,
                token,
                headers,
            } => {
                let http = build_http_client(token.as_deref(), headers, timeout, false)?;
                let client = JsonRpcHttpClient::new(url.clone(), http);
                let info = client.initialize().await?;
                info!(
                    server = %config.name,
                    url = %url,
                    remote = %info.server_info.name,
                    protocol = %info.protocol_version,
                    "Connected to Tool Protocol server"
                );
                Arc::new(client)
            }
        };
        Ok(client)
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct RemoteToolSource {
    server_name: String,
    config: ServerConfig,
    key: PoolKey,
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl RemoteToolSource {
    pub fn new(
        server_id: &str,
        config: ServerConfig,
        pool: Arc<ConnectionPool>,
        connector: Arc<dyn Connector>,
        timeout: Duration,
    ) -> Self {
        Self {
            server_name: config.name.clone(),
            key: PoolKey::from_config(server_id, &config),
            config,
            pool,
            connector,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn client(&self) -> OrchestrationResult<Arc<dyn RemoteClient>> {
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        self.pool
            .get_or_create(self.key.clone(), || async move {
                connector.connect(&config).await
            })
            .await
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> OrchestrationResult<T>
    where
        F: Future<Output = OrchestrationResult<T>>,
    {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::Timeout {
                operation: format!("{} on '{}'", operation, self.server_name),
                elapsed: self.timeout,
            }),
        };
        if let Err(e) = &result {
            if e.is_retryable() {
                debug!(server = %self.server_name, "Evicting pooled client after: {}", e);
                self.pool.remove(&self.key);
            }
        }
        result
    }
}

#[async_trait]
impl ToolSource for RemoteToolSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn address(&self) -> String {
        self.config.transport.address()
    }

    async fn connect(&self) -> OrchestrationResult<()> {
        self.timed("connect", self.client()).await.map(|_| ())
    }

    async fn probe(&self) -> OrchestrationResult<()> {
        self.timed("probe", async {
            let client = self.client().await?;
            client.probe().await
        })
        .await
    }

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
        self.timed("tools/list", async {
            let client = self.client().await?;
            client.list_tools().await
        })
        .await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        self.timed("tools/call", async {
            let client = self.client().await?;
            client.call_tool(name, arguments).await
        })
        .await
    }

    async fn disconnect(&self) -> OrchestrationResult<()> {
        if let Some(client) = self.pool.take(&self.key) {
            client.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::core::config::PoolConfig;

    struct FlakyClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteClient for FlakyClient {
        async fn probe(&self) -> OrchestrationResult<()> {
            Ok(())
        }

        async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
            Ok(vec![ToolDescriptor::new("search", "Search")])
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Map<String, Value>,
        ) -> OrchestrationResult<RawToolOutput> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(OrchestrationError::Transport("reset by peer".to_string()))
            } else {
                Ok(RawToolOutput::JsonRpc(json!({"content": []})))
            }
        }

        async fn close(&self) {}
    }

    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _config: &ServerConfig) -> OrchestrationResult<Arc<dyn RemoteClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakyClient {
                calls: AtomicUsize::new(0),
            }))
        }
    }

    fn source(connector: Arc<CountingConnector>) -> RemoteToolSource {
        RemoteToolSource::new(
            "srv-1",
            ServerConfig::new("web", Transport::http("http://localhost:9000")),
            Arc::new(ConnectionPool::new(&PoolConfig::default())),
            connector,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_client_is_pooled() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
        });
        let source = source(Arc::clone(&connector));
        source.connect().await.unwrap();
        source.probe().await.unwrap();
        assert_eq!(source.list_tools().await.unwrap().len(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_evicts_client() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
        });
        let source = source(Arc::clone(&connector));

        let err = source.call_tool("search", Map::new()).await.unwrap_err();
        assert!(err.is_retryable());

        // Fresh client from a second connect; its first call fails again
        let err = source.call_tool("search", Map::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_releases_client() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
        });
        let source = source(Arc::clone(&connector));
        source.connect().await.unwrap();
        source.disconnect().await.unwrap();
        source.connect().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_http_server_is_connection_error() {
        let connector = TransportConnector::new(Duration::from_secs(2));
        let config = ServerConfig::new("dead", Transport::http("http://127.0.0.1:1/rpc"));
        let err = match connector.connect(&config).await {
            Ok(_) => panic!("connect to a closed port must fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }
}
