//! End-to-end behavior of the orchestrator facade over in-process fake servers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tool_orchestration::{
    core::{HealthVerdict, HubConfig, ServerConfig, ToolCallInput, ToolOrchestrator, Transport},
    source::{Connector, LocalToolSet, RawToolOutput, RemoteClient},
    ErrorKind, OrchestrationError, OrchestrationResult,
};
use tool_protocol::ToolDescriptor;

struct FakeServer {
    tools: Vec<ToolDescriptor>,
    list_fails: AtomicBool,
    /// Calls left that fail with a connection error before one succeeds
    failures_left: AtomicU32,
    /// Every call fails with a transport error
    broken_transport: AtomicBool,
    /// Every call outlives any sane timeout
    hangs: AtomicBool,
    calls: AtomicU32,
}

impl FakeServer {
    fn new(tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tools: tools
                .iter()
                .map(|name| {
                    ToolDescriptor::new(*name, format!("{} tool", name)).with_input_schema(json!({
                        "type": "object",
                        "properties": {"query": {"type": "string"}}
                    }))
                })
                .collect(),
            list_fails: AtomicBool::new(false),
            failures_left: AtomicU32::new(0),
            broken_transport: AtomicBool::new(false),
            hangs: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RemoteClient for FakeServer {
    async fn probe(&self) -> OrchestrationResult<()> {
        Ok(())
    }

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(OrchestrationError::Transport("listing exploded".to_string()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.broken_transport.load(Ordering::SeqCst) {
            return Err(OrchestrationError::Transport("502 bad gateway".to_string()));
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(OrchestrationError::connection("fake", "connection reset"));
        }
        Ok(RawToolOutput::JsonRpc(json!({
            "content": [{"type": "text", "text": format!("{} done", name)}],
            "isError": false
        })))
    }

    async fn close(&self) {}
}

/// Resolves URLs to fake servers; anything else is unreachable.
#[derive(Default)]
struct FakeConnector {
    servers: HashMap<String, Arc<FakeServer>>,
}

impl FakeConnector {
    fn with(mut self, url: &str, server: Arc<FakeServer>) -> Self {
        self.servers.insert(url.to_string(), server);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ServerConfig) -> OrchestrationResult<Arc<dyn RemoteClient>> {
        let address = config.transport.address();
        match self.servers.get(&address) {
            Some(server) => Ok(Arc::clone(server) as Arc<dyn RemoteClient>),
            None => Err(OrchestrationError::connection(address, "connection refused")),
        }
    }
}

fn config() -> HubConfig {
    let mut config = HubConfig::default();
    config.health.enabled = false;
    config.execution.max_retries = 2;
    config.execution.base_delay_ms = 10;
    config
}

async fn orchestrator(connector: FakeConnector) -> ToolOrchestrator {
    let orchestrator = ToolOrchestrator::with_connector(config(), Arc::new(connector)).unwrap();
    orchestrator.initialize().await.unwrap();
    orchestrator
}

fn server(name: &str, url: &str) -> ServerConfig {
    ServerConfig::new(name, Transport::http(url))
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_removed_server_tools_are_gone() {
    let connector = FakeConnector::default()
        .with("http://a", FakeServer::new(&["search"]))
        .with("http://b", FakeServer::new(&["fetch"]));
    let orch = orchestrator(connector).await;

    let a = orch.add_external_server(server("a", "http://a")).await.unwrap();
    let b = orch.add_external_server(server("b", "http://b")).await.unwrap();

    let fetch = orch.get_tool_info("fetch").await.unwrap();
    assert_eq!(fetch.owning_server_id, b);
    assert!(orch.registry().contains(&fetch.owning_server_id));

    assert!(orch.remove_external_server(&b).await);
    let listing = orch.list_all_tools().await;
    assert!(!listing.cache_hit);
    assert!(listing.tools.iter().all(|t| t.owning_server_id != b));
    assert!(listing.tools.iter().any(|t| t.owning_server_id == a));

    let err = orch.get_tool_info("fetch").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolNotFound);
}

#[tokio::test]
async fn test_repeated_listing_is_served_from_cache() {
    let connector = FakeConnector::default().with("http://a", FakeServer::new(&["search", "fetch"]));
    let orch = orchestrator(connector).await;
    orch.add_external_server(server("a", "http://a")).await.unwrap();

    let first = orch.list_all_tools().await;
    let second = orch.list_all_tools().await;
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.tools, second.tools);
    assert_eq!(second.counts.tools, 3);
}

#[tokio::test]
async fn test_added_server_appears_in_health() {
    let connector = FakeConnector::default().with("http://a", FakeServer::new(&["search"]));
    let orch = orchestrator(connector).await;
    let id = orch.add_external_server(server("a", "http://a")).await.unwrap();

    let report = orch.get_server_health();
    let record = report
        .registry
        .servers
        .iter()
        .find(|s| s.server_id == id)
        .expect("server present in health report");
    assert_eq!(record.tool_count, 1);
    assert_eq!(report.status, HealthVerdict::Healthy);
    assert_eq!(report.registry.total_servers, 2);
}

#[tokio::test]
async fn test_one_failing_server_does_not_break_listing() {
    let broken = FakeServer::new(&["fetch"]);
    broken.list_fails.store(true, Ordering::SeqCst);
    let connector = FakeConnector::default()
        .with("http://a", FakeServer::new(&["search"]))
        .with("http://b", broken)
        .with("http://c", FakeServer::new(&["summarize"]));
    let orch = orchestrator(connector).await;

    for (name, url) in [("a", "http://a"), ("b", "http://b"), ("c", "http://c")] {
        orch.add_external_server(server(name, url)).await.unwrap();
    }

    let listing = orch.list_all_tools().await;
    let names: Vec<&str> = listing.tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"search"));
    assert!(names.contains(&"summarize"));
    assert!(!names.contains(&"fetch"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let flaky = FakeServer::new(&["search"]);
    flaky.failures_left.store(2, Ordering::SeqCst);
    let connector = FakeConnector::default().with("http://a", Arc::clone(&flaky));
    let orch = orchestrator(connector).await;
    orch.add_external_server(server("a", "http://a")).await.unwrap();

    let result = orch.execute_tool("search", Map::new()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.payload, json!("search done"));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let snapshot = orch.metrics().snapshot();
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.successful_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_the_configured_bound() {
    let down = FakeServer::new(&["search"]);
    down.failures_left.store(u32::MAX, Ordering::SeqCst);
    let connector = FakeConnector::default().with("http://a", Arc::clone(&down));
    let orch = orchestrator(connector).await;
    orch.add_external_server(server("a", "http://a")).await.unwrap();

    let err = orch.execute_tool("search", Map::new()).await.unwrap_err();
    match err {
        OrchestrationError::Connection { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_eq!(down.calls.load(Ordering::SeqCst), 3);
    assert_eq!(orch.metrics().snapshot().failed_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_transport_errors_report_attempts() {
    let flaky = FakeServer::new(&["search"]);
    flaky.broken_transport.store(true, Ordering::SeqCst);
    let connector = FakeConnector::default().with("http://a", Arc::clone(&flaky));
    let orch = orchestrator(connector).await;
    orch.add_external_server(server("a", "http://a")).await.unwrap();

    let err = orch.execute_tool("search", Map::new()).await.unwrap_err();
    match err {
        OrchestrationError::Connection {
            attempts, message, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(message.contains("502 bad gateway"));
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_timeouts_report_attempts() {
    let slow = FakeServer::new(&["search"]);
    slow.hangs.store(true, Ordering::SeqCst);
    let connector = FakeConnector::default().with("http://a", Arc::clone(&slow));
    let orch = orchestrator(connector).await;
    orch.add_external_server(server("a", "http://a").with_timeout(1))
        .await
        .unwrap();

    let err = orch.execute_tool("search", Map::new()).await.unwrap_err();
    match err {
        OrchestrationError::Connection {
            attempts, message, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(message.contains("timed out"));
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_validation_reports_every_missing_field() {
    let orch = orchestrator(FakeConnector::default()).await;
    let tools = Arc::new(LocalToolSet::new("math"));
    tools.register_fn(
        ToolDescriptor::new("add", "Add two numbers").with_input_schema(json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
        })),
        |args| async move {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or_default();
            let b = args.get("b").and_then(Value::as_f64).unwrap_or_default();
            Ok(json!(a + b))
        },
    );
    orch.add_local_server(tools).await.unwrap();

    let err = orch.execute_tool("add", Map::new()).await.unwrap_err();
    match err {
        OrchestrationError::Validation { errors, .. } => {
            assert_eq!(errors.len(), 2);
            assert!(errors.iter().any(|e| e.contains("'a'")));
            assert!(errors.iter().any(|e| e.contains("'b'")));
        }
        other => panic!("expected validation error, got {:?}", other),
    }

    // quoted numbers are coerced before validation
    let result = orch
        .execute_tool("add", args(json!({"a": "2", "b": 3})))
        .await
        .unwrap();
    assert_eq!(result.payload, json!(5.0));
}

#[tokio::test]
async fn test_echo_round_trip() {
    let orch = orchestrator(FakeConnector::default()).await;

    let err = orch.execute_tool("echo", Map::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("text"));

    let result = orch
        .execute_tool("echo", args(json!({"text": "hi"})))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.payload, json!("hi"));
    assert_eq!(result.server_id, orch.local_server_id());
}

#[tokio::test]
async fn test_unreachable_server_is_not_registered() {
    let orch = orchestrator(FakeConnector::default()).await;

    let err = orch
        .add_external_server(server("ghost", "http://10.255.255.1:9"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    assert!(orch.list_servers().iter().all(|s| s.name != "ghost"));
    let listing = orch.list_all_tools().await;
    assert!(listing.tools.iter().all(|t| t.server_name != "ghost"));
}

#[tokio::test]
async fn test_first_registered_server_wins_name_collisions() {
    let connector = FakeConnector::default()
        .with("http://first", FakeServer::new(&["search"]))
        .with("http://second", FakeServer::new(&["search"]));
    let orch = orchestrator(connector).await;
    let first = orch
        .add_external_server(server("first", "http://first"))
        .await
        .unwrap();
    let second = orch
        .add_external_server(server("second", "http://second"))
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(orch.get_tool_info("search").await.unwrap().owning_server_id, first);
    }

    let routed = orch.execute_tool("search", Map::new()).await.unwrap();
    assert_eq!(routed.server_id.as_deref(), Some(first.as_str()));

    let qualified = orch
        .execute_tool_on(&second, "search", Map::new())
        .await
        .unwrap();
    assert_eq!(qualified.server_id.as_deref(), Some(second.as_str()));
}

#[tokio::test]
async fn test_batch_never_fails_as_a_whole() {
    let orch = orchestrator(FakeConnector::default()).await;
    let outputs = orch
        .execute_tools(vec![
            ToolCallInput {
                call_id: "1".to_string(),
                tool_name: "echo".to_string(),
                arguments: args(json!({"text": "one"})),
            },
            ToolCallInput {
                call_id: "2".to_string(),
                tool_name: "missing".to_string(),
                arguments: Map::new(),
            },
        ])
        .await;

    assert_eq!(outputs.len(), 2);
    assert!(outputs[0].result.success);
    assert_eq!(outputs[1].call_id, "2");
    assert!(!outputs[1].result.success);
    assert_eq!(outputs[1].result.error_kind, Some(ErrorKind::ToolNotFound));
}

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let connector = FakeConnector::default().with("http://a", FakeServer::new(&["search"]));
    let orch = orchestrator(connector).await;
    orch.add_external_server(server("a", "http://a")).await.unwrap();

    orch.shutdown().await;
    assert!(orch.is_shutting_down());
    assert!(orch.list_servers().is_empty());
    assert_eq!(orch.get_server_health().status, HealthVerdict::Unhealthy);

    let err = orch
        .execute_tool("echo", args(json!({"text": "late"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalServer);
}
