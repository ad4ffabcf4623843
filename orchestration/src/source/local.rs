//! In-process tool set.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tool_protocol::ToolDescriptor;
use tracing::debug;

use super::{RawToolOutput, SourceKind, ToolSource};
use crate::error::{OrchestrationError, OrchestrationResult};

#[async_trait]
pub trait LocalTool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(&self, arguments: Map<String, Value>) -> OrchestrationResult<Value>;
}

type ToolFn = dyn Fn(Map<String, Value>) -> BoxFuture<'static, OrchestrationResult<Value>>
    + Send
    + Sync;

struct FnTool {
    descriptor: ToolDescriptor,
    handler: Box<ToolFn>,
}

#[async_trait]
impl LocalTool for FnTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, arguments: Map<String, Value>) -> OrchestrationResult<Value> {
        (self.handler)(arguments).await
    }
}

/// Ordered table of in-process tools. Registering a name twice replaces the first.
pub struct LocalToolSet {
    name: String,
    tools: RwLock<Vec<Arc<dyn LocalTool>>>,
}

impl LocalToolSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Tool set holding only [`EchoTool`].
    pub fn builtin() -> Self {
        let set = Self::new("builtin");
        set.register(EchoTool);
        set
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register<T: LocalTool + 'static>(&self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn LocalTool>) {
        let name = tool.descriptor().name;
        let mut tools = self.tools.write();
        if let Some(slot) = tools.iter_mut().find(|t| t.descriptor().name == name) {
            *slot = tool;
        } else {
            tools.push(tool);
        }
    }

    /// Register a closure-backed tool.
    pub fn register_fn<F, Fut>(&self, descriptor: ToolDescriptor, f: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OrchestrationResult<Value>> + Send + 'static,
    {
        self.register(FnTool {
            descriptor,
            handler: Box::new(move |args| Box::pin(f(args))),
        });
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    fn find(&self, name: &str) -> Option<Arc<dyn LocalTool>> {
        self.tools
            .read()
            .iter()
            .find(|t| t.descriptor().name == name)
            .cloned()
    }
}

#[async_trait]
impl ToolSource for LocalToolSet {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn address(&self) -> String {
        format!("local://{}", self.name)
    }

    async fn connect(&self) -> OrchestrationResult<()> {
        self.probe().await
    }

    async fn probe(&self) -> OrchestrationResult<()> {
        if self.is_empty() {
            return Err(OrchestrationError::ExternalServer(format!(
                "local tool set '{}' has no tools",
                self.name
            )));
        }
        Ok(())
    }

    async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
        Ok(self.tools.read().iter().map(|t| t.descriptor()).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OrchestrationResult<RawToolOutput> {
        let tool = self
            .find(name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(name.to_string()))?;
        debug!(tool = %name, set = %self.name, "Executing local tool");
        tool.execute(arguments).await.map(RawToolOutput::Local)
    }

    async fn disconnect(&self) -> OrchestrationResult<()> {
        Ok(())
    }
}

/// Returns its `text` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl LocalTool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("echo", "Echo the given text back").with_input_schema(json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to echo"}
            },
            "required": ["text"]
        }))
    }

    async fn execute(&self, arguments: Map<String, Value>) -> OrchestrationResult<Value> {
        match arguments.get("text") {
            Some(Value::String(text)) => Ok(Value::String(text.clone())),
            _ => Err(OrchestrationError::tool_execution(
                "echo",
                "argument 'text' must be a string",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_echo() {
        let set = LocalToolSet::builtin();
        assert_eq!(set.kind(), SourceKind::Local);
        assert_eq!(set.address(), "local://builtin");

        let tools = set.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let mut args = Map::new();
        args.insert("text".to_string(), json!("hi"));
        let out = set.call_tool("echo", args).await.unwrap();
        assert_eq!(out, RawToolOutput::Local(json!("hi")));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let set = LocalToolSet::builtin();
        let err = set.call_tool("nope", Map::new()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_register_fn_and_replace() {
        let set = LocalToolSet::new("math");
        set.register_fn(ToolDescriptor::new("add", "Add two numbers"), |args| async move {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        });
        set.register_fn(ToolDescriptor::new("add", "Replaced"), |_| async { Ok(json!(0)) });
        assert_eq!(set.len(), 1);
        assert_eq!(set.list_tools().await.unwrap()[0].description, "Replaced");
    }

    #[tokio::test]
    async fn test_empty_set_fails_probe() {
        let set = LocalToolSet::new("empty");
        assert!(set.probe().await.is_err());
        set.register(EchoTool);
        assert!(set.probe().await.is_ok());
    }
}
