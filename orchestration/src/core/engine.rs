//! Execution engine: argument checks, retry, and result normalization.
//!
//! Every call goes through the same pipeline:
//!
//! 1. coerce quoted numbers against the tool's `inputSchema`
//! 2. validate (all violations collected, nothing executed on failure)
//! 3. run with exponential backoff under one overall deadline
//! 4. flatten the backend's raw output into an [`ExecutionResult`]

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    config::{ExecutionConfig, RetryPolicy},
    metrics::ExecutionMetrics,
};
use crate::{
    error::{ErrorKind, OrchestrationError, OrchestrationResult},
    inventory::UnifiedTool,
    source::RawToolOutput,
};

/// Ephemeral per-call context. Dropped when the call returns.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub caller_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: String,
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            caller_id: None,
            session_id: None,
            request_id: Uuid::new_v4().to_string(),
            metadata: Map::new(),
        }
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Normalized outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub payload: Value,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub request_id: String,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    fn new(tool_name: &str, success: bool, payload: Value) -> Self {
        Self {
            success,
            payload,
            tool_name: tool_name.to_string(),
            server_id: None,
            request_id: String::new(),
            execution_time_ms: 0,
            timestamp: Utc::now(),
            attempts: 1,
            error_kind: None,
            error_message: None,
        }
    }

    /// Failure envelope for an error raised before or during execution.
    pub fn from_error(tool_name: &str, request_id: &str, error: &OrchestrationError) -> Self {
        Self {
            request_id: request_id.to_string(),
            error_kind: Some(error.kind()),
            error_message: Some(error.to_string()),
            ..Self::new(tool_name, false, Value::Null)
        }
    }

    /// Payload rendered as text: strings verbatim, everything else as JSON.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Outcome of [`execute_with_retry`]. Never an `Err` past this point.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub attempts: u32,
    pub result: OrchestrationResult<T>,
}

/// Delay before the retry that follows failed attempt `attempt` (0-based).
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy
        .base_delay()
        .saturating_mul(2u32.saturating_pow(attempt))
}

/// Run `op` up to `max_retries + 1` times with `base_delay * 2^attempt` between
/// attempts. Only retryable errors are retried; no attempt starts or runs past
/// `deadline`.
pub async fn execute_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    deadline: Duration,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = OrchestrationResult<T>>,
{
    let started = Instant::now();
    let deadline_at = started + deadline;
    let mut attempt = 0u32;

    loop {
        let result = match tokio::time::timeout_at(deadline_at, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::Timeout {
                operation: "tool execution".to_string(),
                elapsed: started.elapsed(),
            }),
        };
        let attempts = attempt + 1;

        let error = match result {
            Ok(value) => {
                return RetryOutcome {
                    attempts,
                    result: Ok(value),
                }
            }
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= policy.max_retries {
            return RetryOutcome {
                attempts,
                result: Err(error.with_attempts(attempts)),
            };
        }

        let delay = retry_delay(&policy, attempt);
        if Instant::now() + delay >= deadline_at {
            debug!(attempts, ?delay, "Retry would overrun the deadline; giving up");
            return RetryOutcome {
                attempts,
                result: Err(error.with_attempts(attempts)),
            };
        }

        warn!(attempt = attempts, ?delay, "Retryable failure: {}", error);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Convert numeric strings to numbers where the schema asks for `number`/`integer`.
///
/// Models frequently quote numbers (`"5"` instead of `5`).
pub fn coerce_arguments(schema: &Value, args: &mut Map<String, Value>) {
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };

    for (key, val) in args.iter_mut() {
        let Some(s) = val.as_str() else {
            continue;
        };
        let wanted = props.get(key).map(declared_types).unwrap_or_default();
        if wanted.contains(&"string") {
            continue;
        }
        let s = s.trim();
        if wanted.contains(&"integer") {
            if let Ok(n) = s.parse::<i64>() {
                *val = Value::Number(n.into());
                continue;
            }
        }
        if wanted.contains(&"number") || wanted.contains(&"integer") {
            if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
                *val = Value::Number(n);
            }
        }
    }
}

/// Check `args` against a JSON-schema-like `inputSchema`.
///
/// Covers `required`, primitive `type`s, `enum`, and `minimum`/`maximum`.
/// Every violation is reported. A missing or empty schema accepts anything.
pub fn validate_parameters(schema: &Value, args: &Map<String, Value>) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(field) {
                errors.push(format!("missing required field '{}'", field));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args {
            if let Some(prop) = props.get(key) {
                check_property(key, prop, value, &mut errors);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_property(key: &str, prop: &Value, value: &Value, errors: &mut Vec<String>) {
    let types = declared_types(prop);
    if !types.is_empty() && !types.iter().any(|t| matches_type(t, value)) {
        errors.push(format!(
            "field '{}' must be of type {}, got {}",
            key,
            types.join(" or "),
            json_type_name(value)
        ));
        return;
    }

    if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(format!(
                "field '{}' must be one of {}",
                key,
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
            if n < min {
                errors.push(format!("field '{}' must be >= {}", key, min));
            }
        }
        if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
            if n > max {
                errors.push(format!("field '{}' must be <= {}", key, max));
            }
        }
    }
}

fn declared_types(prop: &Value) -> Vec<&str> {
    match prop.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to enforce
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Flatten any backend result shape into one envelope.
pub fn format_result(raw: RawToolOutput, tool_name: &str) -> ExecutionResult {
    match raw {
        RawToolOutput::Local(value) => ExecutionResult::new(tool_name, true, value),
        RawToolOutput::Content { content, is_error } => {
            content_result(tool_name, content, is_error)
        }
        RawToolOutput::JsonRpc(Value::Object(mut obj)) if obj.contains_key("content") => {
            let is_error = obj
                .get("isError")
                .or_else(|| obj.get("is_error"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            match obj.remove("content") {
                Some(Value::Array(items)) => content_result(tool_name, items, is_error),
                Some(other) => content_result(tool_name, vec![other], is_error),
                None => ExecutionResult::new(tool_name, !is_error, Value::Null),
            }
        }
        RawToolOutput::JsonRpc(value) => ExecutionResult::new(tool_name, true, value),
    }
}

fn content_result(tool_name: &str, items: Vec<Value>, is_error: bool) -> ExecutionResult {
    let payload = flatten_content(items);
    let mut result = ExecutionResult::new(tool_name, !is_error, payload);
    if is_error {
        result.error_kind = Some(ErrorKind::ToolExecution);
        result.error_message = Some(match result.payload_text() {
            text if text.is_empty() => "tool reported an error".to_string(),
            text => text,
        });
    }
    result
}

/// Text items join into one string, a lone JSON item unwraps to its value,
/// anything else stays an array.
fn flatten_content(items: Vec<Value>) -> Value {
    if items.is_empty() {
        return Value::Null;
    }

    let texts: Option<Vec<&str>> = items
        .iter()
        .map(|item| match item.get("type").and_then(Value::as_str) {
            Some("text") => item.get("text").and_then(Value::as_str),
            _ => None,
        })
        .collect();
    if let Some(texts) = texts {
        return Value::String(texts.join("\n"));
    }

    if let [item] = items.as_slice() {
        if item.get("type").and_then(Value::as_str) == Some("json") {
            if let Some(json) = item.get("json") {
                return json.clone();
            }
        }
    }

    Value::Array(items)
}

pub struct ExecutionEngine {
    retry: RetryPolicy,
    deadline: Duration,
    metrics: Arc<ExecutionMetrics>,
}

impl ExecutionEngine {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            deadline: config.deadline(),
            metrics: Arc::new(ExecutionMetrics::new()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetrics> {
        &self.metrics
    }

    /// Coerce and validate; the coerced arguments are what gets sent.
    pub fn prepare(
        &self,
        tool: &UnifiedTool,
        mut args: Map<String, Value>,
    ) -> OrchestrationResult<Map<String, Value>> {
        coerce_arguments(&tool.input_schema, &mut args);
        validate_parameters(&tool.input_schema, &args).map_err(|errors| {
            OrchestrationError::Validation {
                tool_name: tool.name.clone(),
                errors,
            }
        })?;
        Ok(args)
    }

    /// Run one call against `tool` through `call`.
    ///
    /// `Err` means the call never produced a backend answer (bad arguments,
    /// exhausted retries). A backend that answered with `isError` yields
    /// `Ok` with `success == false`.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &ExecutionContext,
        tool: &UnifiedTool,
        policy: Option<RetryPolicy>,
        mut call: F,
    ) -> OrchestrationResult<ExecutionResult>
    where
        F: FnMut(Map<String, Value>) -> Fut,
        Fut: Future<Output = OrchestrationResult<RawToolOutput>>,
    {
        let args = match self.prepare(tool, ctx.arguments.clone()) {
            Ok(args) => args,
            Err(e) => {
                self.metrics.record_error(e.kind());
                debug!(tool = %tool.name, request_id = %ctx.request_id, "Rejected: {}", e);
                return Err(e);
            }
        };

        let qualified = tool.qualified_name();
        let started = Instant::now();
        let outcome = execute_with_retry(policy.unwrap_or(self.retry), self.deadline, |_| {
            call(args.clone())
        })
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .record_retries(outcome.attempts.saturating_sub(1));

        match outcome.result {
            Ok(raw) => {
                let mut result = format_result(raw, &tool.name);
                result.server_id = Some(tool.owning_server_id.clone());
                result.request_id = ctx.request_id.clone();
                result.execution_time_ms = elapsed_ms;
                result.attempts = outcome.attempts;
                self.metrics
                    .record_call_end(&qualified, result.success, elapsed_ms);
                if let Some(kind) = result.error_kind {
                    self.metrics.record_error(kind);
                }
                debug!(
                    tool = %qualified,
                    request_id = %ctx.request_id,
                    success = result.success,
                    elapsed_ms,
                    "Tool call finished"
                );
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_call_end(&qualified, false, elapsed_ms);
                self.metrics.record_error(e.kind());
                warn!(
                    tool = %qualified,
                    request_id = %ctx.request_id,
                    attempts = outcome.attempts,
                    "Tool call failed: {}", e
                );
                Err(e)
            }
        }
    }
}
