//! Hub configuration types.
//!
//! A hub config names the tool servers to register at startup and tunes the
//! pool, reconnection, health monitor, execution engine and discovery cache.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestrationError, OrchestrationResult};

pub const ENV_CACHE_TTL_SECS: &str = "TOOLHUB_CACHE_TTL_SECS";
pub const ENV_DEFAULT_TIMEOUT_SECS: &str = "TOOLHUB_DEFAULT_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "TOOLHUB_MAX_RETRIES";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HubConfig {
    /// Remote servers registered at startup
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: Transport,

    /// Per-call timeout; falls back to `execution.default_timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Per-server retry override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Whether startup fails when this server cannot be reached
    #[serde(default)]
    pub required: bool,

    /// Free-form settings surfaced on the server record
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout_secs: None,
            retry: None,
            required: false,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestrationError::Config(
                "server name must not be empty".to_string(),
            ));
        }
        let endpoint_empty = match &self.transport {
            Transport::Stdio { command, .. } => command.trim().is_empty(),
            Transport::Sse { url, .. }
            | Transport::Streamable { url, .. }
            | Transport::Http { url, .. } => url.trim().is_empty(),
        };
        if endpoint_empty {
            return Err(OrchestrationError::Config(format!(
                "server '{}' has an empty {} endpoint",
                self.name,
                self.transport.protocol()
            )));
        }
        Ok(())
    }

    /// Config map for the server record. Credentials never leave this method.
    pub fn redacted(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("protocol".to_string(), self.transport.protocol().into());
        match &self.transport {
            Transport::Stdio { args, envs, .. } => {
                map.insert("args".to_string(), serde_json::json!(args));
                let mut keys: Vec<&String> = envs.keys().collect();
                keys.sort();
                map.insert("env_keys".to_string(), serde_json::json!(keys));
            }
            Transport::Sse { token, headers, .. }
            | Transport::Streamable { token, headers, .. }
            | Transport::Http { token, headers, .. } => {
                map.insert("auth".to_string(), Value::Bool(token.is_some()));
                let mut names: Vec<&String> = headers.keys().collect();
                names.sort();
                map.insert("headers".to_string(), serde_json::json!(names));
            }
        }
        if let Some(timeout) = self.timeout_secs {
            map.insert("timeout_secs".to_string(), timeout.into());
        }
        if let Some(retry) = &self.retry {
            if let Ok(value) = serde_json::to_value(retry) {
                map.insert("retry".to_string(), value);
            }
        }
        map.insert("required".to_string(), Value::Bool(self.required));
        for (key, value) in &self.metadata {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        map
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Transport {
    /// Subprocess speaking MCP over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    /// MCP over server-sent events
    Sse {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// MCP over streamable HTTP
    Streamable {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Plain Tool Protocol JSON-RPC over HTTP POST
    Http {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl Transport {
    pub fn http(url: impl Into<String>) -> Self {
        Transport::Http {
            url: url.into(),
            token: None,
            headers: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Transport::Stdio { .. } => "stdio",
            Transport::Sse { .. } => "sse",
            Transport::Streamable { .. } => "streamable",
            Transport::Http { .. } => "http",
        }
    }

    /// Human-readable endpoint: the URL, or the command line for stdio.
    pub fn address(&self) -> String {
        match self {
            Transport::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            Transport::Sse { url, .. }
            | Transport::Streamable { url, .. }
            | Transport::Http { url, .. } => url.clone(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stdio {
                command,
                args,
                envs,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
            Transport::Sse {
                url,
                token,
                headers,
            }
            | Transport::Streamable {
                url,
                token,
                headers,
            }
            | Transport::Http {
                url,
                token,
                headers,
            } => f
                .debug_struct(match self {
                    Transport::Sse { .. } => "Sse",
                    Transport::Streamable { .. } => "Streamable",
                    _ => "Http",
                })
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// Retry policy for tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum number of live clients kept in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of connects in flight at once across all servers
    #[serde(default = "default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_reconnect_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Monitor tick interval (seconds)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Servers checked more recently than this are skipped (seconds)
    #[serde(default = "default_health_freshness")]
    pub freshness_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Overall deadline across all attempts of one call (seconds)
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
    /// Per-call timeout when a server sets none (seconds)
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Discovery snapshot time-to-live (seconds)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_max_connections() -> usize {
    64
}

fn default_max_concurrent_connects() -> usize {
    8
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_freshness() -> u64 {
    300 // 5 minutes
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_deadline() -> u64 {
    120
}

fn default_timeout() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    300 // 5 minutes
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_concurrent_connects: default_max_concurrent_connects(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_retries: default_reconnect_retries(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            freshness_secs: default_health_freshness(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            deadline_secs: default_deadline(),
            default_timeout_secs: default_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: &str) -> OrchestrationResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> OrchestrationResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Apply `TOOLHUB_*` environment overrides. Unparseable values are rejected.
    pub fn apply_env_overrides(&mut self) -> OrchestrationResult<()> {
        if let Some(ttl) = env_u64(ENV_CACHE_TTL_SECS)? {
            self.cache.ttl_secs = ttl;
        }
        if let Some(timeout) = env_u64(ENV_DEFAULT_TIMEOUT_SECS)? {
            self.execution.default_timeout_secs = timeout;
        }
        if let Some(retries) = env_u64(ENV_MAX_RETRIES)? {
            self.execution.max_retries = u32::try_from(retries).map_err(|_| {
                OrchestrationError::Config(format!("{} out of range: {}", ENV_MAX_RETRIES, retries))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.pool.max_connections == 0 {
            return Err(OrchestrationError::Config(
                "pool.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.pool.max_concurrent_connects == 0 {
            return Err(OrchestrationError::Config(
                "pool.max_concurrent_connects must be greater than zero".to_string(),
            ));
        }
        if self.health.enabled && self.health.interval_secs == 0 {
            return Err(OrchestrationError::Config(
                "health.interval_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(OrchestrationError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            server.validate()?;
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> OrchestrationResult<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| OrchestrationError::Config(format!("invalid {}: '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.pool.max_connections, 64);
        assert_eq!(config.pool.max_concurrent_connects, 8);
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.health.interval_secs, 60);
        assert_eq!(config.health.freshness_secs, 300);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.execution.default_timeout_secs, 30);
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn test_yaml_minimal_config() {
        let yaml = r#"
servers:
  - name: "search"
    protocol: http
    url: "http://localhost:9000/rpc"
"#;
        let config = HubConfig::from_yaml(yaml).expect("Failed to parse YAML");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "search");
        assert!(!config.servers[0].required);
        assert_eq!(config.servers[0].transport.protocol(), "http");
        assert_eq!(config.cache.ttl_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
servers:
  - name: "files"
    protocol: stdio
    command: "npx"
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
    envs:
      DEBUG: "1"
  - name: "web"
    protocol: streamable
    url: "https://tools.example.com/mcp"
    token: "secret"
    timeout_secs: 10
    retry:
      max_retries: 1
      base_delay_ms: 250
    required: true
    metadata:
      team: "search"
pool:
  max_connections: 10
reconnect:
  max_retries: 2
health:
  interval_secs: 15
execution:
  deadline_secs: 45
cache:
  ttl_secs: 30
"#;
        let config = HubConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(
            config.servers[0].transport.address(),
            "npx -y @modelcontextprotocol/server-filesystem /tmp"
        );

        let web = &config.servers[1];
        assert!(web.required);
        assert_eq!(web.timeout(30), Duration::from_secs(10));
        assert_eq!(
            web.retry,
            Some(RetryPolicy {
                max_retries: 1,
                base_delay_ms: 250
            })
        );
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.pool.max_concurrent_connects, 8);
        assert_eq!(config.reconnect.max_retries, 2);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.health.interval_secs, 15);
        assert_eq!(config.execution.deadline_secs, 45);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.cache.ttl_secs, 30);
    }

    #[test]
    fn test_debug_redacts_token() {
        let transport = Transport::Sse {
            url: "http://localhost:3000/sse".to_string(),
            token: Some("top-secret".to_string()),
            headers: HashMap::from([("X-Api-Key".to_string(), "key".to_string())]),
        };
        let debug = format!("{:?}", transport);
        assert!(debug.contains("****"));
        assert!(!debug.contains("top-secret"));
        assert!(!debug.contains("key\""));
    }

    #[test]
    fn test_redacted_config_map() {
        let mut config = ServerConfig::new(
            "web",
            Transport::Http {
                url: "http://localhost:9000".to_string(),
                token: Some("secret".to_string()),
                headers: HashMap::from([("X-Api-Key".to_string(), "abc".to_string())]),
            },
        )
        .with_timeout(5);
        config
            .metadata
            .insert("owner".to_string(), Value::String("infra".to_string()));

        let map = config.redacted();
        assert_eq!(map["protocol"], "http");
        assert_eq!(map["auth"], true);
        assert_eq!(map["headers"], serde_json::json!(["X-Api-Key"]));
        assert_eq!(map["timeout_secs"], 5);
        assert_eq!(map["owner"], "infra");
        let rendered = serde_json::to_string(&map).unwrap();
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("abc"));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty_endpoints() {
        let mut config = HubConfig::default();
        config.servers = vec![
            ServerConfig::new("a", Transport::http("http://localhost:1")),
            ServerConfig::new("a", Transport::http("http://localhost:2")),
        ];
        assert!(matches!(
            config.validate(),
            Err(OrchestrationError::Config(msg)) if msg.contains("duplicate")
        ));

        config.servers = vec![ServerConfig::new("b", Transport::http("  "))];
        assert!(config.validate().is_err());

        config.servers.clear();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_CACHE_TTL_SECS, "12");
        std::env::set_var(ENV_DEFAULT_TIMEOUT_SECS, "7");
        std::env::set_var(ENV_MAX_RETRIES, "1");

        let mut config = HubConfig::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.cache.ttl_secs, 12);
        assert_eq!(config.execution.default_timeout_secs, 7);
        assert_eq!(config.execution.max_retries, 1);

        std::env::remove_var(ENV_CACHE_TTL_SECS);
        std::env::remove_var(ENV_DEFAULT_TIMEOUT_SECS);
        std::env::remove_var(ENV_MAX_RETRIES);
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        std::env::set_var(ENV_CACHE_TTL_SECS, "soon");
        let mut config = HubConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var(ENV_CACHE_TTL_SECS);
        assert!(matches!(result, Err(OrchestrationError::Config(_))));
    }
}
