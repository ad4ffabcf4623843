//! Connection pool for remote tool servers.
//!
//! Live clients are kept in an LRU keyed by server id + endpoint + auth hash.
//! Creating a client goes through a counting semaphore so a burst of
//! reconnects cannot open more than `max_concurrent_connects` outbound
//! connections at once. Cache hits never touch the semaphore.

use std::{
    collections::HashMap,
    future::Future,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;

use super::config::{PoolConfig, ServerConfig, Transport};
use crate::{
    error::{OrchestrationError, OrchestrationResult},
    source::RemoteClient,
};

/// Key for pool entries. Credentials are hashed, not stored as plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub server_id: String,
    pub endpoint: String,
    pub auth_hash: u64,
}

impl PoolKey {
    pub fn new(server_id: impl Into<String>, endpoint: impl Into<String>, auth_hash: u64) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint: endpoint.into(),
            auth_hash,
        }
    }

    pub fn from_config(server_id: &str, config: &ServerConfig) -> Self {
        let auth_hash = match &config.transport {
            Transport::Sse { token, headers, .. }
            | Transport::Streamable { token, headers, .. }
            | Transport::Http { token, headers, .. } => Self::hash_auth(token, headers),
            Transport::Stdio { .. } => 0,
        };
        Self::new(server_id, config.transport.address(), auth_hash)
    }

    /// Hash token and headers. Returns 0 if no auth info.
    fn hash_auth(token: &Option<String>, headers: &HashMap<String, String>) -> u64 {
        if token.is_none() && headers.is_empty() {
            return 0;
        }

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        if let Some(t) = token {
            t.hash(&mut hasher);
        }
        let mut sorted_headers: Vec<_> = headers.iter().collect();
        sorted_headers.sort_by_key(|(k, _)| *k);
        for (key, value) in sorted_headers {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub available_connect_permits: usize,
}

pub struct ConnectionPool {
    clients: Mutex<LruCache<PoolKey, Arc<dyn RemoteClient>>>,
    connect_gate: Semaphore,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_connections).unwrap_or(NonZeroUsize::MIN);
        Self {
            clients: Mutex::new(LruCache::new(capacity)),
            connect_gate: Semaphore::new(config.max_concurrent_connects.max(1)),
            capacity: capacity.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &PoolKey) -> Option<Arc<dyn RemoteClient>> {
        self.clients.lock().get(key).cloned()
    }

    /// Get existing client or create one via `connect_fn`.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: PoolKey,
        connect_fn: F,
    ) -> OrchestrationResult<Arc<dyn RemoteClient>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestrationResult<Arc<dyn RemoteClient>>>,
    {
        if let Some(client) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(client);
        }

        let _permit = self
            .connect_gate
            .acquire()
            .await
            .map_err(|_| OrchestrationError::Internal("connection pool closed".to_string()))?;

        // Another task may have connected while we waited for a permit
        if let Some(client) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(client);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let client = connect_fn().await?;

        let evicted = self.clients.lock().push(key.clone(), Arc::clone(&client));
        if let Some((evicted_key, evicted_client)) = evicted {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    server_id = %evicted_key.server_id,
                    "Evicted pooled client for {}", evicted_key.endpoint
                );
            }
            close_in_background(evicted_client);
        }

        Ok(client)
    }

    /// Remove a client without closing it.
    pub fn take(&self, key: &PoolKey) -> Option<Arc<dyn RemoteClient>> {
        self.clients.lock().pop(key)
    }

    /// Remove a client and close it in the background. Returns true if one was pooled.
    pub fn remove(&self, key: &PoolKey) -> bool {
        match self.take(key) {
            Some(client) => {
                close_in_background(client);
                true
            }
            None => false,
        }
    }

    /// Close every pooled client.
    pub async fn close_all(&self) {
        let clients: Vec<Arc<dyn RemoteClient>> = {
            let mut guard = self.clients.lock();
            let drained = guard.iter().map(|(_, c)| Arc::clone(c)).collect();
            guard.clear();
            drained
        };
        for client in clients {
            client.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            available_connect_permits: self.connect_gate.available_permits(),
        }
    }
}

fn close_in_background(client: Arc<dyn RemoteClient>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                client.close().await;
            });
        }
        Err(_) => debug!("No runtime available; dropping pooled client without close"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use tool_protocol::ToolDescriptor;

    use super::*;
    use crate::source::RawToolOutput;

    #[derive(Default)]
    struct NoopClient {
        closed: AtomicBool,
    }

    #[async_trait]
    impl RemoteClient for NoopClient {
        async fn probe(&self) -> OrchestrationResult<()> {
            Ok(())
        }

        async fn list_tools(&self) -> OrchestrationResult<Vec<ToolDescriptor>> {
            Ok(Vec::new())
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Map<String, Value>,
        ) -> OrchestrationResult<RawToolOutput> {
            Ok(RawToolOutput::Local(Value::Null))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn pool(max_connections: usize, max_concurrent_connects: usize) -> ConnectionPool {
        ConnectionPool::new(&PoolConfig {
            max_connections,
            max_concurrent_connects,
        })
    }

    #[test]
    fn test_pool_key_hashes_auth() {
        let mut config = ServerConfig::new("web", Transport::http("http://localhost:9000"));
        let plain = PoolKey::from_config("srv", &config);
        assert_eq!(plain.auth_hash, 0);

        config.transport = Transport::Http {
            url: "http://localhost:9000".to_string(),
            token: Some("secret".to_string()),
            headers: HashMap::new(),
        };
        let authed = PoolKey::from_config("srv", &config);
        assert_ne!(authed.auth_hash, 0);
        assert_ne!(plain, authed);
        assert!(!format!("{:?}", authed).contains("secret"));
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_client() {
        let pool = pool(4, 2);
        let key = PoolKey::new("srv", "http://a", 0);
        let connects = AtomicUsize::new(0);
        let counter = &connects;

        for _ in 0..3 {
            pool.get_or_create(key.clone(), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(NoopClient::default()) as Arc<dyn RemoteClient>)
            })
            .await
            .unwrap();
        }

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_closes_client() {
        let pool = pool(1, 1);
        let first = Arc::new(NoopClient::default());
        let first_dyn: Arc<dyn RemoteClient> = first.clone();

        pool.get_or_create(PoolKey::new("a", "http://a", 0), || async move { Ok(first_dyn) })
            .await
            .unwrap();
        pool.get_or_create(PoolKey::new("b", "http://b", 0), || async {
            Ok(Arc::new(NoopClient::default()) as Arc<dyn RemoteClient>)
        })
        .await
        .unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().evictions, 1);

        // close runs on a spawned task
        for _ in 0..10 {
            if first.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let pool = pool(4, 1);
        let key = PoolKey::new("srv", "http://a", 0);
        let result = pool
            .get_or_create(key.clone(), || async {
                Err(OrchestrationError::connection("http://a", "refused"))
            })
            .await;
        assert!(result.is_err());
        assert!(pool.is_empty());
        // permit was released
        assert_eq!(pool.stats().available_connect_permits, 1);
    }

    #[tokio::test]
    async fn test_connect_gate_bounds_concurrency() {
        let pool = Arc::new(pool(16, 2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = Arc::clone(&pool);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let key = PoolKey::new(format!("srv-{}", i), "http://x", 0);
                pool.get_or_create(key, || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(Arc::new(NoopClient::default()) as Arc<dyn RemoteClient>)
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.len(), 8);
    }

    #[tokio::test]
    async fn test_remove_and_take() {
        let pool = pool(4, 1);
        let key = PoolKey::new("srv", "http://a", 0);
        pool.get_or_create(key.clone(), || async {
            Ok(Arc::new(NoopClient::default()) as Arc<dyn RemoteClient>)
        })
        .await
        .unwrap();

        assert!(pool.take(&key).is_some());
        assert!(!pool.remove(&key));
    }
}
