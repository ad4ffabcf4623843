//! Time-boxed discovery snapshot.
//!
//! Holds at most one snapshot. Topology changes bump a generation counter, so a
//! listing that started before an add/remove can never be stored over the
//! invalidation that followed it.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::inventory::{InventoryCounts, UnifiedTool};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoverySnapshot {
    pub tools: Vec<UnifiedTool>,
    pub counts: InventoryCounts,
    pub generated_at: DateTime<Utc>,
}

struct CachedSnapshot {
    snapshot: Arc<DiscoverySnapshot>,
    cached_at: Instant,
}

pub struct DiscoveryCache {
    ttl: Duration,
    slot: RwLock<Option<CachedSnapshot>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh snapshot, if any. Expired entries count as a miss.
    pub fn get(&self) -> Option<Arc<DiscoverySnapshot>> {
        let fresh = self
            .slot
            .read()
            .as_ref()
            .filter(|c| c.cached_at.elapsed() < self.ttl)
            .map(|c| Arc::clone(&c.snapshot));

        match fresh {
            Some(snapshot) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(snapshot)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Token to pass to [`store`](Self::store); read it before listing.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Keep `snapshot` unless an invalidation happened since `generation` was read.
    ///
    /// `started_at` is when the listing began; the TTL runs from there, not
    /// from when a slow listing finished.
    pub fn store(
        &self,
        snapshot: Arc<DiscoverySnapshot>,
        generation: u64,
        started_at: Instant,
    ) -> bool {
        let mut slot = self.slot.write();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!("Discarding discovery snapshot built before an invalidation");
            return false;
        }
        *slot = Some(CachedSnapshot {
            snapshot,
            cached_at: started_at,
        });
        true
    }

    pub fn invalidate(&self) {
        let mut slot = self.slot.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        *slot = None;
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cached: self.slot.read().is_some(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub cached: bool,
    pub hit_rate: f64,
}
