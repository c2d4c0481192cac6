// =============================================================================
// Orchestrator Cache — bounded LRU of per-strategy orchestrators
// =============================================================================
//
// Keyed by strategyId. Reads refresh recency and bump an access counter; an
// insertion past capacity evicts the least-recently-accessed entry with a
// warning. Capacity is at least 1.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-entry statistics for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStats {
    pub strategy_id: String,
    pub access_count: u64,
    pub age_ms: u64,
    pub time_since_access_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub entries: Vec<CacheEntryStats>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Entry<T> {
    value: Arc<T>,
    access_count: u64,
    created_at_ms: u64,
    last_access_ms: u64,
    /// Monotone recency stamp; the minimum across entries is the LRU victim.
    touch_seq: u64,
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    next_seq: u64,
}

pub struct OrchestratorCache<T> {
    max_size: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<T>>,
}

impl<T> OrchestratorCache<T> {
    /// Create a cache with the given capacity; a zero capacity is clamped to
    /// 1 with a warning.
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        let max_size = if max_size == 0 {
            warn!("orchestrator cache size 0 requested — clamping to 1");
            1
        } else {
            max_size
        };
        Self {
            max_size,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Fetch an orchestrator, refreshing its recency.
    pub fn get(&self, strategy_id: &str) -> Option<Arc<T>> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let entry = inner.entries.get_mut(strategy_id)?;
        entry.access_count += 1;
        entry.last_access_ms = now;
        entry.touch_seq = seq;
        Some(entry.value.clone())
    }

    /// Insert (or replace) an orchestrator, evicting the LRU entry when at
    /// capacity.
    pub fn insert(&self, strategy_id: &str, value: T) -> Arc<T> {
        let now = self.clock.now_ms();
        let value = Arc::new(value);
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;

        if !inner.entries.contains_key(strategy_id) && inner.entries.len() >= self.max_size {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.touch_seq)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&victim);
                warn!(
                    evicted = %victim,
                    inserted = %strategy_id,
                    max_size = self.max_size,
                    "orchestrator cache evicted least-recently-used entry"
                );
            }
        }

        debug!(strategy_id, "orchestrator cached");
        inner.entries.insert(
            strategy_id.to_string(),
            Entry {
                value: value.clone(),
                access_count: 0,
                created_at_ms: now,
                last_access_ms: now,
                touch_seq: seq,
            },
        );
        value
    }

    /// Fetch the orchestrator for `strategy_id`, building it with `make` on a
    /// miss.
    pub fn get_or_insert_with(&self, strategy_id: &str, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get(strategy_id) {
            return existing;
        }
        self.insert(strategy_id, make())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        debug!(count, "orchestrator cache cleared");
    }

    pub fn get_stats(&self) -> CacheStats {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        let mut entries: Vec<CacheEntryStats> = inner
            .entries
            .iter()
            .map(|(id, e)| CacheEntryStats {
                strategy_id: id.clone(),
                access_count: e.access_count,
                age_ms: now.saturating_sub(e.created_at_ms),
                time_since_access_ms: now.saturating_sub(e.last_access_ms),
            })
            .collect();
        entries.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            entries,
        }
    }
}

impl<T> std::fmt::Debug for OrchestratorCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorCache")
            .field("size", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}
