//! Tiered Cache
//!
//! Read-through, write-through cache over a single category. Keys are hashed
//! into file names for the disk tier and used verbatim in the memory tier.
//! A per-instance switch turns the whole thing into a no-op without changing
//! call sites.
//!
//! Stores and promotions hold the gate shared from the disk access until the
//! memory insert lands. Clears, removals and deletion of evicted disk copies
//! hold it exclusively, so none of them can interleave with a half-finished
//! store or promotion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::{log_absorbed, Lookup};
use crate::store::{Category, CategoryStore};
use crate::tiered::key::derive_file_name;
use crate::tiered::memory::{EvictionHook, MemoryEntry, MemoryTier};

/// Hit and miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
}

impl TierStats {
    /// Fraction of lookups served by either tier, 0.0 to 1.0
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Raw key and disk file name of entries evicted for capacity
type Evicted = Vec<(String, Arc<str>)>;
type PendingEvictions = Arc<Mutex<Evicted>>;

pub struct TieredCache {
    /// Disk tier shared with the rest of the service
    store: Arc<CategoryStore>,
    /// Category this cache fronts
    category: Category,
    memory: MemoryTier,
    gate: RwLock<()>,
    /// Only set with `evict_from_disk`
    evicted: Option<PendingEvictions>,
    enabled: AtomicBool,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    /// Create a cache over `category` holding at most `capacity` entries in
    /// memory. With `evict_from_disk`, entries evicted from memory for
    /// capacity also lose their disk copy.
    pub fn new(
        store: Arc<CategoryStore>,
        category: Category,
        capacity: u64,
        evict_from_disk: bool,
    ) -> Self {
        let evicted: Option<PendingEvictions> =
            evict_from_disk.then(|| Arc::new(Mutex::new(Vec::new())));

        // The hook fires inside moka maintenance; deletion waits for the gate
        let hook = evicted.as_ref().map(|pending| {
            let pending = Arc::clone(pending);
            Arc::new(move |key: &str, entry: &MemoryEntry| {
                lock_pending(&pending).push((key.to_string(), Arc::clone(&entry.file_name)));
            }) as EvictionHook
        });

        info!(
            category = %category,
            capacity = capacity,
            evict_from_disk = evict_from_disk,
            "Tiered cache initialized"
        );

        Self {
            store,
            category,
            memory: MemoryTier::with_eviction_hook(capacity, hook),
            gate: RwLock::new(()),
            evicted,
            enabled: AtomicBool::new(true),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn caching on or off. While off, `store` and `retrieve` touch
    /// neither tier.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        info!(category = %self.category, enabled = enabled, "Caching toggled");
    }

    /// Write `payload` to both tiers, replacing any previous value.
    ///
    /// A failed disk write is logged and the payload stays memory-only.
    pub fn store(&self, key: &str, payload: &[u8]) {
        if !self.is_enabled() {
            trace!(key = key, "Caching disabled, store skipped");
            return;
        }

        let file_name = derive_file_name(key);
        {
            let _shared = self.shared();
            if let Err(e) = self.store.try_store(payload, &file_name, self.category) {
                log_absorbed("store", &e);
            }
            self.memory.insert(key, MemoryEntry::new(file_name, payload));
        }
        self.delete_evicted();

        debug!(category = %self.category, key = key, size = payload.len(), "Cached entry");
    }

    /// Memory first, then disk; a disk hit is promoted into memory
    pub fn retrieve(&self, key: &str) -> Option<Vec<u8>> {
        if !self.is_enabled() {
            return None;
        }

        if let Some(entry) = self.memory.get(key) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = key, "Memory HIT");
            return Some(entry.payload.to_vec());
        }

        let file_name = derive_file_name(key);
        let found = {
            let _shared = self.shared();
            match self.store.lookup(&file_name, self.category) {
                Lookup::Hit(payload) => {
                    self.disk_hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key = key, "Disk HIT, promoting to memory");
                    // A store that landed after our disk read wins
                    let resident = self
                        .memory
                        .insert_if_absent(key, MemoryEntry::new(file_name, &payload));
                    Some(resident.map_or(payload, |entry| entry.payload.to_vec()))
                }
                miss => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    trace!(key = key, "Cache MISS");
                    miss.into_option()
                }
            }
        };
        self.delete_evicted();
        found
    }

    /// Whether `key` is currently resident in memory
    pub fn in_memory(&self, key: &str) -> bool {
        self.memory.contains(key)
    }

    /// Drop `key` from both tiers
    pub fn remove(&self, key: &str) {
        let file_name = derive_file_name(key);
        let _exclusive = self.exclusive();
        self.memory.remove(key);
        if let Err(e) = self.store.try_remove(&file_name, self.category) {
            log_absorbed("remove", &e);
        }
        debug!(category = %self.category, key = key, "Removed entry");
    }

    /// Empty memory, then delete and recreate the disk subtree
    pub fn clear(&self) {
        self.clear_with(|| self.store.clear(self.category));
    }

    /// Empty memory and run `clear_disk` with stores and promotions held off
    pub(crate) fn clear_with(&self, clear_disk: impl FnOnce()) {
        let _exclusive = self.exclusive();
        self.memory.clear();
        if let Some(pending) = &self.evicted {
            lock_pending(pending).clear();
        }
        clear_disk();
        debug!(category = %self.category, "Cleared memory tier");
    }

    pub fn memory_len(&self) -> u64 {
        self.memory.len()
    }

    pub fn memory_capacity(&self) -> u64 {
        self.memory.capacity()
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            category = %self.category,
            memory_hits = stats.memory_hits,
            disk_hits = stats.disk_hits,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", stats.hit_rate() * 100.0),
            memory_entries = self.memory_len(),
            "Cache metrics"
        );
    }

    /// Delete disk copies of entries evicted for capacity, skipping keys
    /// stored again since. Must not be called with the gate held.
    fn delete_evicted(&self) {
        let Some(pending) = &self.evicted else {
            return;
        };
        if lock_pending(pending).is_empty() {
            return;
        }

        let _exclusive = self.exclusive();
        let drained = std::mem::take(&mut *lock_pending(pending));
        for (key, file_name) in drained {
            if self.memory.contains(&key) {
                continue;
            }
            if let Err(e) = self.store.try_remove(&file_name, self.category) {
                log_absorbed("evict", &e);
            }
        }
    }

    fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_pending(pending: &Mutex<Evicted>) -> MutexGuard<'_, Evicted> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
