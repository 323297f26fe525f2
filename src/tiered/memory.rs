//! Memory Tier Implementation
//!
//! Bounded, concurrent in-process map in front of the disk tier, built on Moka
//! with least-recently-used eviction. Pending maintenance is run on the calling
//! thread after every insert so the capacity bound already holds when the
//! insert returns.

use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::{debug, trace};

/// A payload held in memory, keyed by the caller's raw key
#[derive(Clone, Debug)]
pub struct MemoryEntry {
    /// File name of the disk copy
    pub file_name: Arc<str>,
    /// The cached bytes
    pub payload: Arc<[u8]>,
    /// Payload length in bytes
    pub size: u64,
}

impl MemoryEntry {
    pub fn new(file_name: impl Into<Arc<str>>, payload: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            payload: Arc::from(payload),
            size: payload.len() as u64,
        }
    }
}

/// Called with the raw key and entry whenever an entry is evicted for capacity
pub type EvictionHook = Arc<dyn Fn(&str, &MemoryEntry) + Send + Sync + 'static>;

pub struct MemoryTier {
    entries: Cache<String, MemoryEntry>,
    capacity: u64,
}

impl MemoryTier {
    /// Create a tier holding at most `capacity` entries
    pub fn new(capacity: u64) -> Self {
        Self::with_eviction_hook(capacity, None)
    }

    /// Create a tier that reports capacity evictions to `hook`
    pub fn with_eviction_hook(capacity: u64, hook: Option<EvictionHook>) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .name("image_memory_tier");

        if let Some(hook) = hook {
            builder = builder.eviction_listener(
                move |key: Arc<String>, entry: MemoryEntry, cause: RemovalCause| {
                    // Replacements and explicit clears are not evictions
                    if matches!(cause, RemovalCause::Size) {
                        debug!(key = %key, size = entry.size, "Evicted entry from memory tier");
                        hook(&key, &entry);
                    }
                },
            );
        }

        Self {
            entries: builder.build(),
            capacity,
        }
    }

    /// Look up `key`, recording the access for LRU ordering
    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.get(key);
        trace!(key = key, hit = entry.is_some(), "Memory tier lookup");
        entry
    }

    /// Whether `key` is resident, without touching its recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace `key`, evicting the least recently used entry if
    /// the tier is full
    pub fn insert(&self, key: &str, entry: MemoryEntry) {
        self.entries.insert(key.to_string(), entry);
        self.entries.run_pending_tasks();
    }

    /// Insert `key` only if nothing is resident under it. Returns the entry
    /// that was already there, if any.
    pub fn insert_if_absent(&self, key: &str, entry: MemoryEntry) -> Option<MemoryEntry> {
        let resident = self.entries.entry(key.to_string()).or_insert(entry);
        self.entries.run_pending_tasks();
        (!resident.is_fresh()).then(|| resident.into_value())
    }

    pub fn remove(&self, key: &str) {
        self.entries.invalidate(key);
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Number of resident entries
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
