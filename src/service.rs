//! Cache Service - the handle collaborators hold
//!
//! Owns the category store and the image tier, keeps them coherent on clears,
//! and reacts to memory-pressure notifications from the host. Cloning is cheap;
//! every clone shares the same underlying cache.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::error::{log_absorbed, StorageError};
use crate::store::{Category, CategoryStore};
use crate::tiered::{TierStats, TieredCache};

/// Snapshot of cache state for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub root: String,
    pub caching_enabled: bool,
    pub memory_entries: u64,
    pub memory_capacity: u64,
    pub disk_bytes: u64,
    pub stats: TierStats,
}

#[derive(Clone)]
pub struct CacheService {
    /// Disk tier for every category
    store: Arc<CategoryStore>,
    /// Memory-fronted image tier
    images: Arc<TieredCache>,
    /// Deadline for the `*_bounded` variants
    io_timeout: Duration,
}

impl CacheService {
    /// Build the service from configuration. Never fails: an unusable root
    /// just means every lookup misses.
    pub fn new(config: &CacheConfig) -> Self {
        let store = Arc::new(CategoryStore::new(&config.root));
        let images = TieredCache::new(
            Arc::clone(&store),
            Category::Image,
            config.memory_capacity,
            config.evict_from_disk,
        );
        images.set_enabled(config.caching_enabled);

        Self {
            store,
            images: Arc::new(images),
            io_timeout: config.io_timeout,
        }
    }

    pub fn category_store(&self) -> &CategoryStore {
        &self.store
    }

    pub fn image_cache(&self) -> &TieredCache {
        &self.images
    }

    /// No-op while caching is disabled
    pub fn store(&self, payload: &[u8], key: &str, category: Category) {
        if self.caching_enabled() {
            self.store.store(payload, key, category);
        }
    }

    /// Always a miss while caching is disabled
    pub fn retrieve(&self, key: &str, category: Category) -> Option<Vec<u8>> {
        if !self.caching_enabled() {
            return None;
        }
        self.store.retrieve(key, category)
    }

    pub fn remove(&self, key: &str, category: Category) {
        self.store.remove(key, category);
    }

    /// Clear one category. Clearing `image` (or `all`) also empties the
    /// image memory tier so it cannot serve entries the disk no longer has.
    pub fn clear(&self, category: Category) {
        match category {
            Category::All => self.clear_all(),
            Category::Image => self.images.clear(),
            other => self.store.clear(other),
        }
    }

    pub fn clear_all(&self) {
        self.images.clear_with(|| self.store.clear_all());
    }

    pub fn total_disk_size(&self) -> u64 {
        self.store.total_disk_size()
    }

    pub fn category_disk_size(&self, category: Category) -> u64 {
        self.store.category_disk_size(category)
    }

    pub fn cache_image(&self, key: &str, payload: &[u8]) {
        self.images.store(key, payload);
    }

    pub fn retrieve_image(&self, key: &str) -> Option<Vec<u8>> {
        self.images.retrieve(key)
    }

    /// Drop one image from memory and its hashed disk copy
    pub fn remove_image(&self, key: &str) {
        self.images.remove(key);
    }

    pub fn clear_image_cache(&self) {
        self.images.clear();
    }

    pub fn caching_enabled(&self) -> bool {
        self.images.is_enabled()
    }

    /// Switch every store and retrieve on or off, image tier included.
    /// Removals and clears keep working while disabled.
    pub fn set_caching_enabled(&self, enabled: bool) {
        self.images.set_enabled(enabled);
    }

    /// Host signalled memory pressure: drop everything we hold.
    /// `clear_all` already covers the image memory tier.
    pub fn handle_memory_pressure(&self) {
        info!("Memory pressure reported, clearing caches");
        self.images.log_metrics();
        self.clear_all();
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            root: self.store.root().to_string_lossy().to_string(),
            caching_enabled: self.caching_enabled(),
            memory_entries: self.images.memory_len(),
            memory_capacity: self.images.memory_capacity(),
            disk_bytes: self.total_disk_size(),
            stats: self.images.stats(),
        }
    }

    pub async fn store_bounded(&self, payload: Vec<u8>, key: String, category: Category) {
        self.bounded("store", move |cache| cache.store(&payload, &key, category))
            .await;
    }

    pub async fn retrieve_bounded(&self, key: String, category: Category) -> Option<Vec<u8>> {
        self.bounded("retrieve", move |cache| cache.retrieve(&key, category))
            .await
            .flatten()
    }

    pub async fn remove_bounded(&self, key: String, category: Category) {
        self.bounded("remove", move |cache| cache.remove(&key, category))
            .await;
    }

    pub async fn clear_bounded(&self, category: Category) {
        self.bounded("clear", move |cache| cache.clear(category)).await;
    }

    /// Best-effort size; 0 when the walk does not finish in time
    pub async fn total_disk_size_bounded(&self) -> u64 {
        self.bounded("size", |cache| cache.total_disk_size())
            .await
            .unwrap_or(0)
    }

    pub async fn cache_image_bounded(&self, key: String, payload: Vec<u8>) {
        self.bounded("cache_image", move |cache| cache.cache_image(&key, &payload))
            .await;
    }

    pub async fn retrieve_image_bounded(&self, key: String) -> Option<Vec<u8>> {
        self.bounded("retrieve_image", move |cache| cache.retrieve_image(&key))
            .await
            .flatten()
    }

    pub async fn remove_image_bounded(&self, key: String) {
        self.bounded("remove_image", move |cache| cache.remove_image(&key))
            .await;
    }

    pub async fn clear_image_cache_bounded(&self) {
        self.bounded("clear_image_cache", |cache| cache.clear_image_cache())
            .await;
    }

    pub async fn handle_memory_pressure_bounded(&self) {
        self.bounded("memory_pressure", |cache| cache.handle_memory_pressure())
            .await;
    }

    pub async fn status_bounded(&self) -> Option<CacheStatus> {
        self.bounded("status", |cache| cache.status()).await
    }

    /// Run a blocking cache operation on the blocking pool, giving up after
    /// `io_timeout`. The operation itself keeps running if it stalls; only
    /// the caller stops waiting.
    async fn bounded<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(CacheService) -> T + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.clone();
        let task = tokio::task::spawn_blocking(move || f(cache));

        match tokio::time::timeout(self.io_timeout, task).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(op = op, error = %e, "Cache task failed");
                None
            }
            Err(_) => {
                log_absorbed(op, &StorageError::TimedOut(op, self.io_timeout));
                None
            }
        }
    }
}
