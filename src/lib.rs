//! tiercache - two-tier categorized content cache
//!
//! A bounded in-memory tier in front of a durable on-disk tier, partitioned
//! into named categories. Every public cache operation is fail-open: storage
//! trouble shows up as a miss or a no-op, never as an error.

pub mod config;
pub mod error;
pub mod ipc;
pub mod service;
pub mod store;
pub mod tiered;

pub use config::CacheConfig;
pub use error::{Lookup, StorageError};
pub use service::{CacheService, CacheStatus};
pub use store::{Category, CategoryStore};
pub use tiered::{derive_file_name, TierStats, TieredCache};
