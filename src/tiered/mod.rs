//! Memory tier in front of a disk category
//!
//! Provides read-through/write-through caching for one category, with hashed
//! disk file names so arbitrary keys (full URLs) are safe to store.

pub mod cache;
pub mod key;
pub mod memory;

pub use cache::{TierStats, TieredCache};
pub use key::derive_file_name;
pub use memory::{MemoryEntry, MemoryTier};
