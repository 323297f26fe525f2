//! Disk tier
//!
//! One directory per category under a shared cache root, with per-category
//! locking so a clear in one category never blocks another.

pub mod category;
pub mod disk;

pub use category::{Category, UnknownCategory};
pub use disk::{validate_file_name, CategoryStore};
