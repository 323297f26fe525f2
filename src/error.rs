//! Storage Error Types
//!
//! Internal failure taxonomy for the disk tier. None of these ever escape a
//! public cache operation: they are logged and folded into a miss or a no-op.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Disk tier error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable at {path:?}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unreadable cache file {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Key is not a safe file name: {0:?}")]
    InvalidKey(String),

    #[error("Category 'all' is a clear target, not a storage partition")]
    SyntheticCategory,

    #[error("Operation '{0}' exceeded its deadline of {1:?}")]
    TimedOut(&'static str, Duration),
}

impl StorageError {
    /// Wrap a failed write, mkdir or delete
    pub fn unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Unavailable {
            path: path.into(),
            source,
        }
    }

    /// Wrap a failed read of an existing file
    pub fn unreadable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Unreadable {
            path: path.into(),
            source,
        }
    }

    /// Whether this error comes from the environment (disk, permissions,
    /// stalls) rather than from a caller mistake
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. }
                | StorageError::Unreadable { .. }
                | StorageError::TimedOut(..)
        )
    }
}

/// Outcome of a disk tier read before it is folded at the public boundary
#[derive(Debug)]
pub enum Lookup {
    /// Payload found
    Hit(Vec<u8>),
    /// Nothing stored under this key
    Miss,
    /// Something is stored (or should be) but could not be read
    Failed(StorageError),
}

impl Lookup {
    /// Fold into the fail-open public shape, logging any failure
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Hit(payload) => Some(payload),
            Lookup::Miss => None,
            Lookup::Failed(e) => {
                log_absorbed("retrieve", &e);
                None
            }
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

/// Log a storage failure that is being absorbed rather than returned
pub(crate) fn log_absorbed(op: &'static str, err: &StorageError) {
    if err.is_transient() {
        tracing::warn!(op = op, error = %err, "Cache storage failure absorbed");
    } else {
        tracing::debug!(op = op, error = %err, "Cache request rejected");
    }
}
