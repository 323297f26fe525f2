//! Category Store
//!
//! Durable byte storage with one directory per category under a shared root.
//! Every public operation is best effort: failures are logged and degrade to a
//! miss or a no-op, never to an error the caller has to handle.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, trace, warn};

use crate::error::{log_absorbed, Lookup, StorageError};
use crate::store::Category;

/// Prefix of in-flight temp files; keys may not start with it
const TMP_PREFIX: &str = ".tiercache-";
/// Extension of in-flight temp files
const TMP_EXTENSION: &str = "tmp";
/// Longest file name most filesystems accept
const MAX_FILE_NAME_LEN: usize = 255;

/// Reject keys that cannot be used verbatim as a single path component
pub fn validate_file_name(key: &str) -> Result<(), StorageError> {
    let unsafe_name = key.is_empty()
        || key == "."
        || key == ".."
        || key.len() > MAX_FILE_NAME_LEN
        || key.starts_with(TMP_PREFIX)
        || key.chars().any(|c| matches!(c, '/' | '\\' | '\0'));

    if unsafe_name {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Directory-isolated disk storage for every category
pub struct CategoryStore {
    /// Base directory holding one subdirectory per category
    root: PathBuf,
    /// Shared for per-key I/O, exclusive for a category-wide clear
    locks: HashMap<Category, RwLock<()>>,
}

impl CategoryStore {
    /// Open a store rooted at `root`, creating the category directories
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let locks = Category::STORAGE
            .iter()
            .map(|&category| (category, RwLock::new(())))
            .collect();

        let store = Self {
            root: root.into(),
            locks,
        };
        store.ensure_category_directories();

        info!(root = %store.root.display(), "Category store initialized");
        store
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing `category`, `None` for the synthetic `all`
    pub fn category_dir(&self, category: Category) -> Option<PathBuf> {
        category.dir_name().map(|name| self.root.join(name))
    }

    /// Create every category directory and sweep stale temp files.
    ///
    /// Idempotent. Failures are logged and otherwise ignored.
    pub fn ensure_category_directories(&self) {
        for category in Category::STORAGE {
            let Some(dir) = self.category_dir(category) else {
                continue;
            };
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(category = %category, dir = %dir.display(), error = %e, "Failed to create category directory");
                continue;
            }
            remove_stale_temp_files(&dir);
        }
    }

    /// Write `payload` under `key`, replacing any previous value
    pub fn store(&self, payload: &[u8], key: &str, category: Category) {
        if let Err(e) = self.try_store(payload, key, category) {
            log_absorbed("store", &e);
        }
    }

    /// Read the payload stored under `key`, if any
    pub fn retrieve(&self, key: &str, category: Category) -> Option<Vec<u8>> {
        self.lookup(key, category).into_option()
    }

    /// Delete the entry under `key`; a missing entry is not an error
    pub fn remove(&self, key: &str, category: Category) {
        if let Err(e) = self.try_remove(key, category) {
            log_absorbed("remove", &e);
        }
    }

    /// Delete and recreate the directory of `category`, or of every
    /// category for [`Category::All`]
    pub fn clear(&self, category: Category) {
        if category.is_synthetic() {
            self.clear_all();
            return;
        }
        if let Err(e) = self.try_clear(category) {
            log_absorbed("clear", &e);
        }
    }

    /// Clear every category, continuing past individual failures
    pub fn clear_all(&self) {
        let mut failed = 0usize;
        for category in Category::STORAGE {
            if let Err(e) = self.try_clear(category) {
                failed += 1;
                log_absorbed("clear", &e);
            }
        }
        info!(failed = failed, "Cleared all cache categories");
    }

    /// Sum of file sizes under every category directory.
    ///
    /// Unreadable entries are skipped, so the result is a lower bound.
    pub fn total_disk_size(&self) -> u64 {
        Category::STORAGE
            .iter()
            .map(|&category| self.category_disk_size(category))
            .sum()
    }

    /// Sum of file sizes under one category directory
    pub fn category_disk_size(&self, category: Category) -> u64 {
        match self.category_dir(category) {
            Some(dir) => dir_size(&dir),
            None => self.total_disk_size(),
        }
    }

    /// Fallible write, used by tiers that want to observe the outcome
    pub(crate) fn try_store(
        &self,
        payload: &[u8],
        key: &str,
        category: Category,
    ) -> Result<PathBuf, StorageError> {
        validate_file_name(key)?;
        let dir = self.category_dir(category).ok_or(StorageError::SyntheticCategory)?;
        let _guard = self.shared(category)?;

        // The directory may have been removed underneath us
        fs::create_dir_all(&dir).map_err(|e| StorageError::unavailable(&dir, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .suffix(&format!(".{}", TMP_EXTENSION))
            .tempfile_in(&dir)
            .map_err(|e| StorageError::unavailable(&dir, e))?;
        tmp.write_all(payload)
            .map_err(|e| StorageError::unavailable(tmp.path(), e))?;

        let path = dir.join(key);
        tmp.persist(&path)
            .map_err(|e| StorageError::unavailable(&path, e.error))?;

        debug!(
            category = %category,
            key = key,
            size = payload.len(),
            "Stored entry on disk"
        );
        Ok(path)
    }

    /// Fallible read distinguishing a miss from a failure
    pub(crate) fn lookup(&self, key: &str, category: Category) -> Lookup {
        if let Err(e) = validate_file_name(key) {
            return Lookup::Failed(e);
        }
        let Some(dir) = self.category_dir(category) else {
            return Lookup::Failed(StorageError::SyntheticCategory);
        };
        let _guard = match self.shared(category) {
            Ok(guard) => guard,
            Err(e) => return Lookup::Failed(e),
        };

        let path = dir.join(key);
        match fs::read(&path) {
            Ok(payload) => {
                trace!(category = %category, key = key, "Disk HIT");
                Lookup::Hit(payload)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(category = %category, key = key, "Disk MISS");
                Lookup::Miss
            }
            Err(e) => Lookup::Failed(StorageError::unreadable(path, e)),
        }
    }

    /// Fallible delete; `Ok(false)` when nothing was stored
    pub(crate) fn try_remove(&self, key: &str, category: Category) -> Result<bool, StorageError> {
        validate_file_name(key)?;
        let dir = self.category_dir(category).ok_or(StorageError::SyntheticCategory)?;
        let _guard = self.shared(category)?;

        let path = dir.join(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(category = %category, key = key, "Removed entry from disk");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::unavailable(path, e)),
        }
    }

    fn try_clear(&self, category: Category) -> Result<(), StorageError> {
        let dir = self.category_dir(category).ok_or(StorageError::SyntheticCategory)?;
        let _guard = self.exclusive(category)?;

        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::unavailable(&dir, e)),
        }
        fs::create_dir_all(&dir).map_err(|e| StorageError::unavailable(&dir, e))?;

        info!(category = %category, "Cleared cache category");
        Ok(())
    }

    fn shared(&self, category: Category) -> Result<RwLockReadGuard<'_, ()>, StorageError> {
        let lock = self.locks.get(&category).ok_or(StorageError::SyntheticCategory)?;
        Ok(lock.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn exclusive(&self, category: Category) -> Result<RwLockWriteGuard<'_, ()>, StorageError> {
        let lock = self.locks.get(&category).ok_or(StorageError::SyntheticCategory)?;
        Ok(lock.write().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Recursive file size total; skips anything it cannot stat or list
fn dir_size(dir: &Path) -> u64 {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory in size count");
            return 0;
        }
    };

    let mut total = 0;
    for entry in read_dir.flatten() {
        // DirEntry::metadata does not follow symlinks
        let Ok(metadata) = entry.metadata() else {
            debug!(path = %entry.path().display(), "Skipping unreadable entry in size count");
            continue;
        };
        if metadata.is_dir() {
            total += dir_size(&entry.path());
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }
    total
}

/// Remove temp files left behind by writes interrupted mid-flight
fn remove_stale_temp_files(dir: &Path) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        let is_temp = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(TMP_PREFIX))
            && path.extension().is_some_and(|ext| ext == TMP_EXTENSION);
        if is_temp {
            debug!(path = %path.display(), "Removing stale temp file");
            let _ = fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, CategoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CategoryStore::new(dir.path().join("cache"));
        (dir, store)
    }

    #[test]
    fn test_creates_category_directories() {
        let (_dir, store) = create_test_store();
        for name in ["API", "Data", "Files", "ImageCache"] {
            assert!(store.root().join(name).is_dir(), "missing {}", name);
        }
    }

    #[test]
    fn test_round_trip_every_category() {
        let (_dir, store) = create_test_store();
        for category in Category::STORAGE {
            let payload = format!("payload for {}", category).into_bytes();
            store.store(&payload, "entry", category);
            assert_eq!(store.retrieve("entry", category), Some(payload));
        }
    }

    #[test]
    fn test_categories_are_isolated() {
        let (_dir, store) = create_test_store();
        store.store(b"api body", "users", Category::Api);

        assert_eq!(store.retrieve("users", Category::Api), Some(b"api body".to_vec()));
        assert_eq!(store.retrieve("users", Category::Data), None);
        assert_eq!(store.retrieve("users", Category::File), None);
        assert_eq!(store.retrieve("users", Category::Image), None);
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let (_dir, store) = create_test_store();
        store.store(b"a much longer first payload", "key", Category::Data);
        store.store(b"short", "key", Category::Data);
        assert_eq!(store.retrieve("key", Category::Data), Some(b"short".to_vec()));
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = create_test_store();
        store.store(b"x", "gone", Category::File);
        store.remove("gone", Category::File);
        assert_eq!(store.retrieve("gone", Category::File), None);

        // Removing again is not an error
        store.remove("gone", Category::File);
        assert!(!store.try_remove("gone", Category::File).unwrap());
    }

    #[test]
    fn test_clear_isolates_categories() {
        let (_dir, store) = create_test_store();
        store.store(b"a", "k", Category::Api);
        store.store(b"b", "k", Category::Data);

        store.clear(Category::Api);

        assert_eq!(store.retrieve("k", Category::Api), None);
        assert_eq!(store.retrieve("k", Category::Data), Some(b"b".to_vec()));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_dir, store) = create_test_store();
        store.store(b"a", "k", Category::Image);

        for _ in 0..2 {
            store.clear(Category::Image);
            let dir = store.category_dir(Category::Image).unwrap();
            assert!(dir.is_dir());
            assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_clear_all() {
        let (_dir, store) = create_test_store();
        for category in Category::STORAGE {
            store.store(b"data", "k", category);
        }

        store.clear(Category::All);

        for category in Category::STORAGE {
            assert_eq!(store.retrieve("k", category), None);
            assert!(store.category_dir(category).unwrap().is_dir());
        }
        assert_eq!(store.total_disk_size(), 0);
    }

    #[test]
    fn test_total_disk_size_counts_stored_bytes() {
        let (_dir, store) = create_test_store();
        let before = store.total_disk_size();

        store.store(b"hello world", "readme", Category::Data);

        assert!(store.total_disk_size() >= before + 11);
        assert_eq!(store.category_disk_size(Category::Data), 11);
        assert_eq!(store.category_disk_size(Category::Api), 0);
    }

    #[test]
    fn test_total_disk_size_recurses_into_subdirectories() {
        let (_dir, store) = create_test_store();
        let nested = store.category_dir(Category::File).unwrap().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("deep"), vec![0u8; 100]).unwrap();
        store.store(&[1u8; 20], "top", Category::File);

        assert_eq!(store.category_disk_size(Category::File), 120);
        assert_eq!(store.category_disk_size(Category::All), 120);
    }

    #[test]
    fn test_unsafe_keys_are_rejected() {
        let (dir, store) = create_test_store();
        for key in ["", ".", "..", "../escape", "a/b", "a\\b", "nul\0byte"] {
            store.store(b"x", key, Category::Data);
            assert_eq!(store.retrieve(key, Category::Data), None);
            assert!(matches!(
                store.try_store(b"x", key, Category::Data),
                Err(StorageError::InvalidKey(_))
            ));
        }
        assert!(!dir.path().join("escape").exists());
        assert_eq!(store.total_disk_size(), 0);

        let long_key = "k".repeat(MAX_FILE_NAME_LEN + 1);
        assert!(validate_file_name(&long_key).is_err());
        assert!(validate_file_name("https%3A%2F%2Fexample.com").is_ok());
    }

    #[test]
    fn test_synthetic_category_is_not_a_partition() {
        let (_dir, store) = create_test_store();
        store.store(b"x", "k", Category::All);
        assert_eq!(store.retrieve("k", Category::All), None);
        assert!(matches!(
            store.try_store(b"x", "k", Category::All),
            Err(StorageError::SyntheticCategory)
        ));
    }

    #[test]
    fn test_unreadable_entry_is_a_miss() {
        let (_dir, store) = create_test_store();
        let dir = store.category_dir(Category::Data).unwrap();
        fs::create_dir(dir.join("not-a-file")).unwrap();

        assert!(matches!(
            store.lookup("not-a-file", Category::Data),
            Lookup::Failed(_)
        ));
        assert_eq!(store.retrieve("not-a-file", Category::Data), None);
    }

    #[test]
    fn test_store_recreates_missing_directory() {
        let (_dir, store) = create_test_store();
        fs::remove_dir_all(store.category_dir(Category::Api).unwrap()).unwrap();

        store.store(b"back", "k", Category::Api);
        assert_eq!(store.retrieve("k", Category::Api), Some(b"back".to_vec()));
    }

    #[test]
    fn test_stale_temp_files_are_swept() {
        let (_dir, store) = create_test_store();
        let dir = store.category_dir(Category::Data).unwrap();
        let stale = dir.join(".tiercache-abc123.tmp");
        fs::write(&stale, b"partial").unwrap();
        fs::write(dir.join("keep.tmp"), b"real entry").unwrap();

        store.ensure_category_directories();

        assert!(!stale.exists());
        assert_eq!(store.retrieve("keep.tmp", Category::Data), Some(b"real entry".to_vec()));
    }

    #[test]
    fn test_clear_does_not_disturb_concurrent_writes_elsewhere() {
        let (_dir, store) = create_test_store();
        let store = Arc::new(store);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    store.store(format!("v{}", i).as_bytes(), &format!("k{}", i), Category::Data);
                }
            })
        };
        let clearer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..20 {
                    store.store(b"x", "tmp", Category::Api);
                    store.clear(Category::Api);
                }
            })
        };
        writer.join().unwrap();
        clearer.join().unwrap();

        for i in 0..50 {
            assert_eq!(
                store.retrieve(&format!("k{}", i), Category::Data),
                Some(format!("v{}", i).into_bytes())
            );
        }
        assert_eq!(store.retrieve("tmp", Category::Api), None);
    }
}
