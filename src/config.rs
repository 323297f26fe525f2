//! Cache configuration
//!
//! Defaults match the on-disk layout contract; every knob can be overridden
//! through `TIERCACHE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default number of entries held by the image memory tier
pub const DEFAULT_MEMORY_CAPACITY: u64 = 100;

/// Default deadline for a single disk operation on the async paths
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tiercache.sock";

/// Directory name under the platform cache dir
const ROOT_DIR_NAME: &str = "tiercache";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Base directory holding one subdirectory per category
    pub root: PathBuf,
    /// Maximum entries in the image memory tier
    pub memory_capacity: u64,
    /// Deadline applied by the async service wrappers
    pub io_timeout: Duration,
    /// Also delete the disk copy when an entry is evicted from memory
    pub evict_from_disk: bool,
    /// Initial state of the caching switch
    pub caching_enabled: bool,
    /// Unix socket for the control server
    pub socket_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(ROOT_DIR_NAME);

        Self {
            root,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            io_timeout: DEFAULT_IO_TIMEOUT,
            evict_from_disk: false,
            caching_enabled: true,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl CacheConfig {
    /// Defaults with the cache rooted somewhere else (tests, embedding hosts)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `TIERCACHE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay values from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(root) = lookup("TIERCACHE_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("TIERCACHE_MEMORY_CAPACITY") {
            config.memory_capacity = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid TIERCACHE_MEMORY_CAPACITY: {:?}", raw))?;
        }
        if let Some(raw) = lookup("TIERCACHE_IO_TIMEOUT_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid TIERCACHE_IO_TIMEOUT_MS: {:?}", raw))?;
            config.io_timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup("TIERCACHE_EVICT_FROM_DISK") {
            config.evict_from_disk = parse_flag(&raw)
                .with_context(|| format!("Invalid TIERCACHE_EVICT_FROM_DISK: {:?}", raw))?;
        }
        if let Some(raw) = lookup("TIERCACHE_ENABLED") {
            config.caching_enabled = parse_flag(&raw)
                .with_context(|| format!("Invalid TIERCACHE_ENABLED: {:?}", raw))?;
        }
        if let Some(path) = lookup("TIERCACHE_SOCKET") {
            config.socket_path = PathBuf::from(path);
        }

        Ok(config)
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.memory_capacity, 100);
        assert_eq!(config.io_timeout, Duration::from_secs(5));
        assert!(!config.evict_from_disk);
        assert!(config.caching_enabled);
        assert!(config.root.ends_with("tiercache"));
    }

    #[test]
    fn test_env_overrides() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("TIERCACHE_ROOT", "/var/tmp/tc"),
            ("TIERCACHE_MEMORY_CAPACITY", "7"),
            ("TIERCACHE_IO_TIMEOUT_MS", "250"),
            ("TIERCACHE_EVICT_FROM_DISK", "yes"),
            ("TIERCACHE_ENABLED", "off"),
            ("TIERCACHE_SOCKET", "/tmp/other.sock"),
        ]))
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/var/tmp/tc"));
        assert_eq!(config.memory_capacity, 7);
        assert_eq!(config.io_timeout, Duration::from_millis(250));
        assert!(config.evict_from_disk);
        assert!(!config.caching_enabled);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = CacheConfig::from_lookup(lookup_from(&[("TIERCACHE_MEMORY_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("TIERCACHE_MEMORY_CAPACITY"));

        assert!(CacheConfig::from_lookup(lookup_from(&[("TIERCACHE_ENABLED", "maybe")])).is_err());
    }
}
