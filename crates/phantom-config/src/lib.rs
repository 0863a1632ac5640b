//! # phantom-config
//!
//! Everything the mount needs to know about its surroundings before it
//! can serve a callback: the enlistment's directory layout, the layered
//! core configuration (defaults → `.gvfs/config.dat` → `GVFS_*`
//! environment), the persisted repo metadata, the shared-cache mapping,
//! the required Git config table, and tracing initialization.

pub mod gitconfig;
pub mod kvfile;
pub mod logging;
pub mod metadata;
pub mod paths;

pub use kvfile::KvStore;
pub use metadata::RepoMetadata;
pub use paths::{EnlistmentLayout, LocalCache};

use std::path::Path;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {file}: {detail}")]
    Malformed { file: String, detail: String },

    #[error("disk layout version {found} is outside the supported range {min}..={max}")]
    DiskLayoutMismatch { found: u32, min: u32, max: u32 },

    #[error("missing required metadata key: {key}")]
    MissingKey { key: &'static str },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunables consumed across the core. Loaded once per mount.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Overrides the object endpoint advertised by the origin.
    pub cache_server_url: Option<String>,
    /// HTTP attempts per object request.
    pub max_retries: u32,
    /// Per-attempt HTTP timeout.
    pub timeout_seconds: u64,
    /// Backoff surfaced to the external status cache.
    pub status_cache_backoff_ms: u64,
    /// Suppresses interactive credential prompts.
    pub unattended: bool,
    /// Window in which concurrent object misses coalesce into one
    /// packfile request.
    pub batch_window_ms: u64,
    /// `--batch-size` handed to multi-pack-index repack.
    pub repack_batch_size: String,
    /// Allows mounting without a kernel filter (development only).
    pub allow_missing_filter: bool,
    /// Permits plain-HTTP object services (loopback development only;
    /// TLS is otherwise mandatory).
    pub allow_insecure_http: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_server_url: None,
            max_retries: 5,
            timeout_seconds: 30,
            status_cache_backoff_ms: 300_000,
            unattended: false,
            batch_window_ms: 50,
            repack_batch_size: "2g".to_string(),
            allow_missing_filter: false,
            allow_insecure_http: false,
        }
    }
}

impl CoreConfig {
    /// Loads defaults, then `.gvfs/config.dat`, then `GVFS_*` environment
    /// overrides (highest priority).
    pub fn load(config_file: &Path) -> Result<Self> {
        let mut config = Self::default();
        if config_file.exists() {
            debug!(path = %config_file.display(), "loading config.dat");
            let store = KvStore::load(config_file)?;
            config.apply_store(&store);
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_store(&mut self, store: &KvStore) {
        if let Some(url) = store.get("cacheServer") {
            self.cache_server_url = Some(url.to_string());
        }
        if let Some(n) = store.get_parsed("maxRetries") {
            self.max_retries = n;
        }
        if let Some(n) = store.get_parsed("timeoutSeconds") {
            self.timeout_seconds = n;
        }
        if let Some(n) = store.get_parsed("statusCacheBackoffMs") {
            self.status_cache_backoff_ms = n;
        }
        if store.get("unattended") == Some("1") {
            self.unattended = true;
        }
        if let Some(n) = store.get_parsed("batchWindowMs") {
            self.batch_window_ms = n;
        }
        if let Some(size) = store.get("repackBatchSize") {
            self.repack_batch_size = size.to_string();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("GVFS_CACHE_SERVER") {
            self.cache_server_url = Some(url);
        }
        if let Some(n) = env_parsed("GVFS_MAX_RETRIES") {
            self.max_retries = n;
        }
        if let Some(n) = env_parsed("GVFS_TIMEOUT_SECONDS") {
            self.timeout_seconds = n;
        }
        if let Some(n) = env_parsed("GVFS_STATUS_CACHE_BACKOFF_MS") {
            self.status_cache_backoff_ms = n;
        }
        if std::env::var("GVFS_UNATTENDED").as_deref() == Ok("1") {
            self.unattended = true;
        }
        if let Some(n) = env_parsed("GVFS_BATCH_WINDOW_MS") {
            self.batch_window_ms = n;
        }
        if let Ok(size) = std::env::var("GVFS_REPACK_BATCH_SIZE") {
            self.repack_batch_size = size;
        }
        if std::env::var("GVFS_NO_FILTER").as_deref() == Ok("1") {
            self.allow_missing_filter = true;
        }
        if std::env::var("GVFS_ALLOW_HTTP").as_deref() == Ok("1") {
            self.allow_insecure_http = true;
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_without_file() {
        let temp = TempDir::new().unwrap();
        let config = CoreConfig::load(&temp.path().join("missing.dat")).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.batch_window_ms, 50);
        assert!(!config.unattended);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.dat");
        std::fs::write(
            &path,
            "cacheServer=https://cache.example.com/gvfs\nmaxRetries=2\nunattended=1\n",
        )
        .unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(
            config.cache_server_url.as_deref(),
            Some("https://cache.example.com/gvfs")
        );
        assert_eq!(config.max_retries, 2);
        assert!(config.unattended);
        // Untouched keys keep their defaults.
        assert_eq!(config.timeout_seconds, 30);
    }
}
