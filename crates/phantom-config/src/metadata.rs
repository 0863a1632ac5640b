//! Persisted repo metadata (`RepoMetadata.dat`).
//!
//! Written at clone time, validated on every mount. The disk layout
//! version gates whether this build of the core can serve the on-disk
//! state; a mismatch means the enlistment needs a rebaseline, not a
//! best-effort mount.

use std::path::Path;

use uuid::Uuid;

use crate::kvfile::KvStore;
use crate::{ConfigError, Result};

/// Lowest on-disk layout this build can mount.
pub const MIN_DISK_LAYOUT_MAJOR: u32 = 1;
/// Highest (current) on-disk layout.
pub const CURRENT_DISK_LAYOUT_MAJOR: u32 = 1;
pub const CURRENT_DISK_LAYOUT_MINOR: u32 = 0;

const KEY_ENLISTMENT_ID: &str = "enlistmentId";
const KEY_LAYOUT_MAJOR: &str = "diskLayoutMajor";
const KEY_LAYOUT_MINOR: &str = "diskLayoutMinor";
const KEY_REPO_URL: &str = "repoUrl";
const KEY_LOCAL_CACHE_ROOT: &str = "localCacheRoot";

/// Typed access to the metadata store.
#[derive(Debug, Clone)]
pub struct RepoMetadata {
    store: KvStore,
}

impl RepoMetadata {
    /// Loads and validates existing metadata.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let metadata = Self {
            store: KvStore::load(path)?,
        };
        metadata.validate_layout()?;
        Ok(metadata)
    }

    /// Initializes metadata for a fresh enlistment (first mount after
    /// clone). The enlistment id is minted here and never changes.
    pub fn initialize<P: AsRef<Path>>(
        path: P,
        repo_url: &str,
        local_cache_root: &Path,
    ) -> Result<Self> {
        let mut store = KvStore::load_or_new(path)?;
        store.set(KEY_ENLISTMENT_ID, Uuid::new_v4().to_string());
        store.set(KEY_LAYOUT_MAJOR, CURRENT_DISK_LAYOUT_MAJOR.to_string());
        store.set(KEY_LAYOUT_MINOR, CURRENT_DISK_LAYOUT_MINOR.to_string());
        store.set(KEY_REPO_URL, repo_url);
        store.set(
            KEY_LOCAL_CACHE_ROOT,
            local_cache_root.to_string_lossy().to_string(),
        );
        store.save()?;
        Ok(Self { store })
    }

    fn validate_layout(&self) -> Result<()> {
        let major = self
            .store
            .get_parsed::<u32>(KEY_LAYOUT_MAJOR)
            .ok_or(ConfigError::MissingKey {
                key: KEY_LAYOUT_MAJOR,
            })?;
        if !(MIN_DISK_LAYOUT_MAJOR..=CURRENT_DISK_LAYOUT_MAJOR).contains(&major) {
            return Err(ConfigError::DiskLayoutMismatch {
                found: major,
                min: MIN_DISK_LAYOUT_MAJOR,
                max: CURRENT_DISK_LAYOUT_MAJOR,
            });
        }
        Ok(())
    }

    pub fn enlistment_id(&self) -> Result<&str> {
        self.store.get(KEY_ENLISTMENT_ID).ok_or(ConfigError::MissingKey {
            key: KEY_ENLISTMENT_ID,
        })
    }

    pub fn repo_url(&self) -> Result<&str> {
        self.store.get(KEY_REPO_URL).ok_or(ConfigError::MissingKey {
            key: KEY_REPO_URL,
        })
    }

    pub fn local_cache_root(&self) -> Result<&str> {
        self.store
            .get(KEY_LOCAL_CACHE_ROOT)
            .ok_or(ConfigError::MissingKey {
                key: KEY_LOCAL_CACHE_ROOT,
            })
    }

    /// `major.minor` string for status output.
    pub fn disk_layout_version(&self) -> String {
        format!(
            "{}.{}",
            self.store.get(KEY_LAYOUT_MAJOR).unwrap_or("?"),
            self.store.get(KEY_LAYOUT_MINOR).unwrap_or("?")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("RepoMetadata.dat");
        let cache_root = temp.path().join("cache");

        let created =
            RepoMetadata::initialize(&path, "https://example.com/big.git", &cache_root).unwrap();
        let id = created.enlistment_id().unwrap().to_string();

        let loaded = RepoMetadata::load(&path).unwrap();
        assert_eq!(loaded.enlistment_id().unwrap(), id);
        assert_eq!(loaded.repo_url().unwrap(), "https://example.com/big.git");
        assert_eq!(loaded.disk_layout_version(), "1.0");
    }

    #[test]
    fn future_layout_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("RepoMetadata.dat");
        std::fs::write(
            &path,
            "enlistmentId=x\ndiskLayoutMajor=99\ndiskLayoutMinor=0\n",
        )
        .unwrap();

        assert!(matches!(
            RepoMetadata::load(&path),
            Err(ConfigError::DiskLayoutMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn missing_layout_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("RepoMetadata.dat");
        std::fs::write(&path, "enlistmentId=x\n").unwrap();
        assert!(matches!(
            RepoMetadata::load(&path),
            Err(ConfigError::MissingKey { .. })
        ));
    }
}
