//! Enlistment directory layout and the shared local cache.
//!
//! An enlistment:
//! ```text
//! <root>/
//! ├── src/            virtualized working tree
//! ├── .git/           git dir (objects delegate via alternates)
//! └── .gvfs/
//!     ├── RepoMetadata.dat
//!     ├── config.dat
//!     ├── databases/  modified-paths log, blob sizes
//!     ├── maintenance/ <step>.time gate files
//!     ├── logs/
//!     └── diagnostics/
//! ```
//!
//! The local cache root is shared between enlistments; `mapping.dat`
//! maps each enlistment id to the cache key directory holding its
//! `gitObjects/` and `gitStatusCache/`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::kvfile::KvStore;
use crate::Result;

/// Paths inside one enlistment.
#[derive(Debug, Clone)]
pub struct EnlistmentLayout {
    root: PathBuf,
}

impl EnlistmentLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worktree(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    pub fn git_index(&self) -> PathBuf {
        self.git_dir().join("index")
    }

    pub fn git_objects(&self) -> PathBuf {
        self.git_dir().join("objects")
    }

    pub fn git_hooks(&self) -> PathBuf {
        self.git_dir().join("hooks")
    }

    pub fn gvfs_dir(&self) -> PathBuf {
        self.root.join(".gvfs")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.gvfs_dir().join("RepoMetadata.dat")
    }

    pub fn config_file(&self) -> PathBuf {
        self.gvfs_dir().join("config.dat")
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.gvfs_dir().join("databases")
    }

    pub fn modified_paths_file(&self) -> PathBuf {
        self.databases_dir().join("ModifiedPaths.dat")
    }

    pub fn blob_sizes_dir(&self) -> PathBuf {
        self.databases_dir().join("BlobSizes")
    }

    pub fn maintenance_dir(&self) -> PathBuf {
        self.gvfs_dir().join("maintenance")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.gvfs_dir().join("logs")
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.gvfs_dir().join("diagnostics")
    }

    /// The per-enlistment pipe. Named from a stable hash of the root so
    /// the path stays short enough for a socket address.
    pub fn pipe_path(&self) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        self.root.hash(&mut hasher);
        let tag = format!("{:016x}", hasher.finish());
        std::env::temp_dir().join(format!("phantom-{tag}.pipe"))
    }

    /// A plausible enlistment has a git dir and a metadata root.
    pub fn looks_valid(&self) -> bool {
        self.git_dir().is_dir() && self.gvfs_dir().is_dir()
    }

    /// Creates the writable metadata directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.gvfs_dir(),
            self.databases_dir(),
            self.maintenance_dir(),
            self.logs_dir(),
            self.diagnostics_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// The shared local cache root and its `mapping.dat`.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mapping_file(&self) -> PathBuf {
        self.root.join("mapping.dat")
    }

    /// Resolves the cache key for an enlistment, allocating a fresh one
    /// on first use so later mounts of the same enlistment share it.
    pub fn resolve_cache_key(&self, enlistment_id: &str) -> Result<String> {
        std::fs::create_dir_all(&self.root)?;
        let mut mapping = KvStore::load_or_new(self.mapping_file())?;
        if let Some(existing) = mapping.get(enlistment_id) {
            return Ok(existing.to_string());
        }
        let key = Uuid::new_v4().simple().to_string();
        mapping.set(enlistment_id, key.clone());
        mapping.save()?;
        Ok(key)
    }

    /// Shared object root for a cache key; the alternates target.
    pub fn git_objects_dir(&self, cache_key: &str) -> PathBuf {
        self.root.join(cache_key).join("gitObjects")
    }

    /// Serialized-status cache directory for a cache key.
    pub fn status_cache_dir(&self, cache_key: &str) -> PathBuf {
        self.root.join(cache_key).join("gitStatusCache")
    }
}
