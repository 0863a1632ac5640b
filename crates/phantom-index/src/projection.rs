//! Working-tree projection derived from the index.
//!
//! A [`Snapshot`] maps every visible directory to its sorted child
//! entries. The [`Projector`] owns the current snapshot behind an
//! atomic pointer; rebuilds swap the pointer, so a reader's snapshot
//! never changes under it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use phantom_journal::ModifiedPaths;
use phantom_odb::Oid;

use crate::format::ParsedIndex;
use crate::Result;

/// Entry kind as projected into the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Regular,
    Executable,
    Symlink,
    /// Submodule boundary (gitlink); projected as an empty directory.
    Submodule,
    /// Directory implied by deeper entries.
    Subtree,
}

impl EntryMode {
    /// Maps a raw Git mode word.
    pub fn from_git_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o120000 => Self::Symlink,
            0o160000 => Self::Submodule,
            0o040000 => Self::Subtree,
            _ => {
                if mode & 0o111 != 0 {
                    Self::Executable
                } else {
                    Self::Regular
                }
            }
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, Self::Subtree | Self::Submodule)
    }
}

/// One projected child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEntry {
    pub name: String,
    pub oid: Oid,
    pub mode: EntryMode,
    /// Set for phantom entries (skip-worktree in the index).
    pub skip_worktree: bool,
}

/// Immutable projection of the whole index, keyed by directory path
/// (`""` is the worktree root, otherwise `a/b` with forward slashes).
#[derive(Debug, Default)]
pub struct Snapshot {
    dirs: HashMap<String, Vec<ProjectedEntry>>,
    entry_count: usize,
}

impl Snapshot {
    /// Builds a snapshot from parsed index entries, synthesizing the
    /// intermediate directories.
    pub fn build(index: &ParsedIndex) -> Self {
        let mut dirs: HashMap<String, Vec<ProjectedEntry>> = HashMap::new();
        dirs.entry(String::new()).or_default();

        for entry in &index.entries {
            let (parent, name) = split_parent(&entry.path);
            dirs.entry(parent.to_string())
                .or_default()
                .push(ProjectedEntry {
                    name: name.to_string(),
                    oid: entry.oid,
                    mode: EntryMode::from_git_mode(entry.mode),
                    skip_worktree: entry.skip_worktree,
                });

            // Register each ancestor directory with its own parent.
            let mut dir = parent;
            while !dir.is_empty() {
                let (grand, dir_name) = split_parent(dir);
                let siblings = dirs.entry(grand.to_string()).or_default();
                if !siblings.iter().any(|e| e.name == dir_name) {
                    siblings.push(ProjectedEntry {
                        name: dir_name.to_string(),
                        oid: Oid::default(),
                        mode: EntryMode::Subtree,
                        skip_worktree: false,
                    });
                }
                dir = grand;
            }
        }

        for children in dirs.values_mut() {
            children.sort_by(|a, b| a.name.cmp(&b.name));
            children.dedup_by(|a, b| a.name == b.name);
        }

        Self {
            entry_count: index.entries.len(),
            dirs,
        }
    }

    /// Number of file entries the snapshot was built from.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Sorted children of a projected directory, if that directory is
    /// part of the projection at all.
    pub fn children(&self, dir: &str) -> Option<&[ProjectedEntry]> {
        self.dirs.get(dir).map(Vec::as_slice)
    }

    /// Single-entry lookup by full path.
    pub fn entry(&self, path: &str) -> Option<&ProjectedEntry> {
        let (parent, name) = split_parent(path);
        let children = self.dirs.get(parent)?;
        let idx = children
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()?;
        Some(&children[idx])
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Where a listed entry's metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingSource {
    /// Straight from the projection.
    Projected,
    /// Journal says the user touched it; metadata re-stat'd from disk.
    OnDisk,
}

/// One row of a merged directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedEntry {
    pub name: String,
    pub mode: EntryMode,
    pub source: ListingSource,
    /// On-disk size for `OnDisk` rows; projected rows resolve size
    /// through the blob-sizes cache instead.
    pub size: Option<u64>,
    pub oid: Option<Oid>,
}

/// A merged listing for one directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub entries: Vec<ListedEntry>,
}

/// Identity of the index file a snapshot was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexStamp {
    mtime_secs: i64,
    mtime_nanos: u32,
    size: u64,
    ino: u64,
}

impl IndexStamp {
    fn read(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        #[cfg(unix)]
        let (ino, mtime_secs, mtime_nanos) = {
            use std::os::unix::fs::MetadataExt;
            (meta.ino(), meta.mtime(), meta.mtime_nsec() as u32)
        };
        #[cfg(not(unix))]
        let (ino, mtime_secs, mtime_nanos) = (0u64, 0i64, 0u32);
        Ok(Self {
            mtime_secs,
            mtime_nanos,
            size: meta.len(),
            ino,
        })
    }
}

/// Owns the current projection snapshot and rebuilds it from the index
/// file when stale.
pub struct Projector {
    index_path: std::path::PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes rebuilds; readers never take it.
    rebuild: Mutex<Option<IndexStamp>>,
}

impl Projector {
    /// Parses the index and builds the initial snapshot.
    pub fn open<P: AsRef<Path>>(index_path: P) -> Result<Self> {
        let index_path = index_path.as_ref().to_path_buf();
        let projector = Self {
            index_path,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            rebuild: Mutex::new(None),
        };
        projector.rebuild_now()?;
        Ok(projector)
    }

    /// The current snapshot pointer. Callers hold it for as long as they
    /// need a consistent view.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Forces the next [`refresh_if_stale`](Self::refresh_if_stale) to
    /// rebuild regardless of the file stamp.
    pub fn invalidate(&self) {
        *self.rebuild.lock() = None;
        debug!("projection invalidated");
    }

    /// Rebuilds when the index file's (mtime, size, inode) changed since
    /// the last build. Returns whether a rebuild happened.
    pub fn refresh_if_stale(&self) -> Result<bool> {
        let current = IndexStamp::read(&self.index_path)?;
        {
            let guard = self.rebuild.lock();
            if *guard == Some(current) {
                return Ok(false);
            }
        }
        self.rebuild_now()?;
        Ok(true)
    }

    fn rebuild_now(&self) -> Result<()> {
        let mut guard = self.rebuild.lock();
        let stamp = IndexStamp::read(&self.index_path)?;
        let data = fs::read(&self.index_path)?;
        let parsed = ParsedIndex::parse(&data)?;
        let snapshot = Arc::new(Snapshot::build(&parsed));
        info!(entries = snapshot.entry_count(), "projection rebuilt");
        *self.snapshot.write() = snapshot;
        *guard = Some(stamp);
        Ok(())
    }

    /// Merged listing for `dir`: projection minus tombstones, with
    /// journal-modified entries re-stat'd from the working tree.
    ///
    /// Returns `None` when the directory is not part of the projection
    /// or has itself been tombstoned.
    pub fn list_directory(
        &self,
        dir: &str,
        journal: &ModifiedPaths,
        worktree_root: &Path,
    ) -> Option<DirectoryListing> {
        if !dir.is_empty() && journal.is_tombstoned(dir) {
            return None;
        }
        let snapshot = self.snapshot();
        let children = snapshot.children(dir)?;

        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            let full_path = if dir.is_empty() {
                child.name.clone()
            } else {
                format!("{dir}/{}", child.name)
            };
            if journal.is_tombstoned(&full_path) {
                continue;
            }
            if journal.is_modified(&full_path) {
                match fs::symlink_metadata(worktree_root.join(&full_path)) {
                    Ok(meta) => {
                        let mode = if meta.is_dir() {
                            EntryMode::Subtree
                        } else if meta.file_type().is_symlink() {
                            EntryMode::Symlink
                        } else {
                            on_disk_file_mode(&meta)
                        };
                        entries.push(ListedEntry {
                            name: child.name.clone(),
                            mode,
                            source: ListingSource::OnDisk,
                            size: (!meta.is_dir()).then(|| meta.len()),
                            oid: None,
                        });
                    }
                    // Touched but gone from disk and not tombstoned:
                    // nothing truthful to report, so omit it.
                    Err(_) => continue,
                }
            } else {
                entries.push(ListedEntry {
                    name: child.name.clone(),
                    mode: child.mode,
                    source: ListingSource::Projected,
                    size: None,
                    oid: Some(child.oid),
                });
            }
        }
        Some(DirectoryListing { entries })
    }

    /// Single-shot lookup backing get-placeholder-info.
    pub fn entry_for(&self, path: &str) -> Option<ProjectedEntry> {
        self.snapshot().entry(path).cloned()
    }
}

#[cfg(unix)]
fn on_disk_file_mode(meta: &fs::Metadata) -> EntryMode {
    use std::os::unix::fs::MetadataExt;
    if meta.mode() & 0o111 != 0 {
        EntryMode::Executable
    } else {
        EntryMode::Regular
    }
}

#[cfg(not(unix))]
fn on_disk_file_mode(_meta: &fs::Metadata) -> EntryMode {
    EntryMode::Regular
}
