//! # phantom-journal
//!
//! Append-only log of the working-tree paths the projection can no
//! longer speak for: files the user wrote, folders the user created or
//! reshaped, and tombstones for deletions.
//!
//! On-disk format (version `1`): a `1\n` version line, then one record
//! per entry: a single sigil byte (`f` modified file, `d` modified
//! folder, `x` tombstone), the forward-slash path, and a NUL terminator.
//! Appends are fsync'd; duplicate appends are allowed and de-duplicated
//! by the in-memory sets on load. The parser tolerates a truncated final
//! record so a crash mid-append loses at most that record.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Current journal format version.
pub const JOURNAL_VERSION: &str = "1";

const SIGIL_FILE: u8 = b'f';
const SIGIL_FOLDER: u8 = b'd';
const SIGIL_TOMBSTONE: u8 = b'x';

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported journal version: {found}")]
    UnsupportedVersion { found: String },
}

pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Default)]
struct PathSets {
    modified_files: HashSet<String>,
    modified_folders: HashSet<String>,
    tombstones: HashSet<String>,
}

/// The modified-paths journal: an append-only file plus the in-memory
/// sets rebuilt from it on open.
pub struct ModifiedPaths {
    path: PathBuf,
    writer: Mutex<File>,
    sets: RwLock<PathSets>,
}

impl ModifiedPaths {
    /// Opens (creating if absent) the journal and loads it into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut sets = PathSets::default();
        let mut raw = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut raw)?;
        }
        // An empty file is a fresh journal, including one left behind by
        // a crash between create and the version write.
        let fresh = raw.is_empty();
        if !fresh {
            parse_journal(&raw, &mut sets)?;
        }

        let mut writer = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writer.write_all(JOURNAL_VERSION.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.sync_all()?;
        } else if raw.last() != Some(&0) && raw.last() != Some(&b'\n') {
            // A crash mid-append left the final record unterminated;
            // seal it so the next append starts a fresh record.
            writer.write_all(&[0])?;
            writer.sync_all()?;
        }

        debug!(
            path = %path.display(),
            modified = sets.modified_files.len() + sets.modified_folders.len(),
            tombstones = sets.tombstones.len(),
            "modified-paths journal loaded"
        );
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            sets: RwLock::new(sets),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a user-modified path. Returns false if it was already
    /// recorded (no bytes written).
    pub fn record_modified(&self, path: &str, is_folder: bool) -> Result<bool> {
        let normalized = normalize(path);
        {
            let sets = self.sets.read();
            let present = if is_folder {
                sets.modified_folders.contains(&normalized)
            } else {
                sets.modified_files.contains(&normalized)
            };
            if present {
                return Ok(false);
            }
        }
        let sigil = if is_folder { SIGIL_FOLDER } else { SIGIL_FILE };
        self.append_record(sigil, &normalized)?;
        let mut sets = self.sets.write();
        if is_folder {
            sets.modified_folders.insert(normalized);
        } else {
            sets.modified_files.insert(normalized);
        }
        Ok(true)
    }

    /// Records a deletion tombstone. Returns false if already recorded.
    pub fn record_tombstone(&self, path: &str) -> Result<bool> {
        let normalized = normalize(path);
        if self.sets.read().tombstones.contains(&normalized) {
            return Ok(false);
        }
        self.append_record(SIGIL_TOMBSTONE, &normalized)?;
        self.sets.write().tombstones.insert(normalized);
        Ok(true)
    }

    /// A checkout overwrote a tombstoned path; it is projectable again.
    /// The reversal is journaled as a folder/file modification so the
    /// on-disk log stays append-only.
    pub fn clear_tombstone(&self, path: &str) -> Result<bool> {
        let normalized = normalize(path);
        if !self.sets.read().tombstones.contains(&normalized) {
            return Ok(false);
        }
        self.append_record(SIGIL_FILE, &normalized)?;
        let mut sets = self.sets.write();
        sets.tombstones.remove(&normalized);
        sets.modified_files.insert(normalized);
        Ok(true)
    }

    /// True when the path itself was journaled as modified, or any
    /// ancestor was journaled as a modified folder.
    pub fn is_modified(&self, path: &str) -> bool {
        let normalized = normalize(path);
        let sets = self.sets.read();
        if sets.modified_files.contains(&normalized)
            || sets.modified_folders.contains(&normalized)
        {
            return true;
        }
        let result = ancestors(&normalized).any(|a| sets.modified_folders.contains(a));
        result
    }

    /// True when the path or any ancestor carries a tombstone.
    pub fn is_tombstoned(&self, path: &str) -> bool {
        let normalized = normalize(path);
        let sets = self.sets.read();
        if sets.tombstones.contains(&normalized) {
            return true;
        }
        let result = ancestors(&normalized).any(|a| sets.tombstones.contains(a));
        result
    }

    /// All journaled paths, de-duplicated, in no particular order.
    /// Consumed by the external `status` path over IPC.
    pub fn enumerate(&self) -> Vec<String> {
        let sets = self.sets.read();
        let mut out: Vec<String> = sets
            .modified_files
            .iter()
            .chain(sets.modified_folders.iter())
            .chain(sets.tombstones.iter())
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Total distinct journaled paths.
    pub fn count(&self) -> usize {
        self.enumerate().len()
    }

    /// Forces file durability; appends already sync, so this is a no-op
    /// barrier used at unmount.
    pub fn flush(&self) -> Result<()> {
        self.writer.lock().sync_all()?;
        Ok(())
    }

    fn append_record(&self, sigil: u8, normalized: &str) -> Result<()> {
        let mut record = Vec::with_capacity(normalized.len() + 2);
        record.push(sigil);
        record.extend_from_slice(normalized.as_bytes());
        record.push(0);

        let mut writer = self.writer.lock();
        writer.write_all(&record)?;
        writer.sync_all()?;
        Ok(())
    }
}

/// Normalizes to forward slashes with no leading slash. POSIX keeps the
/// byte-exact casing.
fn normalize(path: &str) -> String {
    let slashed = path.replace('\\', "/");
    slashed.trim_matches('/').to_string()
}

/// Iterates the proper ancestors of a normalized path, deepest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(path.rfind('/').map(|i| &path[..i]), |prev| {
        prev.rfind('/').map(|i| &prev[..i])
    })
}

fn parse_journal(raw: &[u8], sets: &mut PathSets) -> Result<()> {
    let newline = raw
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(raw.len());
    let version = String::from_utf8_lossy(&raw[..newline]).trim().to_string();
    if version != JOURNAL_VERSION {
        return Err(JournalError::UnsupportedVersion { found: version });
    }

    let body = &raw[(newline + 1).min(raw.len())..];
    for record in body.split(|&b| b == 0) {
        if record.is_empty() {
            continue;
        }
        // A record without its NUL terminator can only be the last one
        // (crash mid-append); it parsed fine up to here, so keep it.
        let sigil = record[0];
        let Ok(path) = std::str::from_utf8(&record[1..]) else {
            warn!("skipping non-utf8 journal record");
            continue;
        };
        if path.is_empty() {
            continue;
        }
        match sigil {
            SIGIL_FILE => {
                sets.tombstones.remove(path);
                sets.modified_files.insert(path.to_string());
            }
            SIGIL_FOLDER => {
                sets.tombstones.remove(path);
                sets.modified_folders.insert(path.to_string());
            }
            SIGIL_TOMBSTONE => {
                sets.tombstones.insert(path.to_string());
            }
            other => warn!(sigil = other, "skipping journal record with unknown sigil"),
        }
    }
    Ok(())
}
