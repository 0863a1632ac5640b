//! # phantom-index
//!
//! Parses the Git index (v4) and projects it into per-directory listing
//! snapshots the virtualization callbacks serve from.
//!
//! Snapshots are immutable and published behind an `Arc`; a rebuild is
//! never partially visible, readers keep whichever snapshot pointer they
//! loaded. Rebuilds happen only when the index file's identity (mtime,
//! size, inode) changes or on explicit invalidation.

pub mod format;
pub mod projection;

pub use format::{IndexEntry, ParsedIndex};
pub use projection::{
    DirectoryListing, EntryMode, ListedEntry, ListingSource, ProjectedEntry, Projector, Snapshot,
};

use thiserror::Error;

/// Errors from index parsing and projection.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index: {detail}")]
    Corrupt { detail: String },

    #[error("unsupported index version: {version}")]
    UnsupportedVersion { version: u32 },
}

impl IndexError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
