//! # phantom-odb
//!
//! Git object database for the phantom virtual file system.
//!
//! Two storage tiers back every read:
//! - **Loose**: one zlib-deflated file per object under `xx/yyyy…`.
//! - **Packed**: `pack-*.pack` files located through their `.idx` v2
//!   companions, with an optional `multi-pack-index` consulted first.
//!
//! Writes are atomic (temp file + fsync + rename) so concurrent mounts
//! sharing one object root never observe a torn object. Packs downloaded
//! from the object service are indexed in-process and covered by a `.keep`
//! marker so maintenance can tell our packs from Git's.

pub mod idx;
pub mod loose;
pub mod midx;
pub mod oid;
pub mod pack;
pub mod store;

pub use idx::IdxView;
pub use loose::LooseStore;
pub use midx::MidxView;
pub use oid::Oid;
pub use store::ObjectStore;

use std::io;

use thiserror::Error;

/// Errors from object database operations.
#[derive(Error, Debug)]
pub enum OdbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("object not found: {oid}")]
    NotFound { oid: Oid },

    #[error("corrupt object data: {detail}")]
    Corrupt { detail: String },

    #[error("invalid object id: {input}")]
    BadOid { input: String },

    #[error("unsupported {what} version: {version}")]
    UnsupportedVersion { what: &'static str, version: u32 },
}

impl OdbError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OdbError>;

/// The four storable Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectType {
    /// Canonical lowercase name as it appears in loose object headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }

    /// Parses a loose-header type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "commit" => Some(Self::Commit),
            "tree" => Some(Self::Tree),
            "blob" => Some(Self::Blob),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
