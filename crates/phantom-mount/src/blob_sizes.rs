//! The blob-sizes store: `oid → size` so placeholder-info can answer
//! stat without reading blob bodies.
//!
//! LMDB-backed; sizes are primed when packs are indexed and when single
//! objects are hydrated, and survive across mounts.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;
use tracing::debug;

use phantom_odb::Oid;

#[derive(Error, Debug)]
pub enum BlobSizesError {
    #[error("blob-sizes store error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BlobSizesError>;

/// Persistent `oid → u64` map.
pub struct BlobSizes {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl BlobSizes {
    /// 256 MiB is room for tens of millions of entries.
    const MAP_SIZE: usize = 256 * 1024 * 1024;

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::MAP_SIZE)
                .max_dbs(1)
                .open(dir)?
        };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some("blob-sizes"))?;
        wtxn.commit()?;
        debug!(path = %dir.display(), "blob-sizes store opened");
        Ok(Self { env, db })
    }

    pub fn get(&self, oid: &Oid) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.db.get(&rtxn, oid.as_bytes())? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw.try_into().unwrap_or([0u8; 8]);
        Ok(Some(u64::from_le_bytes(bytes)))
    }

    pub fn put(&self, oid: &Oid, size: u64) -> Result<()> {
        self.put_many(std::iter::once((*oid, size)))
    }

    /// One transaction for a whole pack's worth of sizes.
    pub fn put_many<I: IntoIterator<Item = (Oid, u64)>>(&self, entries: I) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for (oid, size) in entries {
            self.db
                .put(&mut wtxn, oid.as_bytes(), &size.to_le_bytes())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Durability barrier used at unmount.
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = BlobSizes::open(temp.path().join("sizes")).unwrap();
        let oid = Oid::from_bytes([0xaa; 20]);

        assert_eq!(store.get(&oid).unwrap(), None);
        store.put(&oid, 42).unwrap();
        assert_eq!(store.get(&oid).unwrap(), Some(42));
    }

    #[test]
    fn persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sizes");
        let oid = Oid::from_bytes([0xbb; 20]);
        {
            let store = BlobSizes::open(&dir).unwrap();
            store
                .put_many([(oid, 7), (Oid::from_bytes([0xcc; 20]), 9)])
                .unwrap();
            store.sync().unwrap();
        }
        let store = BlobSizes::open(&dir).unwrap();
        assert_eq!(store.get(&oid).unwrap(), Some(7));
    }
}
