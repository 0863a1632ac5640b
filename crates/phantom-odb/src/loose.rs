//! Loose object tier.
//!
//! One zlib-deflated file per object at `<root>/xx/yyyy…` where `xx` is the
//! first hex byte of the OID. The deflated stream contains the canonical
//! `"<type> <len>\0"` header followed by the payload.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::Rng;

use crate::{ObjectType, OdbError, Oid, Result};

/// Hard cap on a single inflated loose object (512 MiB). Anything larger
/// is treated as corruption rather than allocated.
const MAX_LOOSE_SIZE: usize = 512 * 1024 * 1024;

/// Loose object store rooted at a Git object directory.
#[derive(Debug, Clone)]
pub struct LooseStore {
    root: PathBuf,
}

impl LooseStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where an object with this id lives (whether or not it exists).
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// O(1) existence probe.
    pub fn contains(&self, oid: &Oid) -> bool {
        self.object_path(oid).exists()
    }

    /// Reads and inflates a loose object, returning its type and payload.
    pub fn read(&self, oid: &Oid) -> Result<(ObjectType, Vec<u8>)> {
        let path = self.object_path(oid);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OdbError::NotFound { oid: *oid }
            } else {
                OdbError::Io(e)
            }
        })?;
        let mut inflated = Vec::new();
        let mut decoder = ZlibDecoder::new(file);
        std::io::Read::by_ref(&mut decoder)
            .take(MAX_LOOSE_SIZE as u64 + 1)
            .read_to_end(&mut inflated)
            .map_err(|e| OdbError::corrupt(format!("bad zlib stream for {oid}: {e}")))?;
        if inflated.len() > MAX_LOOSE_SIZE {
            return Err(OdbError::corrupt(format!("loose object {oid} exceeds size cap")));
        }
        parse_object(&inflated, oid)
    }

    /// Stores an already-deflated stream under `oid`, returning the
    /// object's type and payload size.
    ///
    /// The stream is inflated and re-hashed before it is persisted; a
    /// mismatch is corruption, never silently stored.
    pub fn write_deflated(&self, oid: &Oid, deflated: &[u8]) -> Result<(ObjectType, u64)> {
        let mut inflated = Vec::new();
        let mut decoder = ZlibDecoder::new(deflated);
        std::io::Read::by_ref(&mut decoder)
            .take(MAX_LOOSE_SIZE as u64 + 1)
            .read_to_end(&mut inflated)
            .map_err(|e| OdbError::corrupt(format!("bad zlib stream for {oid}: {e}")))?;
        let (object_type, payload) = parse_object(&inflated, oid)?;
        let actual = Oid::compute(object_type, &payload);
        if actual != *oid {
            return Err(OdbError::corrupt(format!(
                "hash mismatch: expected {oid}, got {actual}"
            )));
        }
        if !self.contains(oid) {
            self.persist(oid, deflated)?;
        }
        Ok((object_type, payload.len() as u64))
    }

    /// Deflates and stores a payload, returning its computed id.
    pub fn write_object(&self, object_type: ObjectType, payload: &[u8]) -> Result<Oid> {
        let oid = Oid::compute(object_type, payload);
        if self.contains(&oid) {
            return Ok(oid);
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(object_type.as_str().as_bytes())?;
        encoder.write_all(b" ")?;
        encoder.write_all(payload.len().to_string().as_bytes())?;
        encoder.write_all(b"\0")?;
        encoder.write_all(payload)?;
        let deflated = encoder.finish()?;
        self.persist(&oid, &deflated)?;
        Ok(oid)
    }

    /// Atomic write: temp file in the target directory, fsync, rename.
    /// A rename that loses a race to another writer is fine; the loser's
    /// bytes are identical.
    fn persist(&self, oid: &Oid, deflated: &[u8]) -> Result<()> {
        let path = self.object_path(oid);
        let parent = path.parent().expect("object path always has a parent");
        fs::create_dir_all(parent)?;

        let suffix: u32 = rand::thread_rng().gen();
        let tmp_path = parent.join(format!("tmp_obj_{suffix:08x}"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(deflated)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            if path.exists() {
                return Ok(());
            }
            return Err(OdbError::Io(e));
        }
        Ok(())
    }

    /// Removes a loose object. Missing files are not an error.
    pub fn remove(&self, oid: &Oid) -> Result<()> {
        match fs::remove_file(self.object_path(oid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OdbError::Io(e)),
        }
    }

    /// Enumerates every loose object id under the root.
    pub fn iter_oids(&self) -> Result<Vec<Oid>> {
        let mut oids = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name();
            let Some(prefix) = prefix.to_str() else { continue };
            if prefix.len() != 2 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Ok(oid) = Oid::from_hex(&format!("{prefix}{name}")) {
                    oids.push(oid);
                }
            }
        }
        oids.sort();
        Ok(oids)
    }
}

/// Splits `"<type> <len>\0payload"` and validates the declared length.
fn parse_object(inflated: &[u8], oid: &Oid) -> Result<(ObjectType, Vec<u8>)> {
    let nul = inflated
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| OdbError::corrupt(format!("missing header terminator in {oid}")))?;
    let header = std::str::from_utf8(&inflated[..nul])
        .map_err(|_| OdbError::corrupt(format!("non-utf8 header in {oid}")))?;
    let (type_name, len_str) = header
        .split_once(' ')
        .ok_or_else(|| OdbError::corrupt(format!("malformed header in {oid}")))?;
    let object_type = ObjectType::from_name(type_name)
        .ok_or_else(|| OdbError::corrupt(format!("unknown object type {type_name:?} in {oid}")))?;
    let declared: usize = len_str
        .parse()
        .map_err(|_| OdbError::corrupt(format!("bad length in header of {oid}")))?;
    let payload = &inflated[nul + 1..];
    if payload.len() != declared {
        return Err(OdbError::corrupt(format!(
            "length mismatch in {oid}: header says {declared}, got {}",
            payload.len()
        )));
    }
    Ok((object_type, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = LooseStore::new(temp.path()).unwrap();

        let oid = store.write_object(ObjectType::Blob, b"hello world").unwrap();
        assert!(store.contains(&oid));

        let (object_type, payload) = store.read(&oid).unwrap();
        assert_eq!(object_type, ObjectType::Blob);
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn write_deflated_verifies_hash() {
        let temp = TempDir::new().unwrap();
        let store = LooseStore::new(temp.path()).unwrap();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"blob 3\0abc").unwrap();
        let deflated = encoder.finish().unwrap();

        let good = Oid::compute(ObjectType::Blob, b"abc");
        store.write_deflated(&good, &deflated).unwrap();
        assert_eq!(store.read(&good).unwrap().1, b"abc");

        let bad = Oid::from_bytes([0x42; 20]);
        let err = store.write_deflated(&bad, &deflated).unwrap_err();
        assert!(matches!(err, OdbError::Corrupt { .. }));
        assert!(!store.contains(&bad));
    }

    #[test]
    fn missing_object_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = LooseStore::new(temp.path()).unwrap();
        let err = store.read(&Oid::from_bytes([9; 20])).unwrap_err();
        assert!(matches!(err, OdbError::NotFound { .. }));
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let store = LooseStore::new(temp.path()).unwrap();
        let oid = store.write_object(ObjectType::Blob, b"some payload bytes").unwrap();

        // Chop the stored file in half.
        let path = store.object_path(&oid);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = store.read(&oid).unwrap_err();
        assert!(matches!(err, OdbError::Corrupt { .. }));
    }

    #[test]
    fn iter_oids_finds_everything() {
        let temp = TempDir::new().unwrap();
        let store = LooseStore::new(temp.path()).unwrap();
        let a = store.write_object(ObjectType::Blob, b"a").unwrap();
        let b = store.write_object(ObjectType::Blob, b"b").unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.iter_oids().unwrap(), expected);
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = LooseStore::new(temp.path()).unwrap();
        let oid = store.write_object(ObjectType::Blob, b"gone").unwrap();
        store.remove(&oid).unwrap();
        store.remove(&oid).unwrap();
        assert!(!store.contains(&oid));
    }
}
