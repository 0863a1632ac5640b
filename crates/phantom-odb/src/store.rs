//! The combined object store: loose tier + packed tier + alternates.
//!
//! Pack state is held as an immutable snapshot behind an `Arc`; rescans
//! after a pack write or maintenance swap the snapshot so readers never
//! observe a half-loaded pack list.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use crate::idx::{self, IdxEntry, IdxView};
use crate::loose::LooseStore;
use crate::midx::MidxView;
use crate::pack::{EntryKind, PackView};
use crate::{ObjectType, OdbError, Oid, Result};

/// File name of the multi-pack-index inside the pack directory.
pub const MIDX_FILE_NAME: &str = "multi-pack-index";

/// One object recorded while indexing a downloaded pack.
#[derive(Debug, Clone, Copy)]
pub struct PackedObject {
    pub oid: Oid,
    pub object_type: ObjectType,
    pub size: u64,
}

struct LoadedPack {
    /// File stem, e.g. `pack-1234abcd`.
    stem: String,
    idx: Mmap,
    pack: Mmap,
}

/// Immutable view of the packed tier at one instant.
struct PackSet {
    packs: Vec<LoadedPack>,
    midx: Option<Mmap>,
    /// midx pack-id → index into `packs`.
    midx_pack_map: Vec<usize>,
}

impl PackSet {
    fn empty() -> Self {
        Self {
            packs: Vec::new(),
            midx: None,
            midx_pack_map: Vec::new(),
        }
    }

    /// Finds `(pack index, entry offset)` for an OID, preferring the
    /// multi-pack-index when one is loaded.
    fn find(&self, oid: &Oid) -> Result<Option<(usize, u64)>> {
        if let Some(midx_data) = &self.midx {
            let midx = MidxView::parse(midx_data)?;
            if let Some(hit) = midx.lookup(oid)? {
                if let Some(&pack_idx) = self.midx_pack_map.get(hit.pack_id as usize) {
                    return Ok(Some((pack_idx, hit.offset)));
                }
                return Err(OdbError::corrupt("multi-pack-index names unknown pack"));
            }
        }
        for (i, pack) in self.packs.iter().enumerate() {
            let view = IdxView::parse(&pack.idx)?;
            if let Some(offset) = view.lookup(oid)? {
                return Ok(Some((i, offset)));
            }
        }
        Ok(None)
    }

    fn contains(&self, oid: &Oid) -> bool {
        matches!(self.find(oid), Ok(Some(_)))
    }
}

/// Git object store rooted at an object directory (normally the shared
/// cache the enlistment's `.git/objects` delegates to via alternates).
pub struct ObjectStore {
    loose: LooseStore,
    pack_dir: PathBuf,
    packs: RwLock<Arc<PackSet>>,
}

impl ObjectStore {
    /// Opens (creating if needed) an object store at `objects_root`.
    pub fn open<P: AsRef<Path>>(objects_root: P) -> Result<Self> {
        let objects_root = objects_root.as_ref();
        let pack_dir = objects_root.join("pack");
        fs::create_dir_all(&pack_dir)?;
        let store = Self {
            loose: LooseStore::new(objects_root)?,
            pack_dir,
            packs: RwLock::new(Arc::new(PackSet::empty())),
        };
        store.refresh_packs()?;
        Ok(store)
    }

    pub fn loose(&self) -> &LooseStore {
        &self.loose
    }

    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    /// O(1) for the loose tier, O(log n) through the pack indexes.
    pub fn has_object(&self, oid: &Oid) -> bool {
        self.loose.contains(oid) || self.packs.read().clone().contains(oid)
    }

    /// Reads an object from either tier, resolving delta chains.
    pub fn read_object(&self, oid: &Oid) -> Result<(ObjectType, Vec<u8>)> {
        if self.loose.contains(oid) {
            return self.loose.read(oid);
        }
        let set = self.packs.read().clone();
        self.read_packed(&set, oid)
    }

    fn read_packed(&self, set: &PackSet, oid: &Oid) -> Result<(ObjectType, Vec<u8>)> {
        let Some((pack_idx, offset)) = set.find(oid)? else {
            return Err(OdbError::NotFound { oid: *oid });
        };
        let pack = &set.packs[pack_idx];
        let view = PackView::parse(&pack.pack)?;
        // REF_DELTA bases may live in another pack or the loose tier.
        view.decode_at(offset, &|base_oid| {
            if self.loose.contains(base_oid) {
                return self.loose.read(base_oid).ok();
            }
            self.read_packed(set, base_oid).ok()
        })
    }

    /// Stores an already-deflated loose object under `oid`, returning
    /// the object's type and payload size.
    pub fn write_loose(&self, oid: &Oid, deflated: &[u8]) -> Result<(ObjectType, u64)> {
        self.loose.write_deflated(oid, deflated)
    }

    /// Paths of every `.idx` currently in the pack directory.
    pub fn iter_pack_indexes(&self) -> Result<Vec<PathBuf>> {
        let mut indexes = Vec::new();
        for entry in fs::read_dir(&self.pack_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "idx") {
                indexes.push(path);
            }
        }
        indexes.sort();
        Ok(indexes)
    }

    /// Persists and indexes a pack downloaded from the object service.
    ///
    /// The pack trailer is verified, every entry is decoded and hashed,
    /// and a v2 `.idx` plus a `.keep` marker are written alongside the
    /// `.pack`. Returns the objects the pack contained.
    pub fn write_pack(&self, pack_bytes: &[u8]) -> Result<Vec<PackedObject>> {
        let view = PackView::parse(pack_bytes)?;
        view.verify_trailer()?;
        let raw_entries = view.walk_entries()?;

        // Resolve delta chains to concrete objects. OFS bases always
        // precede their deltas; REF bases may sit later in the pack or in
        // the existing store, so iterate until a pass makes no progress.
        let mut resolved: HashMap<u64, (ObjectType, Vec<u8>)> = HashMap::new();
        let mut by_oid: HashMap<Oid, u64> = HashMap::new();
        let mut pending: Vec<&crate::pack::RawEntry> = raw_entries.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut still_pending = Vec::new();
            for entry in pending {
                let outcome = match &entry.kind {
                    EntryKind::NonDelta(object_type) => {
                        Some((*object_type, entry.payload.clone()))
                    }
                    EntryKind::OfsDelta { base_offset } => {
                        resolved.get(base_offset).map(|(object_type, base)| {
                            crate::pack::apply_delta(base, &entry.payload, crate::pack::MAX_OBJECT_SIZE)
                                .map(|data| (*object_type, data))
                        }).transpose()?
                    }
                    EntryKind::RefDelta { base_oid } => {
                        let base = by_oid
                            .get(base_oid)
                            .and_then(|offset| resolved.get(offset))
                            .cloned()
                            .or_else(|| self.read_object(base_oid).ok());
                        base.map(|(object_type, base)| {
                            crate::pack::apply_delta(&base, &entry.payload, crate::pack::MAX_OBJECT_SIZE)
                                .map(|data| (object_type, data))
                        }).transpose()?
                    }
                };
                match outcome {
                    Some((object_type, data)) => {
                        let oid = Oid::compute(object_type, &data);
                        by_oid.insert(oid, entry.offset);
                        resolved.insert(entry.offset, (object_type, data));
                    }
                    None => still_pending.push(entry),
                }
            }
            if still_pending.len() == before {
                return Err(OdbError::corrupt("unresolvable delta bases in pack"));
            }
            pending = still_pending;
        }

        let mut idx_entries = Vec::with_capacity(raw_entries.len());
        let mut objects = Vec::with_capacity(raw_entries.len());
        for entry in &raw_entries {
            let (object_type, data) = &resolved[&entry.offset];
            let oid = Oid::compute(*object_type, data);
            let crc32 = crc32fast::hash(view.entry_bytes(entry.offset as usize, entry.end as usize));
            idx_entries.push(IdxEntry {
                oid,
                crc32,
                offset: entry.offset,
            });
            objects.push(PackedObject {
                oid,
                object_type: *object_type,
                size: data.len() as u64,
            });
        }

        let checksum = view.trailer_checksum();
        let stem = format!("pack-{}", hex::encode(checksum));
        let pack_path = self.pack_dir.join(format!("{stem}.pack"));
        let idx_path = self.pack_dir.join(format!("{stem}.idx"));
        let keep_path = self.pack_dir.join(format!("{stem}.keep"));

        self.write_atomic(&pack_path, pack_bytes)?;
        idx::write_idx(&idx_path, &idx_entries, &checksum)?;
        self.write_atomic(&keep_path, b"phantom prefetch\n")?;
        debug!(pack = %stem, objects = objects.len(), "indexed downloaded pack");

        self.refresh_packs()?;
        Ok(objects)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = path.with_extension(format!("tmp{suffix:08x}"));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            if path.exists() {
                return Ok(());
            }
            return Err(OdbError::Io(e));
        }
        Ok(())
    }

    /// Rescans the pack directory and publishes a new snapshot.
    ///
    /// Packs whose `.pack` or `.idx` half is missing are skipped (stale
    /// halves are maintenance's problem), as is an unreadable midx.
    pub fn refresh_packs(&self) -> Result<()> {
        let mut packs = Vec::new();
        for entry in fs::read_dir(&self.pack_dir)? {
            let idx_path = entry?.path();
            if !idx_path.extension().is_some_and(|ext| ext == "idx") {
                continue;
            }
            let pack_path = idx_path.with_extension("pack");
            if !pack_path.exists() {
                continue;
            }
            let Some(stem) = idx_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let idx_file = File::open(&idx_path)?;
            let pack_file = File::open(&pack_path)?;
            // Safety: packs are written atomically and never truncated in
            // place; maintenance replaces files by rename.
            let idx = unsafe { Mmap::map(&idx_file) }.map_err(OdbError::Io)?;
            let pack = unsafe { Mmap::map(&pack_file) }.map_err(OdbError::Io)?;
            packs.push(LoadedPack {
                stem: stem.to_string(),
                idx,
                pack,
            });
        }
        packs.sort_by(|a, b| a.stem.cmp(&b.stem));

        let midx_path = self.pack_dir.join(MIDX_FILE_NAME);
        let mut midx = None;
        let mut midx_pack_map = Vec::new();
        if midx_path.exists() {
            let file = File::open(&midx_path)?;
            let data = unsafe { Mmap::map(&file) }.map_err(OdbError::Io)?;
            if let Some(mapped) = map_midx_packs(&data, &packs) {
                midx_pack_map = mapped;
                midx = Some(data);
            }
        }

        let set = PackSet {
            packs,
            midx,
            midx_pack_map,
        };
        *self.packs.write() = Arc::new(set);
        Ok(())
    }
}

/// Maps midx pack ids onto loaded packs by file stem. Returns `None`
/// (and logs) when the midx is unreadable or names a pack we did not
/// load; readers then fall back to per-pack indexes.
fn map_midx_packs(data: &[u8], packs: &[LoadedPack]) -> Option<Vec<usize>> {
    let parsed = match MidxView::parse(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "unreadable multi-pack-index, ignoring it");
            return None;
        }
    };
    let mut mapped = Vec::with_capacity(parsed.pack_names().len());
    for name in parsed.pack_names() {
        let stem = name
            .strip_suffix(".idx")
            .or_else(|| name.strip_suffix(".pack"))
            .unwrap_or(name);
        match packs.iter().position(|p| p.stem == stem) {
            Some(i) => mapped.push(i),
            None => {
                warn!(pack = %name, "multi-pack-index references missing pack, ignoring it");
                return None;
            }
        }
    }
    Some(mapped)
}

/// Ensures `info/alternates` under a Git object directory points at the
/// shared object root. Returns true when the file was (re)written.
pub fn ensure_alternates(git_objects_dir: &Path, shared_root: &Path) -> Result<bool> {
    let info_dir = git_objects_dir.join("info");
    fs::create_dir_all(&info_dir)?;
    let alternates = info_dir.join("alternates");
    let wanted = shared_root.to_string_lossy();

    if let Ok(existing) = fs::read_to_string(&alternates) {
        if existing.lines().any(|line| line == wanted) {
            return Ok(false);
        }
    }
    let mut content = String::new();
    content.push_str(&wanted);
    content.push('\n');

    let suffix: u32 = rand::thread_rng().gen();
    let tmp = info_dir.join(format!("alternates.tmp{suffix:08x}"));
    let mut file = File::create(&tmp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &alternates)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::test_support::{build_pack, copy_then_insert_delta, TestEntry};
    use tempfile::TempDir;

    fn store() -> (TempDir, ObjectStore) {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::open(temp.path().join("objects")).unwrap();
        (temp, store)
    }

    #[test]
    fn loose_objects_visible_through_store() {
        let (_temp, store) = store();
        let oid = store.loose().write_object(ObjectType::Blob, b"abc").unwrap();
        assert!(store.has_object(&oid));
        assert_eq!(store.read_object(&oid).unwrap().1, b"abc");
    }

    #[test]
    fn write_pack_indexes_and_serves_objects() {
        let (_temp, store) = store();
        let base = b"a phantom base object".to_vec();
        let delta = copy_then_insert_delta(base.len(), 9, b" extended");
        let (pack, _) = build_pack(&[
            TestEntry::Plain(ObjectType::Blob, base.clone()),
            TestEntry::OfsDelta {
                base_index: 0,
                delta,
            },
        ]);

        let objects = store.write_pack(&pack).unwrap();
        assert_eq!(objects.len(), 2);

        // Both the base and the reconstructed delta must be readable.
        for object in &objects {
            assert!(store.has_object(&object.oid));
            let (object_type, data) = store.read_object(&object.oid).unwrap();
            assert_eq!(object_type, object.object_type);
            assert_eq!(data.len() as u64, object.size);
        }

        // A .keep marker covers the pack we produced.
        let keeps: Vec<_> = fs::read_dir(store.pack_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "keep"))
            .collect();
        assert_eq!(keeps.len(), 1);
    }

    #[test]
    fn write_pack_rejects_corrupt_trailer() {
        let (_temp, store) = store();
        let (mut pack, _) = build_pack(&[TestEntry::Plain(ObjectType::Blob, b"x".to_vec())]);
        let len = pack.len();
        pack[len - 5] ^= 0x55;
        assert!(matches!(
            store.write_pack(&pack),
            Err(OdbError::Corrupt { .. })
        ));
        assert!(store.iter_pack_indexes().unwrap().is_empty());
    }

    #[test]
    fn ref_delta_resolves_against_loose_tier() {
        let (_temp, store) = store();
        let base = b"loose base".to_vec();
        let base_oid = store.loose().write_object(ObjectType::Blob, &base).unwrap();
        let delta = crate::pack::test_support::replace_delta(base.len(), b"patched");
        let (pack, _) = build_pack(&[TestEntry::RefDelta { base_oid, delta }]);

        let objects = store.write_pack(&pack).unwrap();
        let (_, data) = store.read_object(&objects[0].oid).unwrap();
        assert_eq!(data, b"patched");
    }

    #[test]
    fn missing_object_is_not_found() {
        let (_temp, store) = store();
        let err = store.read_object(&Oid::from_bytes([7; 20])).unwrap_err();
        assert!(matches!(err, OdbError::NotFound { .. }));
    }

    #[test]
    fn iter_pack_indexes_lists_idx_files() {
        let (_temp, store) = store();
        let (pack, _) = build_pack(&[TestEntry::Plain(ObjectType::Blob, b"p".to_vec())]);
        store.write_pack(&pack).unwrap();
        let indexes = store.iter_pack_indexes().unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].to_string_lossy().ends_with(".idx"));
    }

    #[test]
    fn alternates_written_once() {
        let temp = TempDir::new().unwrap();
        let git_objects = temp.path().join("repo/.git/objects");
        let shared = temp.path().join("cache/gitObjects");
        fs::create_dir_all(&shared).unwrap();

        assert!(ensure_alternates(&git_objects, &shared).unwrap());
        assert!(!ensure_alternates(&git_objects, &shared).unwrap());

        let content = fs::read_to_string(git_objects.join("info/alternates")).unwrap();
        assert_eq!(content.trim(), shared.to_string_lossy());
    }
}
