//! Pack index (`.idx`) v2 reading and writing.
//!
//! The reader is zero-copy: all table slices reference the caller's byte
//! buffer (normally a memory map), which must outlive the view. Lookup is
//! O(log n): the fanout table narrows to a bucket, then a binary search
//! over the sorted OID column finds the entry.
//!
//! The writer emits the same layout for packs this system indexes itself
//! after a download.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::{OdbError, Oid, Result};

/// Pack index magic bytes for the v2 format.
const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
/// The only supported index version.
const IDX_VERSION: u32 = 2;
/// Header size: 4-byte magic + 4-byte version.
const IDX_HEADER_SIZE: usize = 8;
/// Fanout table entries.
const FANOUT_ENTRIES: usize = 256;
/// Fanout table size in bytes.
const FANOUT_SIZE: usize = FANOUT_ENTRIES * 4;
/// MSB flag selecting the large offset table.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// Zero-copy view over a pack index v2 file.
///
/// Layout: magic, version, fanout (256 × u32 BE cumulative counts), sorted
/// OID table, CRC table, 4-byte offset table (MSB set selects the 8-byte
/// large offset table), pack checksum, index checksum.
#[derive(Debug, Clone, Copy)]
pub struct IdxView<'a> {
    object_count: u32,
    fanout: &'a [u8],
    oid_table: &'a [u8],
    offset_table: &'a [u8],
    large_offsets: Option<&'a [u8]>,
}

impl<'a> IdxView<'a> {
    /// Parses a pack index v2 file from raw bytes.
    ///
    /// Table bounds and fanout monotonicity are validated; checksums are
    /// not re-verified on every open.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let min_size = IDX_HEADER_SIZE + FANOUT_SIZE + 2 * Oid::LEN;
        if data.len() < min_size {
            return Err(OdbError::corrupt("pack index too small"));
        }
        if data[0..4] != IDX_MAGIC {
            return Err(OdbError::corrupt("bad pack index magic"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != IDX_VERSION {
            return Err(OdbError::UnsupportedVersion {
                what: "pack index",
                version,
            });
        }

        let fanout = &data[IDX_HEADER_SIZE..IDX_HEADER_SIZE + FANOUT_SIZE];
        let object_count = validate_fanout(fanout)?;

        let n = object_count as usize;
        let oid_table_start = IDX_HEADER_SIZE + FANOUT_SIZE;
        let oid_table_end = oid_table_start + n * Oid::LEN;
        let crc_table_end = oid_table_end + n * 4;
        let offset_table_end = crc_table_end + n * 4;
        let checksums = 2 * Oid::LEN;

        if data.len() < offset_table_end + checksums {
            return Err(OdbError::corrupt("pack index truncated"));
        }

        let large_start = offset_table_end;
        let large_end = data.len() - checksums;
        let large_offsets = if large_end > large_start {
            let slab = &data[large_start..large_end];
            if slab.len() % 8 != 0 {
                return Err(OdbError::corrupt("large offset table misaligned"));
            }
            Some(slab)
        } else {
            None
        };

        Ok(Self {
            object_count,
            fanout,
            oid_table: &data[oid_table_start..oid_table_end],
            offset_table: &data[crc_table_end..offset_table_end],
            large_offsets,
        })
    }

    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Cumulative count of objects whose first byte is ≤ `first_byte`.
    #[inline]
    fn fanout_at(&self, first_byte: u8) -> u32 {
        let off = first_byte as usize * 4;
        u32::from_be_bytes([
            self.fanout[off],
            self.fanout[off + 1],
            self.fanout[off + 2],
            self.fanout[off + 3],
        ])
    }

    /// OID at position `idx` in the sorted table.
    #[inline]
    pub fn oid_at(&self, idx: u32) -> &'a [u8] {
        let start = idx as usize * Oid::LEN;
        &self.oid_table[start..start + Oid::LEN]
    }

    /// Pack offset of the entry at position `idx`, following large-offset
    /// indirection when the MSB is set.
    pub fn offset_at(&self, idx: u32) -> Result<u64> {
        let start = idx as usize * 4;
        let raw = u32::from_be_bytes([
            self.offset_table[start],
            self.offset_table[start + 1],
            self.offset_table[start + 2],
            self.offset_table[start + 3],
        ]);
        if raw & LARGE_OFFSET_FLAG == 0 {
            return Ok(raw as u64);
        }
        let large_idx = (raw & !LARGE_OFFSET_FLAG) as usize;
        let slab = self
            .large_offsets
            .ok_or_else(|| OdbError::corrupt("large offset flag without table"))?;
        let start = large_idx * 8;
        if start + 8 > slab.len() {
            return Err(OdbError::corrupt("large offset index out of bounds"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&slab[start..start + 8]);
        Ok(u64::from_be_bytes(buf))
    }

    /// Binary search for `oid`, returning its pack offset.
    pub fn lookup(&self, oid: &Oid) -> Result<Option<u64>> {
        match self.position_of(oid) {
            Some(idx) => Ok(Some(self.offset_at(idx)?)),
            None => Ok(None),
        }
    }

    /// Position of `oid` in the sorted table, if present.
    pub fn position_of(&self, oid: &Oid) -> Option<u32> {
        let first = oid.first_byte();
        let hi = self.fanout_at(first);
        let lo = if first == 0 { 0 } else { self.fanout_at(first - 1) };

        let target = oid.as_bytes().as_slice();
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_at(mid).cmp(target) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Iterates `(oid_bytes, position)` pairs in sorted order.
    pub fn iter_oids(&self) -> impl Iterator<Item = (&'a [u8], u32)> + '_ {
        let count = self.object_count;
        let table = self.oid_table;
        (0..count).map(move |i| {
            let start = i as usize * Oid::LEN;
            (&table[start..start + Oid::LEN], i)
        })
    }
}

fn validate_fanout(fanout: &[u8]) -> Result<u32> {
    let mut prev = 0u32;
    for i in 0..FANOUT_ENTRIES {
        let off = i * 4;
        let val = u32::from_be_bytes([
            fanout[off],
            fanout[off + 1],
            fanout[off + 2],
            fanout[off + 3],
        ]);
        if val < prev {
            return Err(OdbError::corrupt("fanout not monotonic"));
        }
        prev = val;
    }
    Ok(prev)
}

/// One record handed to [`write_idx`].
#[derive(Debug, Clone, Copy)]
pub struct IdxEntry {
    pub oid: Oid,
    pub crc32: u32,
    pub offset: u64,
}

/// Writes a pack index v2 file covering `entries`.
///
/// Entries are sorted internally; `pack_checksum` is the trailing hash of
/// the `.pack` this index covers. The index's own trailing checksum is
/// computed over everything that precedes it.
pub fn write_idx(path: &Path, entries: &[IdxEntry], pack_checksum: &[u8; 20]) -> Result<()> {
    let mut sorted: Vec<IdxEntry> = entries.to_vec();
    sorted.sort_by(|a, b| a.oid.cmp(&b.oid));

    let mut out = Vec::with_capacity(IDX_HEADER_SIZE + FANOUT_SIZE + sorted.len() * 28 + 40);
    out.extend_from_slice(&IDX_MAGIC);
    out.extend_from_slice(&IDX_VERSION.to_be_bytes());

    let mut counts = [0u32; FANOUT_ENTRIES];
    for entry in &sorted {
        counts[entry.oid.first_byte() as usize] += 1;
    }
    let mut running = 0u32;
    for count in counts {
        running += count;
        out.extend_from_slice(&running.to_be_bytes());
    }

    for entry in &sorted {
        out.extend_from_slice(entry.oid.as_bytes());
    }
    for entry in &sorted {
        out.extend_from_slice(&entry.crc32.to_be_bytes());
    }

    let mut large_offsets: Vec<u64> = Vec::new();
    for entry in &sorted {
        if entry.offset < LARGE_OFFSET_FLAG as u64 {
            out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        } else {
            let idx = large_offsets.len() as u32;
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | idx).to_be_bytes());
            large_offsets.push(entry.offset);
        }
    }
    for offset in large_offsets {
        out.extend_from_slice(&offset.to_be_bytes());
    }

    out.extend_from_slice(pack_checksum);
    let mut hasher = Sha1::new();
    hasher.update(&out);
    let idx_checksum: [u8; 20] = hasher.finalize().into();
    out.extend_from_slice(&idx_checksum);

    let mut file = File::create(path)?;
    file.write_all(&out)?;
    file.sync_all()?;
    Ok(())
}
