//! Multi-pack-index (`multi-pack-index`) reading.
//!
//! The midx maps OIDs to `(pack, offset)` pairs across every pack it
//! covers, so one binary search replaces probing each `.idx` in turn. Like
//! the idx reader this view is zero-copy over a caller-owned buffer.
//!
//! Chunks we read: `PNAM` (pack names), `OIDF` (fanout), `OIDL` (sorted
//! OIDs), `OOFF` (pack id + offset), `LOFF` (large offsets). Unknown
//! chunks are skipped, as the format requires.

use crate::{OdbError, Oid, Result};

const MIDX_MAGIC: &[u8; 4] = b"MIDX";
const MIDX_VERSION: u8 = 1;
const OID_VERSION_SHA1: u8 = 1;
const MIDX_HEADER_SIZE: usize = 12;
const CHUNK_ENTRY_SIZE: usize = 12;

const CHUNK_PACK_NAMES: u32 = u32::from_be_bytes(*b"PNAM");
const CHUNK_OID_FANOUT: u32 = u32::from_be_bytes(*b"OIDF");
const CHUNK_OID_LOOKUP: u32 = u32::from_be_bytes(*b"OIDL");
const CHUNK_OBJECT_OFFSETS: u32 = u32::from_be_bytes(*b"OOFF");
const CHUNK_LARGE_OFFSETS: u32 = u32::from_be_bytes(*b"LOFF");

const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// A resolved midx hit: which pack, and where inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidxHit {
    /// Index into [`MidxView::pack_names`].
    pub pack_id: u32,
    /// Entry offset within that pack.
    pub offset: u64,
}

/// Zero-copy view over a multi-pack-index file.
#[derive(Debug, Clone)]
pub struct MidxView<'a> {
    pack_count: u32,
    object_count: u32,
    pack_names: Vec<&'a str>,
    fanout: &'a [u8],
    oid_lookup: &'a [u8],
    object_offsets: &'a [u8],
    large_offsets: Option<&'a [u8]>,
}

impl<'a> MidxView<'a> {
    /// Parses a multi-pack-index from raw bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < MIDX_HEADER_SIZE + CHUNK_ENTRY_SIZE + Oid::LEN {
            return Err(OdbError::corrupt("multi-pack-index too small"));
        }
        if &data[0..4] != MIDX_MAGIC {
            return Err(OdbError::corrupt("bad multi-pack-index magic"));
        }
        if data[4] != MIDX_VERSION {
            return Err(OdbError::UnsupportedVersion {
                what: "multi-pack-index",
                version: data[4] as u32,
            });
        }
        if data[5] != OID_VERSION_SHA1 {
            return Err(OdbError::UnsupportedVersion {
                what: "multi-pack-index object id",
                version: data[5] as u32,
            });
        }
        let chunk_count = data[6] as usize;
        let pack_count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        // Chunk table: chunk_count entries plus a terminating row whose id
        // is zero and whose offset marks the end of the last chunk.
        let table_end = MIDX_HEADER_SIZE + (chunk_count + 1) * CHUNK_ENTRY_SIZE;
        if data.len() < table_end {
            return Err(OdbError::corrupt("multi-pack-index chunk table truncated"));
        }

        let mut chunks: Vec<(u32, usize, usize)> = Vec::with_capacity(chunk_count);
        for i in 0..chunk_count {
            let row = MIDX_HEADER_SIZE + i * CHUNK_ENTRY_SIZE;
            let id = u32::from_be_bytes([data[row], data[row + 1], data[row + 2], data[row + 3]]);
            let start = read_u64(&data[row + 4..row + 12]) as usize;
            let next_row = row + CHUNK_ENTRY_SIZE;
            let end = read_u64(&data[next_row + 4..next_row + 12]) as usize;
            if start > end || end > data.len() {
                return Err(OdbError::corrupt("multi-pack-index chunk out of bounds"));
            }
            chunks.push((id, start, end));
        }

        let chunk = |id: u32| -> Option<&'a [u8]> {
            chunks
                .iter()
                .find(|&&(cid, _, _)| cid == id)
                .map(|&(_, start, end)| &data[start..end])
        };

        let fanout = chunk(CHUNK_OID_FANOUT)
            .ok_or_else(|| OdbError::corrupt("multi-pack-index missing OID fanout"))?;
        if fanout.len() != 256 * 4 {
            return Err(OdbError::corrupt("multi-pack-index fanout malformed"));
        }
        let object_count = u32::from_be_bytes([
            fanout[255 * 4],
            fanout[255 * 4 + 1],
            fanout[255 * 4 + 2],
            fanout[255 * 4 + 3],
        ]);

        let oid_lookup = chunk(CHUNK_OID_LOOKUP)
            .ok_or_else(|| OdbError::corrupt("multi-pack-index missing OID lookup"))?;
        if oid_lookup.len() != object_count as usize * Oid::LEN {
            return Err(OdbError::corrupt("multi-pack-index OID lookup malformed"));
        }

        let object_offsets = chunk(CHUNK_OBJECT_OFFSETS)
            .ok_or_else(|| OdbError::corrupt("multi-pack-index missing object offsets"))?;
        if object_offsets.len() != object_count as usize * 8 {
            return Err(OdbError::corrupt("multi-pack-index offsets malformed"));
        }

        let pack_names_raw = chunk(CHUNK_PACK_NAMES)
            .ok_or_else(|| OdbError::corrupt("multi-pack-index missing pack names"))?;
        let mut pack_names = Vec::with_capacity(pack_count as usize);
        for name in pack_names_raw.split(|&b| b == 0) {
            if name.is_empty() {
                continue;
            }
            let name = std::str::from_utf8(name)
                .map_err(|_| OdbError::corrupt("non-utf8 pack name in multi-pack-index"))?;
            pack_names.push(name);
        }
        if pack_names.len() != pack_count as usize {
            return Err(OdbError::corrupt("multi-pack-index pack name count mismatch"));
        }

        Ok(Self {
            pack_count,
            object_count,
            pack_names,
            fanout,
            oid_lookup,
            object_offsets,
            large_offsets: chunk(CHUNK_LARGE_OFFSETS),
        })
    }

    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    #[inline]
    pub fn pack_count(&self) -> u32 {
        self.pack_count
    }

    /// Covered pack names (without directory), sorted as stored.
    pub fn pack_names(&self) -> &[&'a str] {
        &self.pack_names
    }

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

    fn oid_at(&self, idx: u32) -> &'a [u8] {
        let start = idx as usize * Oid::LEN;
        &self.oid_lookup[start..start + Oid::LEN]
    }

    /// Binary search for `oid`, returning the owning pack and offset.
    pub fn lookup(&self, oid: &Oid) -> Result<Option<MidxHit>> {
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
                std::cmp::Ordering::Equal => return Ok(Some(self.hit_at(mid)?)),
            }
        }
        Ok(None)
    }

    fn hit_at(&self, idx: u32) -> Result<MidxHit> {
        let row = idx as usize * 8;
        let pack_id = u32::from_be_bytes([
            self.object_offsets[row],
            self.object_offsets[row + 1],
            self.object_offsets[row + 2],
            self.object_offsets[row + 3],
        ]);
        let raw_offset = u32::from_be_bytes([
            self.object_offsets[row + 4],
            self.object_offsets[row + 5],
            self.object_offsets[row + 6],
            self.object_offsets[row + 7],
        ]);
        if pack_id >= self.pack_count {
            return Err(OdbError::corrupt("multi-pack-index pack id out of range"));
        }

        let offset = if raw_offset & LARGE_OFFSET_FLAG == 0 {
            raw_offset as u64
        } else {
            let slab = self
                .large_offsets
                .ok_or_else(|| OdbError::corrupt("large offset flag without LOFF chunk"))?;
            let large_idx = (raw_offset & !LARGE_OFFSET_FLAG) as usize * 8;
            if large_idx + 8 > slab.len() {
                return Err(OdbError::corrupt("large offset index out of bounds"));
            }
            read_u64(&slab[large_idx..large_idx + 8])
        };

        Ok(MidxHit { pack_id, offset })
    }
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
