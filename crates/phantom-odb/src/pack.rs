//! Pack file decoding.
//!
//! Parses pack entry headers, inflates zlib payloads with hard output
//! caps, and applies Git's delta encoding (OFS_DELTA and REF_DELTA) to
//! reconstruct objects. REF_DELTA bases that live outside the pack are
//! resolved through a caller-supplied lookup so thin packs still decode.
//!
//! Offsets handed to [`PackView::entry_header_at`] normally come from an
//! `.idx` or multi-pack-index lookup.

use flate2::{Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};

use crate::{ObjectType, OdbError, Oid, Result};

/// Pack header size: magic(4) + version(4) + object count(4).
const PACK_HEADER_SIZE: usize = 12;
/// Safety bound on a single entry header.
const MAX_HEADER_BYTES: usize = 32;
/// Hard cap on one inflated object (512 MiB).
pub const MAX_OBJECT_SIZE: usize = 512 * 1024 * 1024;
/// Delta chains deeper than this are treated as corruption.
const MAX_DELTA_DEPTH: u32 = 64;
/// Inflate scratch buffer size.
const INFLATE_BUF_SIZE: usize = 64 * 1024;

/// Parsed pack entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Self-contained object.
    NonDelta(ObjectType),
    /// Base lives at a backward offset in the same pack.
    OfsDelta { base_offset: u64 },
    /// Base is identified by OID (possibly outside this pack).
    RefDelta { base_oid: Oid },
}

/// Entry header parsed from a pack file. `data_start` is where the zlib
/// stream begins; for delta entries `size` is the delta payload size, not
/// the reconstructed object size.
#[derive(Debug, Clone, Copy)]
pub struct EntryHeader {
    pub size: u64,
    pub data_start: usize,
    pub kind: EntryKind,
}

/// Zero-copy view over pack file bytes. The trailing SHA-1 is excluded
/// from the data region so it can never be misparsed as object data.
#[derive(Debug)]
pub struct PackView<'a> {
    bytes: &'a [u8],
    data_end: usize,
    object_count: u32,
}

impl<'a> PackView<'a> {
    /// Parses and validates the pack header.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < PACK_HEADER_SIZE + Oid::LEN {
            return Err(OdbError::corrupt("pack too small"));
        }
        if &bytes[0..4] != b"PACK" {
            return Err(OdbError::corrupt("bad pack signature"));
        }
        let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != 2 && version != 3 {
            return Err(OdbError::UnsupportedVersion {
                what: "pack",
                version,
            });
        }
        let object_count = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Ok(Self {
            bytes,
            data_end: bytes.len() - Oid::LEN,
            object_count,
        })
    }

    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// The trailing SHA-1 over the pack's contents.
    pub fn trailer_checksum(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.bytes[self.data_end..]);
        out
    }

    /// Recomputes the trailer hash and compares it to the stored one.
    pub fn verify_trailer(&self) -> Result<()> {
        let mut hasher = Sha1::new();
        hasher.update(&self.bytes[..self.data_end]);
        let actual: [u8; 20] = hasher.finalize().into();
        if actual != self.trailer_checksum() {
            return Err(OdbError::corrupt("pack trailer checksum mismatch"));
        }
        Ok(())
    }

    /// Raw bytes of the on-disk entry, for CRC computation.
    pub fn entry_bytes(&self, start: usize, end: usize) -> &'a [u8] {
        &self.bytes[start..end.min(self.data_end)]
    }

    #[inline]
    fn byte_at(&self, pos: usize) -> Result<u8> {
        if pos >= self.data_end {
            return Err(OdbError::corrupt("truncated pack data"));
        }
        Ok(self.bytes[pos])
    }

    /// Parses the entry header at `offset`.
    ///
    /// For delta entries the returned `data_start` points past the base
    /// reference so callers can begin inflating immediately.
    pub fn entry_header_at(&self, offset: u64) -> Result<EntryHeader> {
        let mut pos = offset as usize;
        if pos < PACK_HEADER_SIZE || pos >= self.data_end {
            return Err(OdbError::corrupt(format!("pack offset {offset} out of range")));
        }
        let start = pos;

        let first = self.byte_at(pos)?;
        pos += 1;
        let obj_type = (first >> 4) & 0x07;
        let mut size = (first & 0x0f) as u64;
        let mut shift = 4u32;
        let mut byte = first;
        while byte & 0x80 != 0 {
            if pos - start >= MAX_HEADER_BYTES || shift > 57 {
                return Err(OdbError::corrupt("pack entry header too long"));
            }
            byte = self.byte_at(pos)?;
            pos += 1;
            size |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
        }

        let kind = match obj_type {
            1 => EntryKind::NonDelta(ObjectType::Commit),
            2 => EntryKind::NonDelta(ObjectType::Tree),
            3 => EntryKind::NonDelta(ObjectType::Blob),
            4 => EntryKind::NonDelta(ObjectType::Tag),
            6 => {
                let (base_offset, new_pos) = self.parse_ofs_base(offset, pos)?;
                pos = new_pos;
                EntryKind::OfsDelta { base_offset }
            }
            7 => {
                if pos + Oid::LEN > self.data_end {
                    return Err(OdbError::corrupt("truncated REF_DELTA base"));
                }
                let base_oid = Oid::try_from_slice(&self.bytes[pos..pos + Oid::LEN])
                    .ok_or_else(|| OdbError::corrupt("bad REF_DELTA base oid"))?;
                pos += Oid::LEN;
                EntryKind::RefDelta { base_oid }
            }
            other => return Err(OdbError::corrupt(format!("bad pack object type {other}"))),
        };

        Ok(EntryHeader {
            size,
            data_start: pos,
            kind,
        })
    }

    /// OFS_DELTA base offsets are encoded as a big-endian base-128 varint
    /// with an off-by-one per continuation byte; see `gitformat-pack(5)`.
    fn parse_ofs_base(&self, delta_offset: u64, mut pos: usize) -> Result<(u64, usize)> {
        let mut c = self.byte_at(pos)?;
        pos += 1;
        let mut val = (c & 0x7f) as u64;
        let mut bytes_read = 1;
        while c & 0x80 != 0 {
            if bytes_read >= 10 {
                return Err(OdbError::corrupt("OFS_DELTA varint too long"));
            }
            c = self.byte_at(pos)?;
            pos += 1;
            bytes_read += 1;
            val = (val + 1) << 7;
            val |= (c & 0x7f) as u64;
        }
        if val == 0 || val > delta_offset {
            return Err(OdbError::corrupt("OFS_DELTA base underflow"));
        }
        Ok((delta_offset - val, pos))
    }

    /// Inflates the zlib stream at `data_start` expecting exactly
    /// `expected` output bytes. Returns `(payload, input_consumed)`.
    pub fn inflate_at(&self, data_start: usize, expected: usize) -> Result<(Vec<u8>, usize)> {
        if expected > MAX_OBJECT_SIZE {
            return Err(OdbError::corrupt("pack entry exceeds object size cap"));
        }
        let input = &self.bytes[data_start.min(self.data_end)..self.data_end];
        let mut out = Vec::with_capacity(expected);
        let mut decomp = Decompress::new(true);
        let mut buf = vec![0u8; INFLATE_BUF_SIZE];
        let mut in_pos = 0usize;

        loop {
            let before_in = decomp.total_in() as usize;
            let before_out = decomp.total_out() as usize;
            let status = decomp
                .decompress(&input[in_pos..], &mut buf, FlushDecompress::None)
                .map_err(|_| OdbError::corrupt("bad zlib stream in pack"))?;
            let consumed = decomp.total_in() as usize - before_in;
            let produced = decomp.total_out() as usize - before_out;
            in_pos += consumed;

            if produced > 0 {
                if out.len() + produced > expected {
                    return Err(OdbError::corrupt("pack entry inflated past declared size"));
                }
                out.extend_from_slice(&buf[..produced]);
            }

            match status {
                Status::StreamEnd => {
                    if out.len() != expected {
                        return Err(OdbError::corrupt("pack entry short inflate"));
                    }
                    return Ok((out, in_pos));
                }
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 && in_pos >= input.len() {
                        return Err(OdbError::corrupt("truncated zlib stream in pack"));
                    }
                }
            }
        }
    }

    /// Fully decodes the object at `offset`, following delta chains.
    ///
    /// `resolve_ref` supplies REF_DELTA bases that are not in this pack.
    pub fn decode_at(
        &self,
        offset: u64,
        resolve_ref: &dyn Fn(&Oid) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<(ObjectType, Vec<u8>)> {
        self.decode_at_depth(offset, resolve_ref, 0)
    }

    fn decode_at_depth(
        &self,
        offset: u64,
        resolve_ref: &dyn Fn(&Oid) -> Option<(ObjectType, Vec<u8>)>,
        depth: u32,
    ) -> Result<(ObjectType, Vec<u8>)> {
        if depth > MAX_DELTA_DEPTH {
            return Err(OdbError::corrupt("delta chain too deep"));
        }
        let header = self.entry_header_at(offset)?;
        let (payload, _) = self.inflate_at(header.data_start, header.size as usize)?;

        match header.kind {
            EntryKind::NonDelta(object_type) => Ok((object_type, payload)),
            EntryKind::OfsDelta { base_offset } => {
                let (object_type, base) =
                    self.decode_at_depth(base_offset, resolve_ref, depth + 1)?;
                let result = apply_delta(&base, &payload, MAX_OBJECT_SIZE)?;
                Ok((object_type, result))
            }
            EntryKind::RefDelta { base_oid } => {
                let (object_type, base) = resolve_ref(&base_oid).ok_or(OdbError::NotFound {
                    oid: base_oid,
                })?;
                let result = apply_delta(&base, &payload, MAX_OBJECT_SIZE)?;
                Ok((object_type, result))
            }
        }
    }

    /// Walks every entry sequentially, yielding `(offset, header,
    /// inflated payload, end offset)`. Used when indexing a freshly
    /// downloaded pack.
    pub fn walk_entries(&self) -> Result<Vec<RawEntry>> {
        let mut entries = Vec::with_capacity(self.object_count as usize);
        let mut offset = PACK_HEADER_SIZE as u64;
        for _ in 0..self.object_count {
            let header = self.entry_header_at(offset)?;
            let (payload, consumed) = self.inflate_at(header.data_start, header.size as usize)?;
            let end = header.data_start + consumed;
            entries.push(RawEntry {
                offset,
                kind: header.kind,
                payload,
                end: end as u64,
            });
            offset = end as u64;
        }
        if offset as usize != self.data_end {
            return Err(OdbError::corrupt("pack has trailing garbage"));
        }
        Ok(entries)
    }
}

/// One sequentially-walked pack entry; `payload` is the inflated bytes
/// (delta instructions for delta entries).
#[derive(Debug)]
pub struct RawEntry {
    pub offset: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
    pub end: u64,
}

/// Reads a Git delta varint (LEB128) as u64.
fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut shift = 0u32;
    let mut result = 0u64;
    for _ in 0..10 {
        if *pos >= data.len() {
            return Err(OdbError::corrupt("delta truncated"));
        }
        let b = data[*pos];
        *pos += 1;
        result |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            break;
        }
    }
    Err(OdbError::corrupt("delta varint overflow"))
}

/// Applies a Git delta buffer to `base`, with a hard output cap against
/// corrupt deltas. Both the declared base size and result size are
/// validated.
pub fn apply_delta(base: &[u8], delta: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let base_size = read_varint(delta, &mut pos)? as usize;
    let result_size = read_varint(delta, &mut pos)? as usize;
    if base_size != base.len() {
        return Err(OdbError::corrupt("delta base size mismatch"));
    }
    if result_size > max_out {
        return Err(OdbError::corrupt("delta result exceeds output cap"));
    }

    let mut out = Vec::with_capacity(result_size);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let (off, size) = decode_copy_params(delta, &mut pos, cmd)?;
            let end = off
                .checked_add(size)
                .filter(|&e| e <= base.len())
                .ok_or_else(|| OdbError::corrupt("delta copy out of range"))?;
            if out.len() + size > result_size {
                return Err(OdbError::corrupt("delta output overrun"));
            }
            out.extend_from_slice(&base[off..end]);
        } else if cmd != 0 {
            let size = cmd as usize;
            if pos + size > delta.len() {
                return Err(OdbError::corrupt("delta insert truncated"));
            }
            if out.len() + size > result_size {
                return Err(OdbError::corrupt("delta output overrun"));
            }
            out.extend_from_slice(&delta[pos..pos + size]);
            pos += size;
        } else {
            return Err(OdbError::corrupt("delta command zero"));
        }
    }

    if out.len() != result_size {
        return Err(OdbError::corrupt("delta result size mismatch"));
    }
    Ok(out)
}

/// Decodes copy parameters for a delta copy instruction. Low command bits
/// select offset bytes, high bits select size bytes; a zero size encodes
/// 0x10000.
fn decode_copy_params(delta: &[u8], pos: &mut usize, cmd: u8) -> Result<(usize, usize)> {
    let mut next = |present: bool| -> Result<usize> {
        if !present {
            return Ok(0);
        }
        if *pos >= delta.len() {
            return Err(OdbError::corrupt("delta copy params truncated"));
        }
        let b = delta[*pos] as usize;
        *pos += 1;
        Ok(b)
    };

    let mut off = next(cmd & 0x01 != 0)?;
    off |= next(cmd & 0x02 != 0)? << 8;
    off |= next(cmd & 0x04 != 0)? << 16;
    off |= next(cmd & 0x08 != 0)? << 24;

    let mut size = next(cmd & 0x10 != 0)?;
    size |= next(cmd & 0x20 != 0)? << 8;
    size |= next(cmd & 0x40 != 0)? << 16;
    if size == 0 {
        size = 0x10000;
    }
    Ok((off, size))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builds small packs in memory for tests across this crate.

    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use sha1::{Digest, Sha1};

    use crate::{ObjectType, Oid};

    pub enum TestEntry {
        Plain(ObjectType, Vec<u8>),
        OfsDelta { base_index: usize, delta: Vec<u8> },
        RefDelta { base_oid: Oid, delta: Vec<u8> },
    }

    fn push_entry_header(out: &mut Vec<u8>, obj_type: u8, size: usize) {
        let mut size = size as u64;
        let mut byte = (obj_type << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size > 0 {
            out.push(byte | 0x80);
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        out.push(byte);
    }

    fn push_ofs(out: &mut Vec<u8>, mut distance: u64) {
        let mut stack = vec![(distance & 0x7f) as u8];
        distance >>= 7;
        while distance > 0 {
            distance -= 1;
            stack.push((distance & 0x7f) as u8 | 0x80);
            distance >>= 7;
        }
        while let Some(b) = stack.pop() {
            out.push(b);
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Builds a pack containing `entries`, returning the bytes and each
    /// entry's offset.
    pub fn build_pack(entries: &[TestEntry]) -> (Vec<u8>, Vec<u64>) {
        let mut out = Vec::new();
        out.extend_from_slice(b"PACK");
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_be_bytes());

        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            let offset = out.len() as u64;
            offsets.push(offset);
            match entry {
                TestEntry::Plain(object_type, payload) => {
                    let code = match object_type {
                        ObjectType::Commit => 1,
                        ObjectType::Tree => 2,
                        ObjectType::Blob => 3,
                        ObjectType::Tag => 4,
                    };
                    push_entry_header(&mut out, code, payload.len());
                    out.extend_from_slice(&deflate(payload));
                }
                TestEntry::OfsDelta { base_index, delta } => {
                    push_entry_header(&mut out, 6, delta.len());
                    push_ofs(&mut out, offset - offsets[*base_index]);
                    out.extend_from_slice(&deflate(delta));
                }
                TestEntry::RefDelta { base_oid, delta } => {
                    push_entry_header(&mut out, 7, delta.len());
                    out.extend_from_slice(base_oid.as_bytes());
                    out.extend_from_slice(&deflate(delta));
                }
            }
        }

        let mut hasher = Sha1::new();
        hasher.update(&out);
        let checksum: [u8; 20] = hasher.finalize().into();
        out.extend_from_slice(&checksum);
        (out, offsets)
    }

    /// Encodes a delta that replaces the whole base with `replacement`.
    pub fn replace_delta(base_len: usize, replacement: &[u8]) -> Vec<u8> {
        let mut delta = Vec::new();
        push_delta_varint(&mut delta, base_len as u64);
        push_delta_varint(&mut delta, replacement.len() as u64);
        for chunk in replacement.chunks(0x7f) {
            delta.push(chunk.len() as u8);
            delta.extend_from_slice(chunk);
        }
        delta
    }

    /// Encodes a delta that copies `base[..copy_len]` then inserts `tail`.
    pub fn copy_then_insert_delta(base_len: usize, copy_len: usize, tail: &[u8]) -> Vec<u8> {
        let mut delta = Vec::new();
        push_delta_varint(&mut delta, base_len as u64);
        push_delta_varint(&mut delta, (copy_len + tail.len()) as u64);
        // Copy command: offset 0 implicit, one size byte.
        delta.push(0x80 | 0x10);
        delta.push(copy_len as u8);
        delta.push(tail.len() as u8);
        delta.extend_from_slice(tail);
        delta
    }

    fn push_delta_varint(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn decode_plain_entry() {
        let (pack, offsets) =
            build_pack(&[TestEntry::Plain(ObjectType::Blob, b"hello".to_vec())]);
        let view = PackView::parse(&pack).unwrap();
        view.verify_trailer().unwrap();

        let (object_type, payload) = view.decode_at(offsets[0], &|_| None).unwrap();
        assert_eq!(object_type, ObjectType::Blob);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn decode_ofs_delta_chain() {
        let base = b"the quick brown fox".to_vec();
        let delta = copy_then_insert_delta(base.len(), 9, b" jumps");
        let (pack, offsets) = build_pack(&[
            TestEntry::Plain(ObjectType::Blob, base),
            TestEntry::OfsDelta {
                base_index: 0,
                delta,
            },
        ]);
        let view = PackView::parse(&pack).unwrap();

        let (object_type, payload) = view.decode_at(offsets[1], &|_| None).unwrap();
        assert_eq!(object_type, ObjectType::Blob);
        assert_eq!(payload, b"the quick jumps");
    }

    #[test]
    fn decode_ref_delta_with_external_base() {
        let base = b"external base".to_vec();
        let base_oid = Oid::compute(ObjectType::Blob, &base);
        let delta = replace_delta(base.len(), b"rebuilt");
        let (pack, offsets) = build_pack(&[TestEntry::RefDelta { base_oid, delta }]);
        let view = PackView::parse(&pack).unwrap();

        let resolved = view
            .decode_at(offsets[0], &|oid| {
                (*oid == base_oid).then(|| (ObjectType::Blob, base.clone()))
            })
            .unwrap();
        assert_eq!(resolved, (ObjectType::Blob, b"rebuilt".to_vec()));

        let missing = view.decode_at(offsets[0], &|_| None);
        assert!(matches!(missing, Err(OdbError::NotFound { .. })));
    }

    #[test]
    fn walk_entries_visits_all() {
        let (pack, offsets) = build_pack(&[
            TestEntry::Plain(ObjectType::Blob, b"one".to_vec()),
            TestEntry::Plain(ObjectType::Tree, b"".to_vec()),
        ]);
        let view = PackView::parse(&pack).unwrap();

        let entries = view.walk_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, offsets[0]);
        assert_eq!(entries[1].offset, offsets[1]);
        assert_eq!(entries[0].payload, b"one");
    }

    #[test]
    fn corrupt_trailer_detected() {
        let (mut pack, _) = build_pack(&[TestEntry::Plain(ObjectType::Blob, b"x".to_vec())]);
        let len = pack.len();
        pack[len - 1] ^= 0xff;
        let view = PackView::parse(&pack).unwrap();
        assert!(matches!(
            view.verify_trailer(),
            Err(OdbError::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_signature_rejected() {
        let (mut pack, _) = build_pack(&[TestEntry::Plain(ObjectType::Blob, b"x".to_vec())]);
        pack[0] = b'K';
        assert!(matches!(
            PackView::parse(&pack),
            Err(OdbError::Corrupt { .. })
        ));
    }

    #[test]
    fn apply_delta_validates_sizes() {
        let base = b"abc";
        let mut delta = replace_delta(base.len(), b"xyz");
        // Claim the base is larger than it is.
        delta[0] = 9;
        assert!(matches!(
            apply_delta(base, &delta, 1024),
            Err(OdbError::Corrupt { .. })
        ));
    }
}
