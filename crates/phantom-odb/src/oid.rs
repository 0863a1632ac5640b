//! SHA-1 object identifiers.
//!
//! Equality and ordering are byte-wise on the 20-byte binary form; the
//! 40-hex rendering is only a presentation format.

use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

use crate::{ObjectType, OdbError};

/// A 20-byte SHA-1 object id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Oid([u8; 20]);

impl Oid {
    /// Byte length of the binary form.
    pub const LEN: usize = 20;
    /// Character length of the hex form.
    pub const HEX_LEN: usize = 40;

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses a 40-hex object id.
    pub fn from_hex(hex_str: &str) -> crate::Result<Self> {
        if hex_str.len() != Self::HEX_LEN {
            return Err(OdbError::BadOid {
                input: hex_str.to_string(),
            });
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut bytes).map_err(|_| OdbError::BadOid {
            input: hex_str.to_string(),
        })?;
        Ok(Self(bytes))
    }

    /// Reads a binary OID from a 20-byte slice.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// First byte, used for fan-out bucketing.
    #[inline]
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hashes an object payload under its canonical `"<type> <len>\0"`
    /// header, yielding the id Git would assign it.
    pub fn compute(object_type: ObjectType, payload: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(object_type.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl FromStr for Oid {
    type Err = OdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hex_str = "0123456789abcdef0123456789abcdef01234567";
        let oid = Oid::from_hex(hex_str).unwrap();
        assert_eq!(oid.to_hex(), hex_str);
        assert_eq!(oid.to_string(), hex_str);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Oid::from_hex("deadbeef").is_err());
        assert!(Oid::from_hex(&"g".repeat(40)).is_err());
        assert!(Oid::try_from_slice(&[0u8; 19]).is_none());
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = Oid::from_bytes([0x00; 20]);
        let b = Oid::from_bytes([0x01; 20]);
        let c = Oid::from_bytes([0xff; 20]);
        assert!(a < b && b < c);
    }

    #[test]
    fn compute_matches_git() {
        // `echo -n 'what is up, doc?' | git hash-object --stdin`
        let oid = Oid::compute(ObjectType::Blob, b"what is up, doc?");
        assert_eq!(oid.to_hex(), "bd9dbf5aae1a3862dd1526723246b20206e5fc37");
    }

    #[test]
    fn empty_blob_oid() {
        let oid = Oid::compute(ObjectType::Blob, b"");
        assert_eq!(oid.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }
}
