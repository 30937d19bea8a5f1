//! SHA-256 digests, the 20-byte store digest, and their printable encodings.
//!
//! Store path names embed a base-32 rendering of a SHA-256 digest XOR-folded
//! to 20 bytes. The alphabet and digit order are load-bearing: every store
//! built by this engine must reproduce the same path names bit-exactly.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use strata_error::{Result, StrataError};

/// Size of a full SHA-256 digest.
pub const HASH_SIZE: usize = 32;

/// Size of the folded digest embedded in store path names.
pub const STORE_DIGEST_SIZE: usize = 20;

/// Base-32 alphabet used for store path digests. Omits `e`, `o`, `u`, `t`.
const BASE32_CHARS: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// A full SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sha256Hash([u8; HASH_SIZE]);

impl Sha256Hash {
    /// Digest a byte slice.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Wrap a finished digest.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lowercase hex rendering.
    pub fn parse_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| StrataError::CorruptHashEntry {
            path: Default::default(),
            entry: s.to_owned(),
        })?;
        let bytes: [u8; HASH_SIZE] =
            bytes
                .try_into()
                .map_err(|_| StrataError::CorruptHashEntry {
                    path: Default::default(),
                    entry: s.to_owned(),
                })?;
        Ok(Self(bytes))
    }

    /// XOR-fold the digest down to the 20-byte store digest.
    pub fn compress(&self) -> StoreDigest {
        let mut out = [0u8; STORE_DIGEST_SIZE];
        for (i, b) in self.0.iter().enumerate() {
            out[i % STORE_DIGEST_SIZE] ^= b;
        }
        StoreDigest(out)
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Hash({})", self.to_hex())
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The 20-byte digest embedded in store path names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreDigest([u8; STORE_DIGEST_SIZE]);

impl StoreDigest {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; STORE_DIGEST_SIZE] {
        &self.0
    }

    /// Base-32 rendering: 32 digits, most significant first, over 5-bit
    /// little-endian groups of the digest bytes.
    pub fn to_base32(&self) -> String {
        let len = (STORE_DIGEST_SIZE * 8 - 1) / 5 + 1;
        let mut s = String::with_capacity(len);
        for n in (0..len).rev() {
            let b = n * 5;
            let i = b / 8;
            let j = b % 8;
            let lo = self.0[i] >> j;
            let hi = if i >= STORE_DIGEST_SIZE - 1 {
                0
            } else {
                self.0[i + 1] << (8 - j)
            };
            s.push(BASE32_CHARS[((lo | hi) & 0x1f) as usize] as char);
        }
        s
    }
}

impl fmt::Debug for StoreDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreDigest({})", self.to_base32())
    }
}

impl fmt::Display for StoreDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let h = Sha256Hash::digest(b"hello\n");
        let parsed = Sha256Hash::parse_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn parse_rejects_short_hex() {
        assert!(Sha256Hash::parse_hex("abcd").is_err());
        assert!(Sha256Hash::parse_hex("zz").is_err());
    }

    #[test]
    fn compress_folds_tail_bytes() {
        let h = Sha256Hash::digest(b"x");
        let folded = h.compress();
        let raw = h.as_bytes();
        for i in 0..STORE_DIGEST_SIZE {
            let mut expected = raw[i];
            if i < HASH_SIZE - STORE_DIGEST_SIZE {
                expected ^= raw[i + STORE_DIGEST_SIZE];
            }
            assert_eq!(folded.as_bytes()[i], expected);
        }
    }

    #[test]
    fn base32_has_fixed_length_and_charset() {
        let s = Sha256Hash::digest(b"hello\n").compress().to_base32();
        assert_eq!(s.len(), 32);
        assert!(s.bytes().all(|c| BASE32_CHARS.contains(&c)));
    }

    #[test]
    fn base32_digit_order_is_stable() {
        // All-zero digest renders as all '0'; a single low bit lands in the
        // last digit, pinning the most-significant-first ordering.
        let zero = StoreDigest([0u8; STORE_DIGEST_SIZE]);
        assert_eq!(zero.to_base32(), "0".repeat(32));

        let mut one = [0u8; STORE_DIGEST_SIZE];
        one[0] = 1;
        assert_eq!(StoreDigest(one).to_base32().pop(), Some('1'));
    }
}
