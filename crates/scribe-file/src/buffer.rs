// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Immutable byte buffers with stable content hashes.

use std::sync::Arc;

use crate::FileError;

/// A 32-byte BLAKE3 content hash.
///
/// Thin newtype over `[u8; 32]`; the `Display` impl renders lowercase hex
/// for logging and error messages. The hash is content-only — two buffers
/// with identical bytes are the same blob.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// View the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl core::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// An immutable byte buffer bound to its BLAKE3 content hash.
///
/// Cloning is cheap (the bytes are shared). Storage paths bind to buffers by
/// value: two buffers compare equal exactly when their bytes (and therefore
/// hashes) are equal.
#[derive(Clone)]
pub struct FrozenBuffer {
    bytes: Arc<[u8]>,
    hash: ContentHash,
}

impl FrozenBuffer {
    /// Freezes a byte sequence.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let bytes: Arc<[u8]> = Arc::from(bytes.as_ref());
        let hash = ContentHash(*blake3::hash(&bytes).as_bytes());
        Self { bytes, hash }
    }

    /// Freezes a UTF-8 string.
    pub fn from_string(s: impl AsRef<str>) -> Self {
        Self::from_bytes(s.as_ref().as_bytes())
    }

    /// Freezes the ASCII-decimal rendering of `value`.
    ///
    /// This is the stored form of revision counters.
    pub fn from_decimal(value: u64) -> Self {
        Self::from_string(value.to_string())
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` for the empty buffer.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The content hash.
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    /// Decodes the bytes as UTF-8.
    ///
    /// # Errors
    ///
    /// `BadData` when the bytes are not valid UTF-8.
    pub fn as_utf8(&self) -> Result<&str, FileError> {
        core::str::from_utf8(&self.bytes)
            .map_err(|_| FileError::BadData("buffer is not valid UTF-8".into()))
    }

    /// Decodes the bytes as an ASCII-decimal integer.
    ///
    /// # Errors
    ///
    /// `BadData` when the bytes are not a decimal rendering of a `u64`.
    pub fn as_decimal(&self) -> Result<u64, FileError> {
        self.as_utf8()?
            .parse()
            .map_err(|_| FileError::BadData("buffer is not an ASCII decimal".into()))
    }
}

impl PartialEq for FrozenBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for FrozenBuffer {}

impl core::fmt::Debug for FrozenBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FrozenBuffer({} bytes, {})", self.bytes.len(), self.hash)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── 1. equal bytes, equal hash ──────────────────────────────────────

    #[test]
    fn equal_bytes_equal_hash() {
        let a = FrozenBuffer::from_string("hello");
        let b = FrozenBuffer::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        let c = FrozenBuffer::from_string("hellO");
        assert_ne!(a.hash(), c.hash());
    }

    // ── 2. decimal round-trip ───────────────────────────────────────────

    #[test]
    fn decimal_round_trip() {
        let buf = FrozenBuffer::from_decimal(37);
        assert_eq!(buf.as_bytes(), b"37");
        assert_eq!(buf.as_decimal().unwrap(), 37);
        assert!(FrozenBuffer::from_string("x37").as_decimal().is_err());
    }

    // ── 3. hex rendering is stable ──────────────────────────────────────

    #[test]
    fn hash_hex_is_64_chars() {
        let hex = FrozenBuffer::from_string("x").hash().to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
