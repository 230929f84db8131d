//! Content-addressed blob identity and local blob storage.
//!
//! A [`Digest`] is the `(sha256, size)` pair that identifies a blob on the
//! remote execution wire. The [`ContentStore`] keeps blob bytes on local
//! disk, addressed by digest.

pub mod hash_reader;
mod store;

pub use hash_reader::Sha256VerifyingReader;
pub use store::{ContentStore, StoreError};

use sha2::{Digest as _, Sha256};

/// A sha256 content digest plus the blob size in bytes.
///
/// Two digests are equal iff both the hash and the size match. The
/// all-zero, zero-sized digest is the distinguished "empty" value used for
/// absent content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Digest {
    pub hash: [u8; 32],
    pub size_bytes: u64,
}

impl Digest {
    /// The distinguished empty digest.
    pub const fn empty() -> Self {
        Self {
            hash: [0u8; 32],
            size_bytes: 0,
        }
    }

    /// Hash raw bytes into a digest.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            hash: hasher.finalize().into(),
            size_bytes: data.len() as u64,
        }
    }

    /// Whether this is the distinguished empty digest.
    pub fn is_zero(&self) -> bool {
        self.size_bytes == 0 && self.hash == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Parse a digest from `hex/size` form.
    pub fn from_parts(hash_hex: &str, size_bytes: u64) -> Option<Self> {
        if hash_hex.len() != 64 {
            return None;
        }
        let mut hash = [0u8; 32];
        hex::decode_to_slice(hash_hex, &mut hash).ok()?;
        Some(Self { hash, size_bytes })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.to_hex(), self.size_bytes)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}/{})", &self.to_hex()[..12], self.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_is_distinguished() {
        let d = Digest::empty();
        assert!(d.is_zero());
        assert_ne!(Digest::from_bytes(b""), Digest::empty());
        assert!(!Digest::from_bytes(b"x").is_zero());
    }

    #[test]
    fn equality_needs_both_fields() {
        let a = Digest::from_bytes(b"hello");
        let mut b = a;
        b.size_bytes = 99;
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip() {
        let d = Digest::from_bytes(b"hello world");
        let parsed = Digest::from_parts(&d.to_hex(), d.size_bytes).unwrap();
        assert_eq!(d, parsed);
        assert_eq!(
            d.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
