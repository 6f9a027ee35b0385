//! Hashing primitives for Treecast.
//!
//! Every hash in the protocol is a 32-byte BLAKE3 digest: chunk hashes,
//! interior Merkle nodes, and the padding leaves that round a file up to a
//! power-of-two number of chunks.
//!
//! There is no unsafe code in this module.

use crate::wire::Hash;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash of an interior Merkle node: `H(left || right)`.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut h = Hasher::new();
    h.update(left);
    h.update(right);
    h.finalize()
}

/// Hash of a padding leaf, the digest of zero bytes.
pub fn empty_hash() -> Hash {
    hash(&[])
}

/// Incremental BLAKE3 hasher for data that arrives in pieces.
///
/// # Example
/// ```
/// use treecast_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, treecast_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Hash {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
