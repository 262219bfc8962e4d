//! Log hashing seam and the RFC 6962 instantiation.

use sha2::{Digest, Sha256};

/// A Merkle node or leaf hash.
///
/// The length is fixed per hasher ([`LogHasher::output_len`]).
pub type NodeHash = Vec<u8>;

/// Domain prefix for leaf hashes.
const LEAF_HASH_PREFIX: u8 = 0x00;

/// Domain prefix for internal node hashes.
const NODE_HASH_PREFIX: u8 = 0x01;

/// Hash strategy of a log tree.
///
/// Implementations must be deterministic and domain-separate leaves from
/// internal nodes; nothing else is assumed (in particular, child
/// combination is not treated as associative or commutative).
pub trait LogHasher: Send + Sync {
    /// Length in bytes of every hash this hasher produces.
    fn output_len(&self) -> usize;

    /// Root hash of the empty tree.
    fn empty_root(&self) -> NodeHash;

    /// Hashes a leaf payload.
    fn hash_leaf(&self, leaf: &[u8]) -> NodeHash;

    /// Combines two child hashes into their parent hash.
    fn hash_children(&self, left: &[u8], right: &[u8]) -> NodeHash;
}

/// RFC 6962 SHA-256 log hashing.
///
/// Leaves hash as `SHA-256(0x00 || payload)`, internal nodes as
/// `SHA-256(0x01 || left || right)`, and the empty tree as the SHA-256 of
/// the empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6962Hasher;

impl LogHasher for Rfc6962Hasher {
    fn output_len(&self) -> usize {
        Sha256::output_size()
    }

    fn empty_root(&self) -> NodeHash {
        Sha256::digest([]).to_vec()
    }

    fn hash_leaf(&self, leaf: &[u8]) -> NodeHash {
        let mut h = Sha256::new();
        h.update([LEAF_HASH_PREFIX]);
        h.update(leaf);
        h.finalize().to_vec()
    }

    fn hash_children(&self, left: &[u8], right: &[u8]) -> NodeHash {
        let mut h = Sha256::new();
        h.update([NODE_HASH_PREFIX]);
        h.update(left);
        h.update(right);
        h.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_sha256_of_nothing() {
        let hasher = Rfc6962Hasher;
        // SHA-256("")
        let want = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let got: String = hasher
            .empty_root()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn leaf_and_node_hashing_are_domain_separated() {
        let hasher = Rfc6962Hasher;
        let a = hasher.hash_leaf(b"x");
        let b = hasher.hash_children(b"", b"x");
        assert_ne!(a, b);
        assert_eq!(a.len(), hasher.output_len());
        assert_eq!(b.len(), hasher.output_len());
    }

    #[test]
    fn rfc6962_empty_leaf_vector() {
        // Test vector from RFC 6962 section 2.1: leaf hash of the empty
        // string.
        let hasher = Rfc6962Hasher;
        let want = "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d";
        let got: String = hasher
            .hash_leaf(b"")
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(got, want);
    }
}
