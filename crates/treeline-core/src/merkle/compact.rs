//! Compact range: the right-border Merkle accumulator.

// The only panic is on a broken internal invariant (border hash count is
// kept equal to the set-bit count of `end` by every constructor and
// mutation).
#![allow(clippy::missing_panics_doc)]

use thiserror::Error;

use super::node_id::CompactNodeId;
use crate::crypto::{LogHasher, NodeHash};

/// Largest tree size the log can reach.
///
/// Leaf indices are signed 64-bit integers upstream, so appends stop one
/// short of `2^63`.
pub const MAX_TREE_SIZE: u64 = 1 << 63;

/// Visitor invoked with each internal node materialized by a range
/// operation.
pub type NodeVisitor<'v> = &'v mut dyn FnMut(CompactNodeId, &NodeHash);

/// Errors from Merkle range and node-addressing operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// Node level exceeds the maximum tree depth.
    #[error("node level {level} exceeds maximum tree depth {max}")]
    LevelOutOfRange {
        /// The offending level.
        level: u32,
        /// The maximum supported depth.
        max: u32,
    },

    /// Node index does not fit at the given level.
    #[error("node index {index} out of range at level {level}")]
    IndexOutOfRange {
        /// Level of the node.
        level: u32,
        /// The offending index.
        index: u64,
    },

    /// Border hash count does not match the tree size.
    #[error("tree size {tree_size} needs {want} border hashes, got {got}")]
    HashCountMismatch {
        /// Tree size the range was built for.
        tree_size: u64,
        /// Required hash count (`tree_size.count_ones()`).
        want: usize,
        /// Provided hash count.
        got: usize,
    },

    /// The tree is at capacity and cannot take another leaf.
    #[error("tree is full at {size} leaves")]
    TreeFull {
        /// Current tree size.
        size: u64,
    },
}

/// Returns the IDs of the nodes whose hashes form the compact range of a
/// tree with `tree_size` leaves.
///
/// One node per set bit of `tree_size`, ordered from the highest set bit to
/// the lowest, which is the order [`CompactRange::from_hashes`] expects its
/// hashes in. Each node is the root of a maximal perfect subtree, packed
/// left to right.
#[must_use]
pub fn range_nodes_for_prefix(tree_size: u64) -> Vec<CompactNodeId> {
    let mut ids = Vec::with_capacity(tree_size.count_ones() as usize);
    let mut covered: u64 = 0;
    for level in (0..u64::BITS).rev() {
        if tree_size & (1 << level) != 0 {
            ids.push(CompactNodeId::new(level, covered >> level));
            covered += 1 << level;
        }
    }
    ids
}

/// Accumulator over the right border of an append-only Merkle tree.
///
/// Holds one hash per set bit of the current size, from the highest set bit
/// to the lowest. That is exactly the state needed to append further leaves
/// and to compute the root, without touching any other part of the tree.
///
/// Hash combination is delegated to the injected [`LogHasher`]; no
/// associativity or commutativity is assumed.
pub struct CompactRange<'h> {
    hasher: &'h dyn LogHasher,
    end: u64,
    // One border hash per set bit of `end`, highest set bit first.
    hashes: Vec<NodeHash>,
}

impl<'h> CompactRange<'h> {
    /// Creates an empty range at offset 0.
    #[must_use]
    pub fn empty(hasher: &'h dyn LogHasher) -> Self {
        Self {
            hasher,
            end: 0,
            hashes: Vec::new(),
        }
    }

    /// Reconstructs a range over `[0, tree_size)` from its border hashes.
    ///
    /// `hashes` must contain `tree_size.count_ones()` entries ordered from
    /// the highest set bit of `tree_size` to the lowest, matching
    /// [`range_nodes_for_prefix`].
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::HashCountMismatch`] when the hash count does
    /// not match the tree size.
    pub fn from_hashes(
        hasher: &'h dyn LogHasher,
        tree_size: u64,
        hashes: Vec<NodeHash>,
    ) -> Result<Self, MerkleError> {
        let want = tree_size.count_ones() as usize;
        if hashes.len() != want {
            return Err(MerkleError::HashCountMismatch {
                tree_size,
                want,
                got: hashes.len(),
            });
        }
        Ok(Self {
            hasher,
            end: tree_size,
            hashes,
        })
    }

    /// Returns the number of leaves accumulated so far.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Appends one leaf hash to the range.
    ///
    /// Performs every pair-merge the new leaf completes, collapsing the two
    /// rightmost border hashes at equal height one level up at a time, and
    /// reports each completed internal node to `visit`. Amortized O(1),
    /// worst case O(log n).
    ///
    /// The leaf node itself is not reported; callers that persist leaves do
    /// so directly.
    ///
    /// # Errors
    ///
    /// Returns [`MerkleError::TreeFull`] once the tree holds
    /// [`MAX_TREE_SIZE`] leaves.
    pub fn append(
        &mut self,
        leaf_hash: NodeHash,
        mut visit: Option<NodeVisitor<'_>>,
    ) -> Result<(), MerkleError> {
        if self.end >= MAX_TREE_SIZE {
            return Err(MerkleError::TreeFull { size: self.end });
        }
        let mut hash = leaf_hash;
        let mut level: u32 = 0;
        let mut bits = self.end;
        while bits & 1 == 1 {
            // One border hash per set bit of `end`; the trailing set bits
            // are exactly the levels merged here.
            let left = self
                .hashes
                .pop()
                .expect("border hash present for each set bit of end");
            hash = self.hasher.hash_children(&left, &hash);
            bits >>= 1;
            level += 1;
            if let Some(v) = visit.as_deref_mut() {
                v(CompactNodeId::new(level, self.end >> level), &hash);
            }
        }
        self.hashes.push(hash);
        self.end += 1;
        Ok(())
    }

    /// Computes the root hash of the tree over all accumulated leaves.
    ///
    /// Folds the border hashes right to left. Every intermediate value is
    /// an ephemeral node: a right-border internal node above an incomplete
    /// subtree, not aligned to a power-of-two boundary. Each one is
    /// reported to `visit` so callers can persist them alongside the
    /// perfectly aligned nodes.
    ///
    /// Returns the hasher's empty-root constant for an empty range.
    #[must_use]
    pub fn root_hash(&self, mut visit: Option<NodeVisitor<'_>>) -> NodeHash {
        let Some((last, rest)) = self.hashes.split_last() else {
            return self.hasher.empty_root();
        };
        let ids = range_nodes_for_prefix(self.end);
        let mut hash = last.clone();
        for (i, left) in rest.iter().enumerate().rev() {
            hash = self.hasher.hash_children(left, &hash);
            if let Some(v) = visit.as_deref_mut() {
                let id = ids[i];
                v(CompactNodeId::new(id.level + 1, id.index >> 1), &hash);
            }
        }
        hash
    }
}

impl std::fmt::Debug for CompactRange<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactRange")
            .field("end", &self.end)
            .field("hashes", &self.hashes.len())
            .finish()
    }
}
