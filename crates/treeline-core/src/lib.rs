//! # treeline-core
//!
//! Core building blocks for the treeline verifiable transparency log: the
//! compact-range Merkle accumulator, node addressing, log root types with a
//! canonical binary encoding, and the hasher/signer/clock traits the
//! sequencing layer is written against.
//!
//! ## Features
//!
//! - **Compact ranges**: the minimal set of right-border hashes needed to
//!   extend a Merkle tree and recompute its root
//! - **Node addressing**: compact `(level, index)` coordinates and their
//!   path-prefix storage encoding at a fixed maximum tree depth
//! - **Log roots**: `LogRootV1` with a round-tripping canonical encoding,
//!   plus the signed form published as the log's checkpoint
//! - **Pluggable crypto**: `LogHasher` (RFC 6962 SHA-256 provided) and
//!   `LogRootSigner` (Ed25519 provided)
//! - **Testable time**: all wall-clock reads route through `TimeSource`
//!
//! ## Example
//!
//! ```rust
//! use treeline_core::crypto::{LogHasher, Rfc6962Hasher};
//! use treeline_core::merkle::CompactRange;
//!
//! let hasher = Rfc6962Hasher;
//! let mut range = CompactRange::empty(&hasher);
//! range.append(hasher.hash_leaf(b"entry-0"), None)?;
//! range.append(hasher.hash_leaf(b"entry-1"), None)?;
//! let root = range.root_hash(None);
//! assert_eq!(root.len(), 32);
//! # Ok::<(), treeline_core::merkle::MerkleError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod crypto;
pub mod merkle;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{SystemTimeSource, TimeSource};
    pub use crate::crypto::{LogHasher, LogRootSigner, NodeHash, Rfc6962Hasher};
    pub use crate::merkle::{CompactNodeId, CompactRange, StorageNodeId, MAX_TREE_DEPTH};
    pub use crate::types::{LeafEntry, LogRootV1, SignedLogRoot, TreeDef, TreeType};
}

pub use clock::{SystemTimeSource, TimeSource};
pub use crypto::{LogHasher, LogRootSigner, NodeHash, Rfc6962Hasher};
pub use merkle::{CompactNodeId, CompactRange, StorageNodeId, MAX_TREE_DEPTH};
pub use types::{LeafEntry, LogRootV1, SignedLogRoot, TreeDef, TreeType};
