//! Storage seams of the log.
//!
//! The sequencer is written against two object-safe traits: [`LogStorage`]
//! opens one read-write transaction per tree, and [`LogTreeTx`] exposes the
//! operations a batch needs inside that transaction. [`MemoryLogStorage`]
//! is the in-memory reference backend used throughout the tests.
//!
//! # Transaction model
//!
//! A [`LogTreeTx`] is consumed by [`LogTreeTx::commit`]; dropping an
//! uncommitted transaction rolls it back. Backends must make commits
//! atomic: either every write of the batch becomes visible or none does.
//!
//! # Invariants
//!
//! - [INV-STO-001] Transactions for the same tree are serialized; a lost
//!   race surfaces as [`StorageError::Conflict`], never as interleaved
//!   writes.
//! - [INV-STO-002] At most one signed log root may exist per revision.
//! - [INV-STO-003] Every operation observes the [`OpContext`] and fails
//!   with [`StorageError::Cancelled`] once the context is cancelled.

mod memory;

use std::time::SystemTime;

use thiserror::Error;
use treeline_core::crypto::NodeHash;
use treeline_core::merkle::StorageNodeId;
use treeline_core::types::{LeafEntry, SignedLogRoot};

use crate::context::{Cancelled, OpContext};

pub use memory::MemoryLogStorage;

/// Errors surfaced by log storage backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The tree is not provisioned in this backend.
    #[error("unknown tree: {tree_id}")]
    UnknownTree {
        /// The requested tree ID.
        tree_id: i64,
    },

    /// The tree is already provisioned.
    #[error("tree already exists: {tree_id}")]
    TreeExists {
        /// The conflicting tree ID.
        tree_id: i64,
    },

    /// The transaction lost a race with a concurrent writer and was not
    /// committed.
    #[error("transaction conflict on tree {tree_id}: concurrent commit")]
    Conflict {
        /// The contended tree ID.
        tree_id: i64,
    },

    /// A signed log root already exists at this revision.
    #[error("signed log root already stored at revision {revision}")]
    DuplicateRevision {
        /// The duplicated revision.
        revision: u64,
    },

    /// A sequenced leaf already occupies this index.
    #[error("sequenced leaf already stored at index {leaf_index}")]
    SequencedLeafExists {
        /// The occupied leaf index.
        leaf_index: i64,
    },

    /// The operation context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Backend-specific failure.
    #[error("storage backend failure: {detail}")]
    Backend {
        /// Description of the failure.
        detail: String,
    },
}

impl From<Cancelled> for StorageError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// A Merkle tree node as persisted at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Storage address of the node.
    pub storage_id: StorageNodeId,
    /// Node hash.
    pub hash: NodeHash,
    /// Revision this version of the node was written at.
    pub node_revision: u64,
}

/// Storage capable of opening read-write transactions over log trees.
pub trait LogStorage: Send + Sync {
    /// Opens a read-write transaction scoped to `tree_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTree`] for unprovisioned trees and
    /// [`StorageError::Cancelled`] on a cancelled context.
    fn begin_tree_tx(
        &self,
        ctx: &OpContext,
        tree_id: i64,
    ) -> Result<Box<dyn LogTreeTx>, StorageError>;
}

/// One read-write transaction over a single log tree.
///
/// Method order within a batch matters to backends that stage writes: all
/// reads happen before the first write, matching the sequencer's pipeline.
pub trait LogTreeTx: Send {
    /// Returns the most recent signed log root, or `None` for a log whose
    /// root has never been written (the needs-initialization condition).
    ///
    /// # Errors
    ///
    /// Backend or cancellation failures.
    fn latest_signed_log_root(
        &mut self,
        ctx: &OpContext,
    ) -> Result<Option<SignedLogRoot>, StorageError>;

    /// Reads the identified nodes at the latest revision `<= revision`.
    ///
    /// Nodes that do not exist at that revision are absent from the
    /// result; callers detect this by comparing counts.
    ///
    /// # Errors
    ///
    /// Backend or cancellation failures.
    fn get_merkle_nodes(
        &mut self,
        ctx: &OpContext,
        revision: u64,
        ids: &[StorageNodeId],
    ) -> Result<Vec<Node>, StorageError>;

    /// Produces the next batch of leaves to integrate, up to `limit`.
    ///
    /// For a normal log these are queued entries with queue time at or
    /// before `cutoff`, in FIFO order, removed from the queue by the
    /// commit. For a pre-ordered log these are already-sequenced entries
    /// starting at the current tree size, in index order.
    ///
    /// # Errors
    ///
    /// Backend or cancellation failures.
    fn dequeue_leaves(
        &mut self,
        ctx: &OpContext,
        limit: usize,
        cutoff: SystemTime,
    ) -> Result<Vec<LeafEntry>, StorageError>;

    /// Persists sequence-number assignments for dequeued leaves.
    ///
    /// # Errors
    ///
    /// [`StorageError::SequencedLeafExists`] if an index is already
    /// occupied; backend or cancellation failures.
    fn update_sequenced_leaves(
        &mut self,
        ctx: &OpContext,
        leaves: &[LeafEntry],
    ) -> Result<(), StorageError>;

    /// Returns the revision every write of this transaction lands at.
    ///
    /// # Errors
    ///
    /// Backend or cancellation failures.
    fn write_revision(&mut self, ctx: &OpContext) -> Result<u64, StorageError>;

    /// Stages Merkle node writes.
    ///
    /// # Errors
    ///
    /// Backend or cancellation failures.
    fn set_merkle_nodes(&mut self, ctx: &OpContext, nodes: &[Node]) -> Result<(), StorageError>;

    /// Stages the new signed log root.
    ///
    /// # Errors
    ///
    /// [`StorageError::DuplicateRevision`] when a root already exists at
    /// the encoded revision; backend or cancellation failures.
    fn store_signed_log_root(
        &mut self,
        ctx: &OpContext,
        slr: &SignedLogRoot,
    ) -> Result<(), StorageError>;

    /// Atomically publishes every staged write.
    ///
    /// # Errors
    ///
    /// [`StorageError::Conflict`] when a concurrent transaction committed
    /// first; backend failures. On error nothing was published.
    fn commit(self: Box<Self>, ctx: &OpContext) -> Result<(), StorageError>;
}
