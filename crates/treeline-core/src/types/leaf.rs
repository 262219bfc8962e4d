//! Leaf entries of the log.

use std::time::SystemTime;

use crate::crypto::NodeHash;

/// One entry of the log: an opaque payload with its Merkle leaf hash and
/// sequencing state.
///
/// The leaf hash is assigned when the entry is submitted (it is the
/// hasher's `hash_leaf` over the payload); the sequencer assigns or
/// validates `leaf_index` and stamps `integrate_timestamp` when the entry
/// is promoted into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// Opaque entry payload.
    pub payload: Vec<u8>,
    /// Hash of the payload under the log's hasher.
    pub merkle_leaf_hash: NodeHash,
    /// Position in the log. Non-negative once sequenced; carried as a
    /// signed integer so index arithmetic overflow is detectable.
    pub leaf_index: i64,
    /// When the entry was submitted. Only feeds merge-delay telemetry;
    /// entries queued by older writers may not carry one.
    pub queue_timestamp: Option<SystemTime>,
    /// When the sequencer integrated the entry into the tree.
    pub integrate_timestamp: Option<SystemTime>,
}

impl LeafEntry {
    /// Creates an unsequenced leaf.
    #[must_use]
    pub const fn new(payload: Vec<u8>, merkle_leaf_hash: NodeHash) -> Self {
        Self {
            payload,
            merkle_leaf_hash,
            leaf_index: -1,
            queue_timestamp: None,
            integrate_timestamp: None,
        }
    }

    /// Creates an unsequenced leaf with its submission time recorded.
    #[must_use]
    pub const fn queued_at(
        payload: Vec<u8>,
        merkle_leaf_hash: NodeHash,
        queue_timestamp: SystemTime,
    ) -> Self {
        Self {
            payload,
            merkle_leaf_hash,
            leaf_index: -1,
            queue_timestamp: Some(queue_timestamp),
            integrate_timestamp: None,
        }
    }
}
