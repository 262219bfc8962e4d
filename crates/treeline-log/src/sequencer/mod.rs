//! The log sequencer: promotes queued leaves into the Merkle tree.
//!
//! [`Sequencer::integrate_batch`] runs one batch inside a storage
//! transaction: it loads the latest signed root, rebuilds the compact
//! range from the persisted border nodes (self-checking the stored root
//! hash on the way), fetches and prepares the batch, folds the new leaves
//! into the range while collecting every touched node, persists nodes and
//! sequence assignments, and signs and stores the next root. The commit is
//! atomic; a failed batch leaves no trace.
//!
//! # Invariants
//!
//! After every committed batch:
//!
//! - [INV-SEQ-001] Leaf indices are contiguous from 0 with no gaps or
//!   duplicates, and each batch starts at the previous tree size.
//! - [INV-SEQ-002] The revision advances by exactly one.
//! - [INV-SEQ-003] The root timestamp strictly advances.
//! - [INV-SEQ-004] The stored root hash equals the Merkle root over all
//!   `tree_size` leaf hashes under the configured hasher; the empty tree
//!   carries the hasher's empty-root constant.
//! - [INV-SEQ-005] The nodes written at the new revision are exactly the
//!   border nodes the batch created or updated, ephemeral nodes included.
//!
//! Within one tree, concurrent sequencers are serialized by storage; the
//! write-revision precheck turns a lost race into a clean error instead of
//! silent corruption.

mod metrics;
mod task;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};
use treeline_core::clock::{seconds_since, unix_nanos, TimeSource};
use treeline_core::crypto::{LogHasher, LogRootSigner, NodeHash, SignerError};
use treeline_core::merkle::{
    range_nodes_for_prefix, CompactNodeId, CompactRange, MerkleError, StorageNodeId,
};
use treeline_core::types::{LeafEntry, LogRootError, LogRootV1, SignedLogRoot, TreeDef};

use self::metrics::SequencerMetrics;
use self::task::SequencingTask;
use crate::context::OpContext;
use crate::monitoring::MetricFactory;
use crate::quota::{replenish_sequenced, QuotaManager};
use crate::storage::{LogStorage, LogTreeTx, Node, StorageError};

/// Errors surfaced by sequencer operations.
///
/// Everything except [`SequencerError::TreeNeedsInit`] is terminal for
/// the batch; the transaction is rolled back and no partial state is
/// visible. The mismatch variants indicate either data corruption or a
/// concurrent writer that storage failed to serialize.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SequencerError {
    /// The log has no signed root yet; run [`Sequencer::prepare_log`].
    #[error("tree {tree_id} has no signed root; log needs initialization")]
    TreeNeedsInit {
        /// The uninitialized tree.
        tree_id: i64,
    },

    /// The log already has a signed root.
    #[error("tree {tree_id} already initialized at revision {revision}")]
    AlreadyInitialized {
        /// The initialized tree.
        tree_id: i64,
        /// Revision of the existing root.
        revision: u64,
    },

    /// A storage call failed.
    #[error("tree {tree_id}: storage failure")]
    Storage {
        /// The affected tree.
        tree_id: i64,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The stored signed root does not decode.
    #[error("tree {tree_id}: latest log root does not decode")]
    RootDecode {
        /// The affected tree.
        tree_id: i64,
        /// Underlying decode error.
        #[source]
        source: LogRootError,
    },

    /// The signer failed to produce a signed root.
    #[error("tree {tree_id}: signer failure")]
    Signer {
        /// The affected tree.
        tree_id: i64,
        /// Underlying signer error.
        #[source]
        source: SignerError,
    },

    /// A Merkle-range or node-addressing operation failed.
    #[error("tree {tree_id}: merkle failure")]
    Merkle {
        /// The affected tree.
        tree_id: i64,
        /// Underlying Merkle error.
        #[source]
        source: MerkleError,
    },

    /// Storage returned fewer border nodes than requested.
    #[error("tree {tree_id}: read {got} of {want} border nodes at revision {revision}")]
    NodeCountMismatch {
        /// The affected tree.
        tree_id: i64,
        /// Revision the nodes were requested at.
        revision: u64,
        /// Requested node count.
        want: usize,
        /// Returned node count.
        got: usize,
    },

    /// Storage returned a node under a different ID than requested.
    #[error("tree {tree_id}: border node {position} id mismatch: got {got}, want {want}")]
    NodeIdMismatch {
        /// The affected tree.
        tree_id: i64,
        /// Position within the requested ID list.
        position: usize,
        /// ID attached to the returned node.
        got: StorageNodeId,
        /// ID that was requested.
        want: StorageNodeId,
    },

    /// The rebuilt compact range does not reproduce the stored root hash.
    #[error("tree {tree_id}: rebuilt root hash does not match stored root at size {tree_size}")]
    RootHashMismatch {
        /// The affected tree.
        tree_id: i64,
        /// Tree size the range was rebuilt at.
        tree_size: u64,
    },

    /// Storage granted a write revision other than the successor of the
    /// current root's revision.
    #[error("tree {tree_id}: got write revision {got}, want {want}")]
    RevisionMismatch {
        /// The affected tree.
        tree_id: i64,
        /// Granted revision.
        got: u64,
        /// Expected revision.
        want: u64,
    },

    /// A fetched leaf does not carry the expected next index.
    #[error("tree {tree_id}: got leaf index {got}, want {want}")]
    LeafIndexMismatch {
        /// The affected tree.
        tree_id: i64,
        /// Index carried by the leaf.
        got: i64,
        /// Index the tree assigns next.
        want: u64,
    },

    /// Index assignment left the signed 64-bit range.
    #[error("tree {tree_id}: leaf index overflow at tree size {tree_size} + {offset}")]
    LeafIndexOverflow {
        /// The affected tree.
        tree_id: i64,
        /// Tree size when the batch started.
        tree_size: u64,
        /// Offset of the overflowing leaf within the batch.
        offset: usize,
    },

    /// The new root would not carry a strictly newer timestamp.
    #[error(
        "tree {tree_id}: refusing to sign root with timestamp {new_nanos} not after {old_nanos}"
    )]
    TimestampNotAdvancing {
        /// The affected tree.
        tree_id: i64,
        /// Candidate timestamp, nanoseconds since epoch.
        new_nanos: u64,
        /// Previous root timestamp, nanoseconds since epoch.
        old_nanos: u64,
    },
}

/// Outcome of one integration attempt, before quota replenishment.
struct BatchOutcome {
    num_leaves: usize,
    new_root: Option<LogRootV1>,
}

/// Integrates batches of queued or pre-sequenced leaves into a log tree.
///
/// Leaves are assigned unique consecutive sequence numbers as they are
/// processed. There is no strong ordering guarantee, but entries are
/// generally integrated in order of submission.
///
/// All collaborators are shared references with process lifetime; one
/// sequencer may serve many trees, and multiple sequencers may run
/// concurrently (storage serializes committed work per tree).
pub struct Sequencer {
    hasher: Arc<dyn LogHasher>,
    clock: Arc<dyn TimeSource>,
    storage: Arc<dyn LogStorage>,
    signer: Arc<dyn LogRootSigner>,
    quota_manager: Arc<dyn QuotaManager>,
    metrics: &'static SequencerMetrics,
}

impl Sequencer {
    /// Creates a sequencer from its collaborators.
    ///
    /// The first construction in the process initializes the sequencer
    /// metric set from `metric_factory`; later constructions share it.
    #[must_use]
    pub fn new(
        hasher: Arc<dyn LogHasher>,
        clock: Arc<dyn TimeSource>,
        storage: Arc<dyn LogStorage>,
        signer: Arc<dyn LogRootSigner>,
        quota_manager: Arc<dyn QuotaManager>,
        metric_factory: &dyn MetricFactory,
    ) -> Self {
        Self {
            hasher,
            clock,
            storage,
            signer,
            quota_manager,
            metrics: SequencerMetrics::global(metric_factory),
        }
    }

    /// Writes the first signed root of a fresh log: size 0, revision 0,
    /// the hasher's empty root, and the current time.
    ///
    /// This is the recovery path for [`SequencerError::TreeNeedsInit`]:
    /// initialize, then retry the batch.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::AlreadyInitialized`] when a signed root
    /// exists, and storage/signer failures otherwise.
    pub fn prepare_log(
        &self,
        ctx: &OpContext,
        tree: &TreeDef,
    ) -> Result<SignedLogRoot, SequencerError> {
        let tree_id = tree.tree_id;
        let mut tx = self
            .storage
            .begin_tree_tx(ctx, tree_id)
            .map_err(|source| SequencerError::Storage { tree_id, source })?;

        if let Some(existing) = tx
            .latest_signed_log_root(ctx)
            .map_err(|source| SequencerError::Storage { tree_id, source })?
        {
            let root = LogRootV1::from_canonical_bytes(&existing.log_root)
                .map_err(|source| SequencerError::RootDecode { tree_id, source })?;
            return Err(SequencerError::AlreadyInitialized {
                tree_id,
                revision: root.revision,
            });
        }

        let root = LogRootV1 {
            tree_size: 0,
            root_hash: self.hasher.empty_root(),
            timestamp_nanos: unix_nanos(self.clock.now()),
            revision: 0,
            metadata: Vec::new(),
        };
        let slr = self
            .signer
            .sign_log_root(&root)
            .map_err(|source| SequencerError::Signer { tree_id, source })?;
        tx.store_signed_log_root(ctx, &slr)
            .map_err(|source| SequencerError::Storage { tree_id, source })?;
        tx.commit(ctx)
            .map_err(|source| SequencerError::Storage { tree_id, source })?;

        info!(tree_id, "initialized log with empty root");
        Ok(slr)
    }

    /// Takes one batch of queued or pre-sequenced leaves and integrates
    /// them into the tree, publishing a new signed root.
    ///
    /// `limit` caps the batch size. `guard_window` excludes leaves queued
    /// within that interval before now, reducing the risk of integrating
    /// entries out of their intended arrival order. With an empty batch, a
    /// new root is still produced if the current one is older than
    /// `max_root_duration` (zero disables forced re-signing).
    ///
    /// Returns the number of leaves integrated; 0 when there was nothing
    /// to do or an empty forced re-sign took place.
    ///
    /// # Errors
    ///
    /// [`SequencerError::TreeNeedsInit`] for a log whose root has never
    /// been written; storage, signer, and invariant failures otherwise.
    /// On any error the transaction is rolled back and the batch left
    /// where it was; retries are the caller's responsibility.
    pub fn integrate_batch(
        &self,
        ctx: &OpContext,
        tree: &TreeDef,
        limit: usize,
        guard_window: Duration,
        max_root_duration: Duration,
    ) -> Result<usize, SequencerError> {
        let start = self.clock.now();
        let label = tree.tree_id.to_string();

        let result = self.integrate_batch_in_tx(ctx, tree, limit, guard_window, max_root_duration, start, &label);
        self.metrics.batches.inc(&label);
        self.metrics
            .latency
            .observe(seconds_since(&*self.clock, start), &label);
        let outcome = result?;

        replenish_sequenced(
            &*self.quota_manager,
            self.metrics.replenish,
            outcome.num_leaves,
            tree.tree_id,
            &label,
        );

        #[allow(clippy::cast_precision_loss)]
        self.metrics
            .sequenced
            .add(outcome.num_leaves as f64, &label);
        if let Some(root) = &outcome.new_root {
            info!(
                tree_id = tree.tree_id,
                num_leaves = outcome.num_leaves,
                tree_size = root.tree_size,
                revision = root.revision,
                "sequenced leaves"
            );
        }
        Ok(outcome.num_leaves)
    }

    #[allow(clippy::too_many_lines, clippy::too_many_arguments)]
    fn integrate_batch_in_tx(
        &self,
        ctx: &OpContext,
        tree: &TreeDef,
        limit: usize,
        guard_window: Duration,
        max_root_duration: Duration,
        start: SystemTime,
        label: &str,
    ) -> Result<BatchOutcome, SequencerError> {
        let tree_id = tree.tree_id;
        let storage_err = |source| SequencerError::Storage { tree_id, source };

        let mut tx = self
            .storage
            .begin_tree_tx(ctx, tree_id)
            .map_err(storage_err)?;
        let mut stage_start = self.clock.now();

        // Latest known root. A log with no root at all has not been
        // through prepare_log yet; the caller initializes and retries.
        let Some(slr) = tx.latest_signed_log_root(ctx).map_err(storage_err)? else {
            warn!(tree_id, "fresh log: no previous tree heads exist");
            return Err(SequencerError::TreeNeedsInit { tree_id });
        };
        let current_root = LogRootV1::from_canonical_bytes(&slr.log_root)
            .map_err(|source| SequencerError::RootDecode { tree_id, source })?;
        self.metrics
            .get_root_latency
            .observe(seconds_since(&*self.clock, stage_start), label);
        #[allow(clippy::cast_precision_loss)]
        self.metrics
            .tree_size
            .set(current_root.tree_size as f64, label);

        // Rebuild the compact range from the persisted border nodes and
        // require that it reproduces the stored root hash. This is the
        // self-check that storage has not silently diverged.
        stage_start = self.clock.now();
        let mut range =
            self.init_compact_range_from_storage(ctx, tree_id, &current_root, tx.as_mut())?;
        self.metrics
            .init_tree_latency
            .observe(seconds_since(&*self.clock, stage_start), label);

        let task = SequencingTask::new(
            tree.tree_type,
            tree_id,
            current_root.tree_size,
            label,
            &*self.clock,
            self.metrics,
        );

        let cutoff = start.checked_sub(guard_window).unwrap_or(UNIX_EPOCH);
        let mut leaves = task.fetch(ctx, tx.as_mut(), limit, cutoff)?;
        let num_leaves = leaves.len();

        // A new root is needed when entries were added or the latest root
        // has grown too old.
        if num_leaves == 0 {
            let age = Duration::from_nanos(
                unix_nanos(self.clock.now()).saturating_sub(current_root.timestamp_nanos),
            );
            if max_root_duration.is_zero() || age < max_root_duration {
                debug!(tree_id, "no leaves sequenced in this signing operation");
                return Ok(BatchOutcome {
                    num_leaves: 0,
                    new_root: None,
                });
            }
            info!(tree_id, age_nanos = u64::try_from(age.as_nanos()).unwrap_or(u64::MAX), "forcing new root generation");
        }

        // All reads are done; the updates below land at the next
        // revision. Storage must hand out exactly the successor of the
        // current root's revision, or a concurrent writer slipped in.
        let new_revision = tx.write_revision(ctx).map_err(storage_err)?;
        if new_revision != current_root.revision + 1 {
            return Err(SequencerError::RevisionMismatch {
                tree_id,
                got: new_revision,
                want: current_root.revision + 1,
            });
        }

        stage_start = self.clock.now();
        self.prepare_leaves(&mut leaves, range.end(), tree_id, label)?;
        let (node_map, new_root_hash) = update_compact_range(&mut range, &leaves, tree_id)?;
        self.metrics
            .write_tree_latency
            .observe(seconds_since(&*self.clock, stage_start), label);

        task.update(ctx, tx.as_mut(), &leaves)?;

        // The node map is keyed by node ID, so each node of the batch is
        // written exactly once at the new revision and writes cannot
        // conflict.
        stage_start = self.clock.now();
        let target_nodes = build_nodes_from_node_map(&node_map, new_revision, tree_id)?;
        tx.set_merkle_nodes(ctx, &target_nodes).map_err(storage_err)?;
        self.metrics
            .set_nodes_latency
            .observe(seconds_since(&*self.clock, stage_start), label);

        stage_start = self.clock.now();
        let new_root = LogRootV1 {
            tree_size: range.end(),
            root_hash: new_root_hash,
            timestamp_nanos: unix_nanos(self.clock.now()),
            revision: new_revision,
            metadata: Vec::new(),
        };
        #[allow(clippy::cast_precision_loss)]
        self.metrics.tree_size.set(new_root.tree_size as f64, label);
        #[allow(clippy::cast_precision_loss)]
        self.metrics
            .timestamp
            .set((new_root.timestamp_nanos / 1_000_000) as f64, label);

        if new_root.timestamp_nanos <= current_root.timestamp_nanos {
            return Err(SequencerError::TimestampNotAdvancing {
                tree_id,
                new_nanos: new_root.timestamp_nanos,
                old_nanos: current_root.timestamp_nanos,
            });
        }

        let new_slr = self
            .signer
            .sign_log_root(&new_root)
            .map_err(|source| SequencerError::Signer { tree_id, source })?;
        tx.store_signed_log_root(ctx, &new_slr).map_err(storage_err)?;
        self.metrics
            .store_root_latency
            .observe(seconds_since(&*self.clock, stage_start), label);

        tx.commit(ctx).map_err(storage_err)?;
        Ok(BatchOutcome {
            num_leaves,
            new_root: Some(new_root),
        })
    }

    /// Builds a compact range matching the latest data in storage and
    /// verifies it reproduces the stored root hash.
    fn init_compact_range_from_storage<'s>(
        &'s self,
        ctx: &OpContext,
        tree_id: i64,
        root: &LogRootV1,
        tx: &mut dyn LogTreeTx,
    ) -> Result<CompactRange<'s>, SequencerError> {
        if root.tree_size == 0 {
            return Ok(CompactRange::empty(&*self.hasher));
        }

        let ids = range_nodes_for_prefix(root.tree_size);
        let mut storage_ids = Vec::with_capacity(ids.len());
        for id in ids {
            storage_ids.push(
                StorageNodeId::from_compact(id)
                    .map_err(|source| SequencerError::Merkle { tree_id, source })?,
            );
        }

        let nodes = tx
            .get_merkle_nodes(ctx, root.revision, &storage_ids)
            .map_err(|source| SequencerError::Storage { tree_id, source })?;
        if nodes.len() != storage_ids.len() {
            return Err(SequencerError::NodeCountMismatch {
                tree_id,
                revision: root.revision,
                want: storage_ids.len(),
                got: nodes.len(),
            });
        }
        for (position, (node, want)) in nodes.iter().zip(&storage_ids).enumerate() {
            if !node.storage_id.equivalent(want) {
                return Err(SequencerError::NodeIdMismatch {
                    tree_id,
                    position,
                    got: node.storage_id,
                    want: *want,
                });
            }
        }

        let hashes: Vec<NodeHash> = nodes.into_iter().map(|node| node.hash).collect();
        let range = CompactRange::from_hashes(&*self.hasher, root.tree_size, hashes)
            .map_err(|source| SequencerError::Merkle { tree_id, source })?;

        // Tree size is non-zero here, so the empty-root sentinel cannot
        // mask a mismatch.
        let recomputed = range.root_hash(None);
        if !bool::from(recomputed.as_slice().ct_eq(root.root_hash.as_slice())) {
            return Err(SequencerError::RootHashMismatch {
                tree_id,
                tree_size: root.tree_size,
            });
        }
        Ok(range)
    }

    /// Asserts batch indices line up with the tree, stamps integration
    /// timestamps, and records merge delays.
    fn prepare_leaves(
        &self,
        leaves: &mut [LeafEntry],
        begin: u64,
        tree_id: i64,
        label: &str,
    ) -> Result<(), SequencerError> {
        let now = self.clock.now();
        for (i, leaf) in leaves.iter_mut().enumerate() {
            // The leaf must already carry the correct index before it is
            // integrated.
            let want = begin + i as u64;
            if leaf.leaf_index < 0 || leaf.leaf_index.unsigned_abs() != want {
                return Err(SequencerError::LeafIndexMismatch {
                    tree_id,
                    got: leaf.leaf_index,
                    want,
                });
            }
            leaf.integrate_timestamp = Some(now);

            // Entries queued by older writers may not carry a queue time;
            // only those that do feed the merge-delay histogram.
            if let Some(queued_at) = leaf.queue_timestamp {
                if let Ok(delay) = now.duration_since(queued_at) {
                    self.metrics.merge_delay.observe(delay.as_secs_f64(), label);
                }
            }
        }
        Ok(())
    }
}

/// Folds the batch into the compact range, collecting every created or
/// updated node, and returns the node map with the new root hash.
fn update_compact_range(
    range: &mut CompactRange<'_>,
    leaves: &[LeafEntry],
    tree_id: i64,
) -> Result<(BTreeMap<CompactNodeId, NodeHash>, NodeHash), SequencerError> {
    let mut node_map: BTreeMap<CompactNodeId, NodeHash> = BTreeMap::new();

    for leaf in leaves {
        let size = range.end();
        if leaf.leaf_index < 0 || leaf.leaf_index.unsigned_abs() != size {
            return Err(SequencerError::LeafIndexMismatch {
                tree_id,
                got: leaf.leaf_index,
                want: size,
            });
        }
        node_map.insert(CompactNodeId::new(0, size), leaf.merkle_leaf_hash.clone());
        range
            .append(
                leaf.merkle_leaf_hash.clone(),
                Some(&mut |id, hash: &NodeHash| {
                    node_map.insert(id, hash.clone());
                }),
            )
            .map_err(|source| SequencerError::Merkle { tree_id, source })?;
    }

    // The fold also reports the ephemeral nodes on the right border; they
    // are persisted with everything else. For an empty range this yields
    // the hasher's empty-root constant.
    let root_hash = range.root_hash(Some(&mut |id, hash: &NodeHash| {
        node_map.insert(id, hash.clone());
    }));
    Ok((node_map, root_hash))
}

/// Materializes node-revision tuples from the collected node map.
fn build_nodes_from_node_map(
    node_map: &BTreeMap<CompactNodeId, NodeHash>,
    new_revision: u64,
    tree_id: i64,
) -> Result<Vec<Node>, SequencerError> {
    let mut nodes = Vec::with_capacity(node_map.len());
    for (id, hash) in node_map {
        let storage_id = StorageNodeId::from_compact(*id)
            .map_err(|source| SequencerError::Merkle { tree_id, source })?;
        nodes.push(Node {
            storage_id,
            hash: hash.clone(),
            node_revision: new_revision,
        });
    }
    Ok(nodes)
}
