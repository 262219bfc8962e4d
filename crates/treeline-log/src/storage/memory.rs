//! In-memory log storage for tests and embedded use.
//!
//! Not suited to production: nothing is durable and whole-tree state is
//! copied per transaction. What it does share with a production backend is
//! the contract: per-tree serialization of committed transactions,
//! atomic publication on commit, rollback on drop, and one signed root
//! per revision.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use treeline_core::crypto::NodeHash;
use treeline_core::merkle::StorageNodeId;
use treeline_core::types::{LeafEntry, LogRootV1, SignedLogRoot, TreeDef, TreeType};

use super::{LogStorage, LogTreeTx, Node, StorageError};
use crate::context::OpContext;

/// Per-tree storage state.
#[derive(Debug, Clone)]
struct TreeState {
    def: TreeDef,
    /// Commit counter for optimistic concurrency control.
    epoch: u64,
    /// Unsequenced entries in queue order (normal log mode).
    queued: VecDeque<LeafEntry>,
    /// Sequenced entries by leaf index.
    sequenced: BTreeMap<i64, LeafEntry>,
    /// Node hashes by storage ID, then by revision.
    nodes: HashMap<StorageNodeId, BTreeMap<u64, NodeHash>>,
    /// Signed roots by revision.
    roots: BTreeMap<u64, SignedLogRoot>,
    /// Decoded form of the highest-revision root.
    latest_root: Option<LogRootV1>,
}

impl TreeState {
    fn new(def: TreeDef) -> Self {
        Self {
            def,
            epoch: 0,
            queued: VecDeque::new(),
            sequenced: BTreeMap::new(),
            nodes: HashMap::new(),
            roots: BTreeMap::new(),
            latest_root: None,
        }
    }

    fn tree_type(&self) -> TreeType {
        self.def.tree_type
    }

    fn tree_size(&self) -> u64 {
        self.latest_root.as_ref().map_or(0, |root| root.tree_size)
    }
}

/// In-memory [`LogStorage`] backend.
///
/// Transactions take a snapshot of the tree state and publish it back on
/// commit; a commit that lost the race to a concurrent transaction fails
/// with [`StorageError::Conflict`] and publishes nothing.
#[derive(Debug, Default)]
pub struct MemoryLogStorage {
    trees: RwLock<HashMap<i64, Arc<Mutex<TreeState>>>>,
}

impl MemoryLogStorage {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions a tree.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TreeExists`] when the tree ID is taken.
    pub fn add_tree(&self, def: TreeDef) -> Result<(), StorageError> {
        let mut trees = write_lock(&self.trees);
        if trees.contains_key(&def.tree_id) {
            return Err(StorageError::TreeExists {
                tree_id: def.tree_id,
            });
        }
        let tree_id = def.tree_id;
        trees.insert(tree_id, Arc::new(Mutex::new(TreeState::new(def))));
        Ok(())
    }

    /// Submits an unsequenced leaf to a normal log's queue.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTree`] for unprovisioned trees and a
    /// backend error when the tree is pre-ordered (its entries arrive
    /// sequenced).
    pub fn queue_leaf(&self, tree_id: i64, leaf: LeafEntry) -> Result<(), StorageError> {
        let tree = self.tree(tree_id)?;
        let mut state = lock(&tree);
        if state.tree_type() != TreeType::Log {
            return Err(StorageError::Backend {
                detail: format!("tree {tree_id} does not accept unsequenced leaves"),
            });
        }
        state.queued.push_back(leaf);
        Ok(())
    }

    /// Stores an already-sequenced leaf for a pre-ordered log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SequencedLeafExists`] when the index is
    /// occupied and a backend error for negative indices.
    pub fn add_sequenced_leaf(&self, tree_id: i64, leaf: LeafEntry) -> Result<(), StorageError> {
        let tree = self.tree(tree_id)?;
        let mut state = lock(&tree);
        if leaf.leaf_index < 0 {
            return Err(StorageError::Backend {
                detail: format!("sequenced leaf with negative index {}", leaf.leaf_index),
            });
        }
        if state.sequenced.contains_key(&leaf.leaf_index) {
            return Err(StorageError::SequencedLeafExists {
                leaf_index: leaf.leaf_index,
            });
        }
        state.sequenced.insert(leaf.leaf_index, leaf);
        Ok(())
    }

    /// Returns the decoded latest log root, if any. Test convenience.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTree`] for unprovisioned trees.
    pub fn latest_log_root(&self, tree_id: i64) -> Result<Option<LogRootV1>, StorageError> {
        let tree = self.tree(tree_id)?;
        let state = lock(&tree);
        Ok(state.latest_root.clone())
    }

    /// Returns all sequenced leaves in index order. Test convenience.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTree`] for unprovisioned trees.
    pub fn sequenced_leaves(&self, tree_id: i64) -> Result<Vec<LeafEntry>, StorageError> {
        let tree = self.tree(tree_id)?;
        let state = lock(&tree);
        Ok(state.sequenced.values().cloned().collect())
    }

    /// Number of queued (unsequenced) leaves. Test convenience.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTree`] for unprovisioned trees.
    pub fn queued_leaf_count(&self, tree_id: i64) -> Result<usize, StorageError> {
        let tree = self.tree(tree_id)?;
        let state = lock(&tree);
        Ok(state.queued.len())
    }

    fn tree(&self, tree_id: i64) -> Result<Arc<Mutex<TreeState>>, StorageError> {
        let trees = read_lock(&self.trees);
        trees
            .get(&tree_id)
            .cloned()
            .ok_or(StorageError::UnknownTree { tree_id })
    }
}

impl LogStorage for MemoryLogStorage {
    fn begin_tree_tx(
        &self,
        ctx: &OpContext,
        tree_id: i64,
    ) -> Result<Box<dyn LogTreeTx>, StorageError> {
        ctx.ensure_active()?;
        let tree = self.tree(tree_id)?;
        let (scratch, base_epoch) = {
            let state = lock(&tree);
            (state.clone(), state.epoch)
        };
        Ok(Box::new(MemoryLogTx {
            tree_id,
            tree,
            scratch,
            base_epoch,
        }))
    }
}

/// Snapshot transaction over one tree.
struct MemoryLogTx {
    tree_id: i64,
    tree: Arc<Mutex<TreeState>>,
    scratch: TreeState,
    base_epoch: u64,
}

impl LogTreeTx for MemoryLogTx {
    fn latest_signed_log_root(
        &mut self,
        ctx: &OpContext,
    ) -> Result<Option<SignedLogRoot>, StorageError> {
        ctx.ensure_active()?;
        let Some(root) = self.scratch.latest_root.as_ref() else {
            return Ok(None);
        };
        Ok(self.scratch.roots.get(&root.revision).cloned())
    }

    fn get_merkle_nodes(
        &mut self,
        ctx: &OpContext,
        revision: u64,
        ids: &[StorageNodeId],
    ) -> Result<Vec<Node>, StorageError> {
        ctx.ensure_active()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(revisions) = self.scratch.nodes.get(id) else {
                continue;
            };
            if let Some((node_revision, hash)) = revisions.range(..=revision).next_back() {
                out.push(Node {
                    storage_id: *id,
                    hash: hash.clone(),
                    node_revision: *node_revision,
                });
            }
        }
        Ok(out)
    }

    fn dequeue_leaves(
        &mut self,
        ctx: &OpContext,
        limit: usize,
        cutoff: SystemTime,
    ) -> Result<Vec<LeafEntry>, StorageError> {
        ctx.ensure_active()?;
        match self.scratch.tree_type() {
            TreeType::Log => {
                let mut out = Vec::new();
                while out.len() < limit {
                    let eligible = self
                        .scratch
                        .queued
                        .front()
                        .is_some_and(|leaf| leaf.queue_timestamp.is_none_or(|t| t <= cutoff));
                    if !eligible {
                        break;
                    }
                    if let Some(leaf) = self.scratch.queued.pop_front() {
                        out.push(leaf);
                    }
                }
                Ok(out)
            }
            TreeType::PreorderedLog => {
                let Ok(begin) = i64::try_from(self.scratch.tree_size()) else {
                    return Err(StorageError::Backend {
                        detail: "tree size exceeds leaf index range".to_string(),
                    });
                };
                Ok(self
                    .scratch
                    .sequenced
                    .range(begin..)
                    .take(limit)
                    .map(|(_, leaf)| leaf.clone())
                    .collect())
            }
        }
    }

    fn update_sequenced_leaves(
        &mut self,
        ctx: &OpContext,
        leaves: &[LeafEntry],
    ) -> Result<(), StorageError> {
        ctx.ensure_active()?;
        for leaf in leaves {
            if self.scratch.sequenced.contains_key(&leaf.leaf_index) {
                return Err(StorageError::SequencedLeafExists {
                    leaf_index: leaf.leaf_index,
                });
            }
        }
        for leaf in leaves {
            self.scratch.sequenced.insert(leaf.leaf_index, leaf.clone());
        }
        Ok(())
    }

    fn write_revision(&mut self, ctx: &OpContext) -> Result<u64, StorageError> {
        ctx.ensure_active()?;
        Ok(self
            .scratch
            .latest_root
            .as_ref()
            .map_or(0, |root| root.revision + 1))
    }

    fn set_merkle_nodes(&mut self, ctx: &OpContext, nodes: &[Node]) -> Result<(), StorageError> {
        ctx.ensure_active()?;
        for node in nodes {
            self.scratch
                .nodes
                .entry(node.storage_id)
                .or_default()
                .insert(node.node_revision, node.hash.clone());
        }
        Ok(())
    }

    fn store_signed_log_root(
        &mut self,
        ctx: &OpContext,
        slr: &SignedLogRoot,
    ) -> Result<(), StorageError> {
        ctx.ensure_active()?;
        let root = LogRootV1::from_canonical_bytes(&slr.log_root).map_err(|err| {
            StorageError::Backend {
                detail: format!("signed log root does not decode: {err}"),
            }
        })?;
        if self.scratch.roots.contains_key(&root.revision) {
            return Err(StorageError::DuplicateRevision {
                revision: root.revision,
            });
        }
        self.scratch.roots.insert(root.revision, slr.clone());
        let is_latest = self
            .scratch
            .latest_root
            .as_ref()
            .is_none_or(|latest| root.revision > latest.revision);
        if is_latest {
            self.scratch.latest_root = Some(root);
        }
        Ok(())
    }

    fn commit(self: Box<Self>, ctx: &OpContext) -> Result<(), StorageError> {
        ctx.ensure_active()?;
        let Self {
            tree_id,
            tree,
            mut scratch,
            base_epoch,
        } = *self;
        let mut state = lock(&tree);
        if state.epoch != base_epoch {
            return Err(StorageError::Conflict { tree_id });
        }
        scratch.epoch = base_epoch + 1;
        *state = scratch;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use treeline_core::merkle::StorageNodeId;

    use super::*;

    fn leaf(payload: &[u8]) -> LeafEntry {
        LeafEntry::new(payload.to_vec(), payload.to_vec())
    }

    fn root_bytes(tree_size: u64, revision: u64) -> SignedLogRoot {
        let root = LogRootV1 {
            tree_size,
            root_hash: vec![1; 32],
            timestamp_nanos: 1,
            revision,
            metadata: Vec::new(),
        };
        SignedLogRoot {
            log_root: root.to_canonical_bytes().expect("encode"),
            signature: vec![0; 64],
        }
    }

    #[test]
    fn add_tree_rejects_duplicates() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        assert!(matches!(
            storage.add_tree(TreeDef::new(1, TreeType::Log)),
            Err(StorageError::TreeExists { tree_id: 1 })
        ));
    }

    #[test]
    fn fresh_tree_has_no_signed_root() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let ctx = OpContext::background();
        let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
        assert_eq!(tx.latest_signed_log_root(&ctx).expect("read"), None);
    }

    #[test]
    fn uncommitted_transaction_rolls_back() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let ctx = OpContext::background();
        {
            let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
            tx.store_signed_log_root(&ctx, &root_bytes(0, 0))
                .expect("store");
            // Dropped without commit.
        }
        assert_eq!(storage.latest_log_root(1).expect("read"), None);
    }

    #[test]
    fn commit_publishes_atomically() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let ctx = OpContext::background();
        let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
        tx.store_signed_log_root(&ctx, &root_bytes(0, 0))
            .expect("store");
        tx.commit(&ctx).expect("commit");

        let latest = storage.latest_log_root(1).expect("read").expect("root");
        assert_eq!(latest.revision, 0);
    }

    #[test]
    fn concurrent_commit_conflicts_cleanly() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let ctx = OpContext::background();

        let mut first = storage.begin_tree_tx(&ctx, 1).expect("tx");
        let mut second = storage.begin_tree_tx(&ctx, 1).expect("tx");
        first
            .store_signed_log_root(&ctx, &root_bytes(0, 0))
            .expect("store");
        second
            .store_signed_log_root(&ctx, &root_bytes(0, 0))
            .expect("store");

        first.commit(&ctx).expect("first commit");
        assert!(matches!(
            second.commit(&ctx),
            Err(StorageError::Conflict { tree_id: 1 })
        ));
    }

    #[test]
    fn duplicate_revision_rejected() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let ctx = OpContext::background();
        let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
        tx.store_signed_log_root(&ctx, &root_bytes(0, 0))
            .expect("store");
        assert!(matches!(
            tx.store_signed_log_root(&ctx, &root_bytes(1, 0)),
            Err(StorageError::DuplicateRevision { revision: 0 })
        ));
    }

    #[test]
    fn dequeue_respects_cutoff_and_fifo() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        let t1 = UNIX_EPOCH + Duration::from_secs(200);

        let mut early = leaf(b"early");
        early.queue_timestamp = Some(t0);
        let mut late = leaf(b"late");
        late.queue_timestamp = Some(t1);
        storage.queue_leaf(1, early).expect("queue");
        storage.queue_leaf(1, late).expect("queue");

        let ctx = OpContext::background();
        let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
        let got = tx
            .dequeue_leaves(&ctx, 10, t0 + Duration::from_secs(1))
            .expect("dequeue");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"early");
    }

    #[test]
    fn cancelled_context_fails_operations() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let (ctx, handle) = OpContext::cancellable();
        let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
        handle.cancel();
        assert!(matches!(
            tx.latest_signed_log_root(&ctx),
            Err(StorageError::Cancelled)
        ));
    }

    #[test]
    fn node_reads_return_latest_at_or_below_revision() {
        let storage = MemoryLogStorage::new();
        storage
            .add_tree(TreeDef::new(1, TreeType::Log))
            .expect("add");
        let ctx = OpContext::background();
        let id = StorageNodeId::from_tree_coords(0, 0).expect("coords");

        let mut tx = storage.begin_tree_tx(&ctx, 1).expect("tx");
        tx.set_merkle_nodes(
            &ctx,
            &[
                Node {
                    storage_id: id,
                    hash: vec![1],
                    node_revision: 1,
                },
                Node {
                    storage_id: id,
                    hash: vec![3],
                    node_revision: 3,
                },
            ],
        )
        .expect("set");

        let at_2 = tx.get_merkle_nodes(&ctx, 2, &[id]).expect("get");
        assert_eq!(at_2.len(), 1);
        assert_eq!(at_2[0].hash, vec![1]);
        assert_eq!(at_2[0].node_revision, 1);

        let at_0 = tx.get_merkle_nodes(&ctx, 0, &[id]).expect("get");
        assert!(at_0.is_empty());
    }
}
