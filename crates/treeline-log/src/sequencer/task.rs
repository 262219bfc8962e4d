//! Batch fetch and sequence-assignment persistence, per sequencing mode.

use std::time::SystemTime;

use treeline_core::clock::{seconds_since, TimeSource};
use treeline_core::types::{LeafEntry, TreeType};

use super::metrics::SequencerMetrics;
use super::SequencerError;
use crate::context::OpContext;
use crate::storage::LogTreeTx;

/// How leaf indices come to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskMode {
    /// Indices are assigned here, as leaves are dequeued.
    Normal,
    /// Indices were assigned at queue time; storage already has them.
    PreOrdered,
}

/// Produces the ordered batch for one integration run and persists the
/// resulting sequence assignments where storage does not have them yet.
///
/// The two modes differ only here; the integrator treats the fetched
/// leaves identically afterwards.
pub(crate) struct SequencingTask<'a> {
    mode: TaskMode,
    tree_id: i64,
    tree_size: u64,
    label: &'a str,
    clock: &'a dyn TimeSource,
    metrics: &'static SequencerMetrics,
}

impl<'a> SequencingTask<'a> {
    pub(crate) fn new(
        tree_type: TreeType,
        tree_id: i64,
        tree_size: u64,
        label: &'a str,
        clock: &'a dyn TimeSource,
        metrics: &'static SequencerMetrics,
    ) -> Self {
        let mode = match tree_type {
            TreeType::Log => TaskMode::Normal,
            TreeType::PreorderedLog => TaskMode::PreOrdered,
        };
        Self {
            mode,
            tree_id,
            tree_size,
            label,
            clock,
            metrics,
        }
    }

    /// Fetches up to `limit` leaves with consecutive indices starting at
    /// the current tree size. Leaves queued after `cutoff` stay behind.
    pub(crate) fn fetch(
        &self,
        ctx: &OpContext,
        tx: &mut dyn LogTreeTx,
        limit: usize,
        cutoff: SystemTime,
    ) -> Result<Vec<LeafEntry>, SequencerError> {
        let start = self.clock.now();
        let mut leaves =
            tx.dequeue_leaves(ctx, limit, cutoff)
                .map_err(|source| SequencerError::Storage {
                    tree_id: self.tree_id,
                    source,
                })?;
        self.metrics
            .dequeue_latency
            .observe(seconds_since(self.clock, start), self.label);

        if self.mode == TaskMode::Normal {
            for (i, leaf) in leaves.iter_mut().enumerate() {
                let Some(index) = (i as u64)
                    .checked_add(self.tree_size)
                    .and_then(|index| i64::try_from(index).ok())
                else {
                    return Err(SequencerError::LeafIndexOverflow {
                        tree_id: self.tree_id,
                        tree_size: self.tree_size,
                        offset: i,
                    });
                };
                leaf.leaf_index = index;
            }
        }
        Ok(leaves)
    }

    /// Persists sequence assignments for the fetched batch.
    ///
    /// Pre-ordered assignments are already durable, so that mode is a
    /// no-op. Stamping integration timestamps back into pre-ordered
    /// storage rows is an open extension point.
    pub(crate) fn update(
        &self,
        ctx: &OpContext,
        tx: &mut dyn LogTreeTx,
        leaves: &[LeafEntry],
    ) -> Result<(), SequencerError> {
        match self.mode {
            TaskMode::Normal => {
                let start = self.clock.now();
                tx.update_sequenced_leaves(ctx, leaves).map_err(|source| {
                    SequencerError::Storage {
                        tree_id: self.tree_id,
                        source,
                    }
                })?;
                self.metrics
                    .update_leaves_latency
                    .observe(seconds_since(self.clock, start), self.label);
                Ok(())
            }
            TaskMode::PreOrdered => Ok(()),
        }
    }
}
