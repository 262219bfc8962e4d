//! Sequencer instrument set.

use std::sync::{Arc, OnceLock};

use crate::monitoring::{Counter, Gauge, Histogram, MetricFactory};
use crate::quota::{ReplenishMetrics, LOG_ID_LABEL};

/// Instruments observed at the sequencer's checkpoints.
///
/// Process-wide: created from the metric factory passed to the first
/// sequencer constructed in the process, shared by every sequencer after
/// that. All instruments are labeled by decimal tree ID.
pub(crate) struct SequencerMetrics {
    /// Sequencer batch operations started.
    pub batches: Arc<dyn Counter>,
    /// Tree size of the last signed root.
    pub tree_size: Arc<dyn Gauge>,
    /// Timestamp of the last signed root, in ms since the Unix epoch.
    pub timestamp: Arc<dyn Gauge>,
    /// End-to-end batch latency, seconds.
    pub latency: Arc<dyn Histogram>,
    /// Dequeue stage latency, seconds.
    pub dequeue_latency: Arc<dyn Histogram>,
    /// Latest-root read stage latency, seconds.
    pub get_root_latency: Arc<dyn Histogram>,
    /// Compact-range rebuild stage latency, seconds.
    pub init_tree_latency: Arc<dyn Histogram>,
    /// Tree update (leaf preparation + node collection) latency, seconds.
    pub write_tree_latency: Arc<dyn Histogram>,
    /// Sequence-assignment persistence latency, seconds.
    pub update_leaves_latency: Arc<dyn Histogram>,
    /// Node write stage latency, seconds.
    pub set_nodes_latency: Arc<dyn Histogram>,
    /// Root sign-and-store stage latency, seconds.
    pub store_root_latency: Arc<dyn Histogram>,
    /// Leaves sequenced.
    pub sequenced: Arc<dyn Counter>,
    /// Per-leaf delay between queuing and integration, seconds.
    pub merge_delay: Arc<dyn Histogram>,
    /// Quota replenishment counters (shared with the quota module).
    pub replenish: &'static ReplenishMetrics,
}

impl SequencerMetrics {
    fn create(factory: &dyn MetricFactory) -> Self {
        Self {
            batches: factory.new_counter(
                "sequencer_batches",
                "Number of sequencer batch operations",
                LOG_ID_LABEL,
            ),
            tree_size: factory.new_gauge(
                "sequencer_tree_size",
                "Tree size of last signed log root",
                LOG_ID_LABEL,
            ),
            timestamp: factory.new_gauge(
                "sequencer_tree_timestamp",
                "Time of last signed log root in ms since epoch",
                LOG_ID_LABEL,
            ),
            latency: factory.new_histogram(
                "sequencer_latency",
                "Latency of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            dequeue_latency: factory.new_histogram(
                "sequencer_latency_dequeue",
                "Latency of dequeue-leaves part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            get_root_latency: factory.new_histogram(
                "sequencer_latency_get_root",
                "Latency of get-root part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            init_tree_latency: factory.new_histogram(
                "sequencer_latency_init_tree",
                "Latency of init-tree part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            write_tree_latency: factory.new_histogram(
                "sequencer_latency_write_tree",
                "Latency of write-tree part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            update_leaves_latency: factory.new_histogram(
                "sequencer_latency_update_leaves",
                "Latency of update-leaves part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            set_nodes_latency: factory.new_histogram(
                "sequencer_latency_set_nodes",
                "Latency of set-nodes part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            store_root_latency: factory.new_histogram(
                "sequencer_latency_store_root",
                "Latency of store-root part of sequencer batch operation in seconds",
                LOG_ID_LABEL,
            ),
            sequenced: factory.new_counter(
                "sequencer_sequenced",
                "Number of leaves sequenced",
                LOG_ID_LABEL,
            ),
            merge_delay: factory.new_histogram(
                "sequencer_merge_delay",
                "Delay between queuing and integration of leaves in seconds",
                LOG_ID_LABEL,
            ),
            replenish: ReplenishMetrics::global(factory),
        }
    }

    /// Initializes the process-wide instrument set on first call; later
    /// calls return the existing set regardless of the factory passed.
    pub(crate) fn global(factory: &dyn MetricFactory) -> &'static Self {
        static METRICS: OnceLock<SequencerMetrics> = OnceLock::new();
        METRICS.get_or_init(|| Self::create(factory))
    }
}
