//! Rate-limit quota seams and sequencing replenishment.
//!
//! Queuing and read paths spend tokens against per-tree and global
//! buckets; the sequencer returns tokens after it integrates leaves, so
//! sustained sequencing throughput keeps feeding the write path. The
//! returned amount is scaled by [`QuotaIncreaseFactor`]: a factor above 1
//! adds resilience against token leakage at the cost of optimism during a
//! true shortage, and a factor below 1 would guarantee shortages, so reads
//! normalize it up to 1.
//!
//! Replenishment failures are soft: they are logged and counted, never
//! propagated, because quota drift must not fail a committed batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::monitoring::{Counter, MetricFactory};

/// Default multiplier for tokens returned after sequencing.
pub const DEFAULT_QUOTA_INCREASE_FACTOR: f64 = 1.1;

/// Errors from quota accounting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// A bucket has too few tokens to satisfy the request.
    #[error("quota exhausted for {spec}")]
    Exhausted {
        /// The empty bucket.
        spec: QuotaSpec,
    },

    /// Manager-specific failure.
    #[error("quota manager failure: {detail}")]
    Manager {
        /// Description of the failure.
        detail: String,
    },
}

/// Whether a bucket throttles reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    /// Read-path quota.
    Read,
    /// Write-path quota.
    Write,
}

/// Scope of a quota bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaGroup {
    /// One bucket shared by every tree.
    Global,
    /// One bucket per tree.
    Tree {
        /// The tree the bucket belongs to.
        tree_id: i64,
    },
}

/// Identifies one quota bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuotaSpec {
    /// Bucket scope.
    pub group: QuotaGroup,
    /// Read or write path.
    pub kind: QuotaKind,
}

impl QuotaSpec {
    /// The four buckets sequencing replenishes for a tree: tree read,
    /// tree write, global read, global write.
    #[must_use]
    pub const fn sequencing_specs(tree_id: i64) -> [Self; 4] {
        [
            Self {
                group: QuotaGroup::Tree { tree_id },
                kind: QuotaKind::Read,
            },
            Self {
                group: QuotaGroup::Tree { tree_id },
                kind: QuotaKind::Write,
            },
            Self {
                group: QuotaGroup::Global,
                kind: QuotaKind::Read,
            },
            Self {
                group: QuotaGroup::Global,
                kind: QuotaKind::Write,
            },
        ]
    }
}

impl std::fmt::Display for QuotaSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            QuotaKind::Read => "read",
            QuotaKind::Write => "write",
        };
        match self.group {
            QuotaGroup::Global => write!(f, "global/{kind}"),
            QuotaGroup::Tree { tree_id } => write!(f, "tree:{tree_id}/{kind}"),
        }
    }
}

/// Token accounting backend.
///
/// Implementations decide which buckets actually exist; requests against
/// unconfigured buckets succeed as no-ops so deployments can enable quotas
/// selectively.
pub trait QuotaManager: Send + Sync {
    /// Spends `count` tokens from each of `specs`.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exhausted`] naming the first bucket that
    /// cannot cover the request; no tokens are spent in that case.
    fn get_tokens(&self, count: u64, specs: &[QuotaSpec]) -> Result<(), QuotaError>;

    /// Returns `count` tokens to each of `specs`.
    ///
    /// # Errors
    ///
    /// Manager-specific failures.
    fn put_tokens(&self, count: u64, specs: &[QuotaSpec]) -> Result<(), QuotaError>;
}

/// Quota manager that enforces nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQuotaManager;

impl QuotaManager for NoopQuotaManager {
    fn get_tokens(&self, _count: u64, _specs: &[QuotaSpec]) -> Result<(), QuotaError> {
        Ok(())
    }

    fn put_tokens(&self, _count: u64, _specs: &[QuotaSpec]) -> Result<(), QuotaError> {
        Ok(())
    }
}

/// In-memory token buckets with a shared capacity cap.
///
/// Buckets start full and refill only through [`QuotaManager::put_tokens`];
/// returned tokens saturate at the capacity so replenishment optimism
/// cannot mint unbounded quota.
#[derive(Debug)]
pub struct TokenBucketQuotaManager {
    capacity: u64,
    buckets: RwLock<HashMap<QuotaSpec, u64>>,
}

impl TokenBucketQuotaManager {
    /// Creates a manager whose buckets hold at most `capacity` tokens.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Remaining tokens in a bucket (full if never touched).
    #[must_use]
    pub fn available(&self, spec: QuotaSpec) -> u64 {
        let buckets = self
            .buckets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets.get(&spec).copied().unwrap_or(self.capacity)
    }
}

impl QuotaManager for TokenBucketQuotaManager {
    fn get_tokens(&self, count: u64, specs: &[QuotaSpec]) -> Result<(), QuotaError> {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for spec in specs {
            let available = buckets.get(spec).copied().unwrap_or(self.capacity);
            if available < count {
                return Err(QuotaError::Exhausted { spec: *spec });
            }
        }
        for spec in specs {
            let available = buckets.entry(*spec).or_insert(self.capacity);
            *available -= count;
        }
        Ok(())
    }

    fn put_tokens(&self, count: u64, specs: &[QuotaSpec]) -> Result<(), QuotaError> {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for spec in specs {
            let available = buckets.entry(*spec).or_insert(self.capacity);
            *available = available.saturating_add(count).min(self.capacity);
        }
        Ok(())
    }
}

/// Process-wide multiplier applied to sequencing replenishment.
///
/// Reads normalize values below 1 up to 1 and write the minimum back;
/// the benign write-back race is idempotent.
#[derive(Debug)]
pub struct QuotaIncreaseFactor {
    bits: AtomicU64,
}

impl QuotaIncreaseFactor {
    fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    /// The process-wide factor cell.
    pub fn global() -> &'static Self {
        static CELL: OnceLock<QuotaIncreaseFactor> = OnceLock::new();
        CELL.get_or_init(|| Self::new(DEFAULT_QUOTA_INCREASE_FACTOR))
    }

    /// Reads the factor, normalizing values below 1 up to 1.
    pub fn get(&self) -> f64 {
        let value = f64::from_bits(self.bits.load(Ordering::Relaxed));
        if value < 1.0 {
            self.bits.store(1.0f64.to_bits(), Ordering::Relaxed);
            return 1.0;
        }
        value
    }

    /// Sets the factor. Values below 1 will be normalized on read.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Counters maintained around sequencing replenishment.
pub struct ReplenishMetrics {
    /// Tokens successfully returned to quota buckets.
    pub replenished_tokens: Arc<dyn Counter>,
    /// Replenishment attempts that failed (soft failures).
    pub replenish_failures: Arc<dyn Counter>,
}

impl ReplenishMetrics {
    fn create(factory: &dyn MetricFactory) -> Self {
        Self {
            replenished_tokens: factory.new_counter(
                "quota_replenished_tokens",
                "Number of quota tokens replenished by sequencing",
                LOG_ID_LABEL,
            ),
            replenish_failures: factory.new_counter(
                "quota_replenish_failures",
                "Number of failed quota replenishment attempts",
                LOG_ID_LABEL,
            ),
        }
    }

    /// Initializes the process-wide replenish counters on first call;
    /// later calls return the existing instruments regardless of factory.
    pub fn global(factory: &dyn MetricFactory) -> &'static Self {
        static METRICS: OnceLock<ReplenishMetrics> = OnceLock::new();
        METRICS.get_or_init(|| Self::create(factory))
    }
}

/// Metric label key carrying the decimal tree ID.
pub(crate) const LOG_ID_LABEL: &str = "log_id";

/// Returns sequencing tokens for `num_leaves` integrated leaves.
///
/// Credits `floor(num_leaves * max(factor, 1))` tokens to the four
/// sequencing buckets of `tree_id`. Failures are logged and counted but
/// never returned: quota drift is a soft failure.
pub fn replenish_sequenced(
    quota_manager: &dyn QuotaManager,
    metrics: &ReplenishMetrics,
    num_leaves: usize,
    tree_id: i64,
    label: &str,
) {
    if num_leaves == 0 {
        return;
    }
    let factor = QuotaIncreaseFactor::global().get();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)] // factor >= 1, so the product is positive
    let tokens = (num_leaves as f64 * factor).floor() as u64;
    let specs = QuotaSpec::sequencing_specs(tree_id);
    match quota_manager.put_tokens(tokens, &specs) {
        Ok(()) => {
            #[allow(clippy::cast_precision_loss)]
            metrics.replenished_tokens.add(tokens as f64, label);
        }
        Err(err) => {
            warn!(tree_id, tokens, %err, "failed to replenish sequencing quota");
            metrics.replenish_failures.inc(label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::InertMetricFactory;

    #[test]
    fn sequencing_specs_cover_four_buckets() {
        let specs = QuotaSpec::sequencing_specs(42);
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().any(|s| matches!(
            s,
            QuotaSpec {
                group: QuotaGroup::Tree { tree_id: 42 },
                kind: QuotaKind::Read
            }
        )));
        assert!(specs
            .iter()
            .any(|s| matches!(s.group, QuotaGroup::Global) && s.kind == QuotaKind::Write));
    }

    #[test]
    fn token_buckets_spend_and_refill() {
        let manager = TokenBucketQuotaManager::new(10);
        let specs = QuotaSpec::sequencing_specs(1);

        manager.get_tokens(8, &specs).expect("spend");
        assert_eq!(manager.available(specs[0]), 2);

        let err = manager.get_tokens(3, &specs);
        assert!(matches!(err, Err(QuotaError::Exhausted { .. })));
        // Failed spends leave balances untouched.
        assert_eq!(manager.available(specs[0]), 2);

        manager.put_tokens(5, &specs).expect("refill");
        assert_eq!(manager.available(specs[0]), 7);

        // Refills saturate at the capacity.
        manager.put_tokens(100, &specs).expect("refill");
        assert_eq!(manager.available(specs[0]), 10);
    }

    #[test]
    fn factor_normalizes_below_one() {
        let factor = QuotaIncreaseFactor::new(0.5);
        assert!((factor.get() - 1.0).abs() < f64::EPSILON);
        // The minimum was written back.
        assert!((f64::from_bits(factor.bits.load(Ordering::Relaxed)) - 1.0).abs() < f64::EPSILON);

        factor.set(1.25);
        assert!((factor.get() - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn replenish_credits_scaled_tokens() {
        let manager = TokenBucketQuotaManager::new(1_000);
        let specs = QuotaSpec::sequencing_specs(7);
        manager.get_tokens(500, &specs).expect("spend");

        let metrics = ReplenishMetrics::create(&InertMetricFactory);
        // Default factor 1.1: floor(20 * 1.1) = 22 tokens per bucket.
        replenish_sequenced(&manager, &metrics, 20, 7, "7");
        for spec in specs {
            assert_eq!(manager.available(spec), 522);
        }
    }

    #[test]
    fn replenish_of_zero_leaves_is_a_noop() {
        let manager = TokenBucketQuotaManager::new(10);
        let specs = QuotaSpec::sequencing_specs(3);
        manager.get_tokens(4, &specs).expect("spend");

        let metrics = ReplenishMetrics::create(&InertMetricFactory);
        replenish_sequenced(&manager, &metrics, 0, 3, "3");
        assert_eq!(manager.available(specs[0]), 6);
    }
}
