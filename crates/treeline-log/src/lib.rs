//! # treeline-log
//!
//! The sequencing layer of the treeline transparency log: the subsystem
//! that periodically promotes queued leaves into the Merkle tree,
//! assigning contiguous sequence numbers, persisting the updated border
//! nodes at a new revision, and publishing a new signed log root.
//!
//! ## Features
//!
//! - **Batch integration**: [`Sequencer::integrate_batch`] runs one batch
//!   inside a storage transaction with full invariant checking
//! - **Two sequencing modes**: normal logs assign indices on dequeue;
//!   pre-ordered logs arrive with indices already assigned
//! - **Storage seams**: object-safe [`LogStorage`]/[`LogTreeTx`] traits
//!   with an in-memory reference backend
//! - **Quota replenishment**: integrated leaves return tokens to the
//!   read/write rate-limit buckets
//! - **Metrics façade**: typed instruments over a pluggable factory, with
//!   inert and tracing-backed implementations
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! use ed25519_dalek::SigningKey;
//! use treeline_core::clock::ManualTimeSource;
//! use treeline_core::crypto::{Ed25519LogRootSigner, LogHasher, Rfc6962Hasher};
//! use treeline_core::types::{LeafEntry, TreeDef, TreeType};
//! use treeline_log::context::OpContext;
//! use treeline_log::monitoring::InertMetricFactory;
//! use treeline_log::quota::NoopQuotaManager;
//! use treeline_log::sequencer::Sequencer;
//! use treeline_log::storage::MemoryLogStorage;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryLogStorage::new());
//! let tree = TreeDef::new(1, TreeType::Log);
//! storage.add_tree(tree.clone())?;
//!
//! let hasher = Rfc6962Hasher;
//! storage.queue_leaf(1, LeafEntry::new(b"hello".to_vec(), hasher.hash_leaf(b"hello")))?;
//!
//! let clock = Arc::new(ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(1)));
//! let sequencer = Sequencer::new(
//!     Arc::new(hasher),
//!     Arc::clone(&clock) as Arc<dyn treeline_core::clock::TimeSource>,
//!     storage,
//!     Arc::new(Ed25519LogRootSigner::new(SigningKey::from_bytes(&[7; 32]))),
//!     Arc::new(NoopQuotaManager),
//!     &InertMetricFactory,
//! );
//!
//! let ctx = OpContext::background();
//! sequencer.prepare_log(&ctx, &tree)?;
//! clock.advance(Duration::from_secs(1));
//! let integrated = sequencer.integrate_batch(&ctx, &tree, 100, Duration::ZERO, Duration::ZERO)?;
//! assert_eq!(integrated, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod monitoring;
pub mod quota;
pub mod sequencer;
pub mod storage;

pub use context::{CancelHandle, OpContext};
pub use monitoring::{InertMetricFactory, MetricFactory, TracingMetricFactory};
pub use quota::{NoopQuotaManager, QuotaManager, QuotaSpec, TokenBucketQuotaManager};
pub use sequencer::{Sequencer, SequencerError};
pub use storage::{LogStorage, LogTreeTx, MemoryLogStorage, Node, StorageError};
