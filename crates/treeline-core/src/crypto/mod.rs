//! Cryptographic seams of the log: hashing and log root signing.
//!
//! Both are traits so the sequencing layer stays independent of the
//! concrete algorithms:
//!
//! - [`LogHasher`] defines leaf hashing, child combination, and the
//!   empty-tree root. [`Rfc6962Hasher`] is the SHA-256 instantiation used
//!   by Certificate-Transparency-style logs.
//! - [`LogRootSigner`] signs the canonical encoding of a log root,
//!   producing the externally verifiable checkpoint. [`Ed25519LogRootSigner`]
//!   is the provided implementation.
//!
//! There is no trust boundary between the signer and storage: the
//! sequencer never verifies signatures it reads back, it only produces
//! them. [`verify_signed_log_root`] exists for external verifiers and
//! tests.

mod hasher;
mod signer;

pub use hasher::{LogHasher, NodeHash, Rfc6962Hasher};
pub use signer::{verify_signed_log_root, Ed25519LogRootSigner, LogRootSigner, SignerError};
