//! Log root signing seam and the Ed25519 instantiation.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;

use crate::types::{LogRootError, LogRootV1, SignedLogRoot};

/// Errors from signing or verifying log roots.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The log root could not be canonically encoded.
    #[error("log root encoding failed: {0}")]
    Encode(#[from] LogRootError),

    /// The signature bytes are not a valid signature for the scheme.
    #[error("malformed signature: {detail}")]
    MalformedSignature {
        /// Description of the failure.
        detail: String,
    },

    /// The signature does not verify over the canonical log root bytes.
    #[error("log root signature verification failed")]
    VerificationFailed,
}

/// Produces signed log roots over the canonical [`LogRootV1`] encoding.
pub trait LogRootSigner: Send + Sync {
    /// Signs the canonical encoding of `root`.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Encode`] when the root cannot be encoded;
    /// implementations may surface scheme-specific failures as well.
    fn sign_log_root(&self, root: &LogRootV1) -> Result<SignedLogRoot, SignerError>;
}

/// Ed25519 log root signer.
pub struct Ed25519LogRootSigner {
    key: SigningKey,
}

impl Ed25519LogRootSigner {
    /// Wraps an existing signing key.
    #[must_use]
    pub const fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Returns the verifying half of the signing key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl LogRootSigner for Ed25519LogRootSigner {
    fn sign_log_root(&self, root: &LogRootV1) -> Result<SignedLogRoot, SignerError> {
        let log_root = root.to_canonical_bytes()?;
        let signature = self.key.sign(&log_root);
        Ok(SignedLogRoot {
            signature: signature.to_bytes().to_vec(),
            log_root,
        })
    }
}

impl std::fmt::Debug for Ed25519LogRootSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519LogRootSigner")
            .field("verifying_key", &self.key.verifying_key())
            .finish()
    }
}

/// Verifies a signed log root against an Ed25519 verifying key.
///
/// The sequencer itself never calls this (there is no trust boundary
/// between signer and storage); it is the check external log verifiers
/// run on a fetched checkpoint.
///
/// # Errors
///
/// Returns [`SignerError::MalformedSignature`] for signature bytes of the
/// wrong shape and [`SignerError::VerificationFailed`] when the signature
/// does not cover the canonical root bytes.
pub fn verify_signed_log_root(
    key: &VerifyingKey,
    slr: &SignedLogRoot,
) -> Result<(), SignerError> {
    let signature = Signature::from_slice(&slr.signature).map_err(|err| {
        SignerError::MalformedSignature {
            detail: err.to_string(),
        }
    })?;
    key.verify(&slr.log_root, &signature)
        .map_err(|_| SignerError::VerificationFailed)
}
