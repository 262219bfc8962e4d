//! Log root types and their canonical binary encoding.

use thiserror::Error;

use crate::crypto::NodeHash;

/// Canonical encoding version for [`LogRootV1`].
pub const LOG_ROOT_V1_VERSION: u16 = 1;

/// Absolute upper bound for a canonically encoded [`LogRootV1`].
///
/// version + tree size + hash length byte + maximal hash + timestamp +
/// revision + metadata length + maximal metadata.
pub const MAX_LOG_ROOT_BYTES: usize = 2 + 8 + 1 + 255 + 8 + 8 + 2 + u16::MAX as usize;

/// Errors from encoding or decoding a log root.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogRootError {
    /// Input exceeds the absolute decode bound.
    #[error("encoded log root too large: {size} > {max} bytes")]
    TooLarge {
        /// Input size in bytes.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Encoded version is not [`LOG_ROOT_V1_VERSION`].
    #[error("unsupported log root version: {got}")]
    UnsupportedVersion {
        /// The version found in the encoding.
        got: u16,
    },

    /// Input ended before a complete field was available.
    #[error("truncated log root while reading {field}")]
    Truncated {
        /// Field being decoded.
        field: &'static str,
    },

    /// Extra bytes remained after decoding completed.
    #[error("trailing bytes after log root decode: {remaining}")]
    TrailingBytes {
        /// Remaining byte count.
        remaining: usize,
    },

    /// Root hash does not fit the one-byte length field.
    #[error("root hash of {len} bytes exceeds encodable maximum of 255")]
    RootHashTooLong {
        /// Root hash length.
        len: usize,
    },

    /// Metadata does not fit the two-byte length field.
    #[error("metadata of {len} bytes exceeds encodable maximum of {max}", max = u16::MAX)]
    MetadataTooLong {
        /// Metadata length.
        len: usize,
    },
}

/// The signed payload of a log checkpoint.
///
/// Carries everything a verifier needs to anchor proofs: how many leaves
/// the tree covers, the root over them, when the root was produced, and
/// the storage revision it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogRootV1 {
    /// Number of leaves in the tree.
    pub tree_size: u64,
    /// Merkle root over the first `tree_size` leaves.
    pub root_hash: NodeHash,
    /// Wall-clock time the root was produced, in nanoseconds since the
    /// Unix epoch.
    pub timestamp_nanos: u64,
    /// Storage revision the root was written at.
    pub revision: u64,
    /// Opaque deployment-defined metadata.
    pub metadata: Vec<u8>,
}

impl LogRootV1 {
    /// Canonical binary encoding: all integers big-endian, root hash
    /// length-prefixed with one byte, metadata with two.
    ///
    /// # Errors
    ///
    /// Returns [`LogRootError::RootHashTooLong`] or
    /// [`LogRootError::MetadataTooLong`] when a field does not fit its
    /// length prefix.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, LogRootError> {
        let Ok(hash_len) = u8::try_from(self.root_hash.len()) else {
            return Err(LogRootError::RootHashTooLong {
                len: self.root_hash.len(),
            });
        };
        let Ok(metadata_len) = u16::try_from(self.metadata.len()) else {
            return Err(LogRootError::MetadataTooLong {
                len: self.metadata.len(),
            });
        };

        let mut out =
            Vec::with_capacity(2 + 8 + 1 + self.root_hash.len() + 8 + 8 + 2 + self.metadata.len());
        out.extend_from_slice(&LOG_ROOT_V1_VERSION.to_be_bytes());
        out.extend_from_slice(&self.tree_size.to_be_bytes());
        out.push(hash_len);
        out.extend_from_slice(&self.root_hash);
        out.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
        out.extend_from_slice(&self.revision.to_be_bytes());
        out.extend_from_slice(&metadata_len.to_be_bytes());
        out.extend_from_slice(&self.metadata);
        Ok(out)
    }

    /// Decodes a canonical encoding produced by
    /// [`Self::to_canonical_bytes`].
    ///
    /// Decoding is fail-closed: truncation, trailing bytes, oversize
    /// input, and unknown versions are all rejected.
    ///
    /// # Errors
    ///
    /// See [`LogRootError`].
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, LogRootError> {
        if bytes.len() > MAX_LOG_ROOT_BYTES {
            return Err(LogRootError::TooLarge {
                size: bytes.len(),
                max: MAX_LOG_ROOT_BYTES,
            });
        }

        let mut cursor = Cursor::new(bytes);
        let version = cursor.read_u16("version")?;
        if version != LOG_ROOT_V1_VERSION {
            return Err(LogRootError::UnsupportedVersion { got: version });
        }

        let tree_size = cursor.read_u64("tree_size")?;
        let hash_len = cursor.read_u8("root_hash.len")?;
        let root_hash = cursor.read_bytes(usize::from(hash_len), "root_hash")?;
        let timestamp_nanos = cursor.read_u64("timestamp_nanos")?;
        let revision = cursor.read_u64("revision")?;
        let metadata_len = cursor.read_u16("metadata.len")?;
        let metadata = cursor.read_bytes(usize::from(metadata_len), "metadata")?;
        cursor.ensure_exhausted()?;

        Ok(Self {
            tree_size,
            root_hash,
            timestamp_nanos,
            revision,
            metadata,
        })
    }
}

/// A [`LogRootV1`] in canonical encoding, paired with a signature over
/// those bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignedLogRoot {
    /// Canonical [`LogRootV1`] bytes.
    pub log_root: Vec<u8>,
    /// Signature over `log_root`.
    pub signature: Vec<u8>,
}

/// Bounded big-endian reader over an encoded log root.
struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn read_bytes(&mut self, n: usize, field: &'static str) -> Result<Vec<u8>, LogRootError> {
        if self.bytes.len() < n {
            return Err(LogRootError::Truncated { field });
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head.to_vec())
    }

    fn read_array<const N: usize>(
        &mut self,
        field: &'static str,
    ) -> Result<[u8; N], LogRootError> {
        if self.bytes.len() < N {
            return Err(LogRootError::Truncated { field });
        }
        let (head, tail) = self.bytes.split_at(N);
        self.bytes = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, LogRootError> {
        Ok(self.read_array::<1>(field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, LogRootError> {
        Ok(u16::from_be_bytes(self.read_array::<2>(field)?))
    }

    fn read_u64(&mut self, field: &'static str) -> Result<u64, LogRootError> {
        Ok(u64::from_be_bytes(self.read_array::<8>(field)?))
    }

    fn ensure_exhausted(&self) -> Result<(), LogRootError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(LogRootError::TrailingBytes {
                remaining: self.bytes.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_root() -> LogRootV1 {
        LogRootV1 {
            tree_size: 42,
            root_hash: vec![0x5a; 32],
            timestamp_nanos: 1_234_567_890,
            revision: 17,
            metadata: b"deployment".to_vec(),
        }
    }

    #[test]
    fn canonical_encoding_round_trips() {
        let root = sample_root();
        let bytes = root.to_canonical_bytes().expect("encode");
        let decoded = LogRootV1::from_canonical_bytes(&bytes).expect("decode");
        assert_eq!(decoded, root);
    }

    #[test]
    fn empty_fields_round_trip() {
        let root = LogRootV1::default();
        let bytes = root.to_canonical_bytes().expect("encode");
        assert_eq!(LogRootV1::from_canonical_bytes(&bytes).expect("decode"), root);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = sample_root().to_canonical_bytes().expect("encode");
        bytes[1] = 2;
        assert_eq!(
            LogRootV1::from_canonical_bytes(&bytes),
            Err(LogRootError::UnsupportedVersion { got: 2 })
        );
    }

    #[test]
    fn truncated_input_rejected() {
        let bytes = sample_root().to_canonical_bytes().expect("encode");
        for cut in [0, 1, 5, 12, bytes.len() - 1] {
            let err = LogRootV1::from_canonical_bytes(&bytes[..cut]);
            assert!(
                matches!(err, Err(LogRootError::Truncated { .. })),
                "prefix of {cut} bytes decoded to {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample_root().to_canonical_bytes().expect("encode");
        bytes.push(0);
        assert_eq!(
            LogRootV1::from_canonical_bytes(&bytes),
            Err(LogRootError::TrailingBytes { remaining: 1 })
        );
    }

    #[test]
    fn oversize_root_hash_rejected_at_encode() {
        let root = LogRootV1 {
            root_hash: vec![0; 256],
            ..LogRootV1::default()
        };
        assert_eq!(
            root.to_canonical_bytes(),
            Err(LogRootError::RootHashTooLong { len: 256 })
        );
    }

    #[test]
    fn oversize_input_rejected_before_decode() {
        let bytes = vec![0u8; MAX_LOG_ROOT_BYTES + 1];
        assert!(matches!(
            LogRootV1::from_canonical_bytes(&bytes),
            Err(LogRootError::TooLarge { .. })
        ));
    }
}
