//! Error types for the 0k-Trust wire layer.

use thiserror::Error;

/// Errors that can occur while encoding or decoding relay blobs.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid blob kind discriminator
    #[error("invalid blob kind: {0}")]
    InvalidBlobKind(u8),

    /// Invalid protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Envelope kind does not match what the caller expected
    #[error("unexpected blob kind: expected {expected:?}, got {actual:?}")]
    UnexpectedKind {
        /// Kind the caller asked for.
        expected: crate::BlobKind,
        /// Kind found in the envelope.
        actual: crate::BlobKind,
    },
}
