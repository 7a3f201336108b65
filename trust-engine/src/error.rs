//! Error types for the trust engine.

use crate::config::ConfigError;
use crate::transport::TransportError;
use zerok_trust_core::{
    CircleError, Classify, CryptoError, ErrorClass, IdentityError, KeyError, SessionError,
};
use zerok_trust_types::{PeerId, WireError};

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Circle operation failed.
    #[error("circle error: {0}")]
    Circle(#[from] CircleError),

    /// Key hierarchy operation failed.
    #[error("key error: {0}")]
    Keys(#[from] KeyError),

    /// Session coder failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Peer record failed.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Crypto primitive failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Relay exchange failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistence failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Blob framing failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Configuration is unusable.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persisted state belongs to a different device.
    #[error("persisted account belongs to {stored}, not {local}")]
    IdentityMismatch {
        /// Peer recorded in the store.
        stored: PeerId,
        /// Peer supplied at startup.
        local: PeerId,
    },

    /// The operation requires circle membership.
    #[error("device is not a member of the circle")]
    NotInCircle,

    /// The engine has shut down.
    #[error("engine closed")]
    Closed,
}

impl Classify for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Circle(e) => e.class(),
            Self::Keys(e) => e.class(),
            Self::Session(e) => e.class(),
            Self::Identity(e) => e.class(),
            Self::Crypto(e) => e.class(),
            Self::Transport(_) | Self::Store(_) | Self::Closed => ErrorClass::Transport,
            Self::Wire(_) | Self::Config(_) | Self::IdentityMismatch { .. } => {
                ErrorClass::Integrity
            }
            Self::NotInCircle => ErrorClass::TrustGap,
        }
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// State could not be encoded.
    #[error("failed to encode account state: {0}")]
    Encoding(String),

    /// Stored bytes could not be decoded.
    #[error("failed to decode stored state for {account}: {reason}")]
    Decoding {
        /// The account whose row is unreadable.
        account: String,
        /// Decoder message.
        reason: String,
    },
}
