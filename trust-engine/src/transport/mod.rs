//! Transport abstraction for 0k-Trust.
//!
//! The engine talks to an untrusted relay through two calls:
//! - `push()` stores an opaque blob under a [`BlobKey`]
//! - `pull()` returns everything stored after a cursor
//!
//! The relay orders blobs by cursor. It never sees plaintext: circle
//! snapshots are signed, shares are sealed to their receiver and session
//! frames are encrypted.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.push(&BlobKey::circle("ring"), bytes).await?;
//! let pulled = transport.pull(Cursor::zero(), 100).await?;
//! ```

mod limited;
mod mock;

pub use limited::RateLimitedTransport;
pub use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;
use zerok_trust_types::{BlobKey, Cursor};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The relay could not be reached.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// The relay refused the request.
    #[error("relay rejected request: {0}")]
    Rejected(String),

    /// A local or relay rate limit was hit.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The request timed out.
    #[error("request timeout")]
    Timeout,
}

/// A blob returned by `pull()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayItem {
    /// Relay-assigned position.
    pub cursor: Cursor,
    /// Key the blob was pushed under.
    pub key: BlobKey,
    /// Opaque payload.
    pub blob: Vec<u8>,
}

/// Result of a `pull()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pulled {
    /// Blobs after the requested cursor, in cursor order.
    pub items: Vec<RelayItem>,
    /// Cursor to pass to the next `pull()`.
    pub token: Cursor,
}

/// Transport trait for exchanging blobs with the relay.
///
/// Implementations handle the underlying mechanism (network relay, mock).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Store `blob` under `key`.
    async fn push(&self, key: &BlobKey, blob: Vec<u8>) -> Result<(), TransportError>;

    /// Fetch up to `limit` blobs stored after `since`.
    async fn pull(&self, since: Cursor, limit: u32) -> Result<Pulled, TransportError>;
}
