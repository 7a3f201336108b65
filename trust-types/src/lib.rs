//! # trust-types
//!
//! Identity, ordering and envelope types for the 0k-Trust circle protocol.
//!
//! This crate provides the foundational types used across all 0k-Trust crates:
//! - [`PeerId`], [`KeyUuid`], [`ViewName`], [`AccountId`] - Identity types
//! - [`Generation`], [`Cursor`] - Ordering types
//! - [`BlobKey`], [`Envelope`] - Relay addressing and framing
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;

pub use envelope::{Envelope, ENVELOPE_VERSION};
pub use error::WireError;
pub use ids::{
    AccountId, BlobKey, BlobKind, Cursor, Destination, Generation, KeyUuid, PeerId, ViewName,
};
