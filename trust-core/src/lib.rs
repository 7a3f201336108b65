//! # trust-core
//!
//! Pure logic for 0k-Trust (no I/O, instant tests).
//!
//! This crate implements trust-circle formation, the per-view key
//! hierarchy, the peer session coder and the flag-driven state machine
//! without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! Every operation here takes a value and returns a new one. Circle and
//! key hierarchy snapshots are never edited in place by their readers;
//! the async engine in `trust-engine` owns them, runs these functions on
//! its single owner task and publishes the results.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod circle;
pub mod crypto;
pub mod error;
pub mod fsm;
pub mod identity;
pub mod keys;
pub mod session;

pub use backoff::Backoff;
pub use circle::{
    Circle, CircleChange, CircleDigest, CircleError, CircleStatus, MachineList, Membership,
    MergeOutcome, Merged,
};
pub use crypto::{CryptoError, SymmetricKey};
pub use error::{Classify, ErrorClass};
pub use fsm::{
    Condition, Dispatch, Failure, MachineSnapshot, OpResult, Outcome, Pending, Poll, StateMachine,
};
pub use identity::{Description, EncryptionPublicKey, IdentityError, IdentitySeed, LocalIdentity, PeerInfo};
pub use keys::{KeyError, KeyHierarchy, KeySet, LockState, Rotation, TlkShare};
pub use session::{Frame, Incoming, SessionCoder, SessionError, SessionState};
