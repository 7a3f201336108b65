//! Persistence for account engines.
//!
//! An account's whole durable state is one [`PersistedAccount`] value,
//! saved after every batch of operations. Circle snapshots are also kept
//! in an append-only history: they are superseded, never deleted.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::account::machine::EngineSnapshot;
use crate::error::StoreError;
use crate::status::AccountStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use zerok_trust_core::{Circle, CircleChange, KeyHierarchy, PeerInfo};
use zerok_trust_types::{AccountId, BlobKey, Cursor, ViewName};

/// A blob waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outgoing {
    /// Relay key.
    pub key: BlobKey,
    /// Encoded envelope.
    pub blob: Vec<u8>,
}

/// Work the engine has accepted but not finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWork {
    /// Membership changes not yet applied.
    pub queued: VecDeque<CircleChange>,
    /// Applied changes not yet seen in an adopted snapshot.
    pub unconfirmed: Vec<CircleChange>,
    /// Views to rotate.
    pub rotations: Vec<ViewName>,
    /// Blobs to push, oldest first.
    pub outbox: VecDeque<Outgoing>,
    /// Consecutive failed push attempts.
    pub push_attempts: u32,
    /// Consecutive failed fetch attempts.
    pub fetch_attempts: u32,
    /// Whether at least one fetch has completed.
    pub fetched_once: bool,
}

/// Everything an account engine persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAccount {
    /// The local device's signed peer record.
    pub local_peer: PeerInfo,
    /// Last accepted circle snapshot.
    pub circle: Option<Circle>,
    /// Every key set and share.
    pub keys: KeyHierarchy,
    /// State machine state and flags.
    pub machine: EngineSnapshot,
    /// Relay position.
    pub cursor: Cursor,
    /// Unfinished work.
    pub work: PendingWork,
    /// Last published status.
    pub status: AccountStatus,
}

impl PersistedAccount {
    /// Encode to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| StoreError::Encoding(e.to_string()))
    }

    /// Decode from MessagePack.
    pub fn from_bytes(account: &AccountId, bytes: &[u8]) -> Result<Self, StoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decoding {
            account: account.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Trait for account persistence backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load an account's state, if any was saved.
    async fn load(&self, account: &AccountId) -> Result<Option<PersistedAccount>, StoreError>;

    /// Replace an account's state.
    async fn save(&self, account: &AccountId, state: &PersistedAccount) -> Result<(), StoreError>;

    /// Drop an account's state. Returns whether anything was stored.
    ///
    /// The circle history is kept.
    async fn delete(&self, account: &AccountId) -> Result<bool, StoreError>;

    /// Every account with saved state.
    async fn list_accounts(&self) -> Result<Vec<AccountId>, StoreError>;

    /// Append a circle snapshot to the account's history.
    ///
    /// Recording the same snapshot twice is a no-op.
    async fn record_circle(&self, account: &AccountId, circle: &Circle) -> Result<(), StoreError>;

    /// The account's circle history, oldest generation first.
    async fn circle_history(&self, account: &AccountId) -> Result<Vec<Circle>, StoreError>;
}
