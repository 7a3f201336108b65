//! Per-account engine.
//!
//! Each account is driven by one owner task. Every mutation of the
//! circle, the key hierarchy and the state machine happens on that task;
//! callers talk to it through an [`AccountEngine`] handle, which sends
//! commands over a channel and reads published snapshots.
//!
//! # Example
//!
//! ```ignore
//! let engine = AccountEngine::spawn(
//!     AccountId::new("alice"),
//!     config,
//!     identity,
//!     MachineList::unrestricted(),
//!     transport,
//!     Arc::new(MemoryStore::new()),
//! )
//! .await?;
//!
//! engine.join().await?;
//! let key_set = engine.wait_for_key_set(&ViewName::new("passwords")).await?;
//! ```

pub mod machine;
mod worker;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::limits::RateLimits;
use crate::status::{AccountSnapshot, AccountStatus};
use crate::store::StateStore;
use crate::transport::{RateLimitedTransport, Transport};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use worker::Worker;
use zerok_trust_core::{KeySet, LocalIdentity, LockState, MachineList};
use zerok_trust_types::{AccountId, PeerId, ViewName};

/// Queue depth of the command channel.
const COMMAND_CAPACITY: usize = 64;

/// Capacity of the incoming message broadcast.
const MESSAGE_CAPACITY: usize = 256;

/// A payload received from another circle member over a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    /// Sender.
    pub from: PeerId,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}

/// Requests sent to the owner task.
#[derive(Debug)]
pub(crate) enum Command {
    Join,
    Accept(PeerId),
    Reject(PeerId),
    Remove(PeerId),
    Retire,
    Fetch,
    Rotate(ViewName),
    SetLockState(LockState),
    Reset,
    Send { to: PeerId, payload: Vec<u8> },
    Settle(oneshot::Sender<AccountStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running account engine.
///
/// Cheap to clone. Commands return once the owner task has queued the
/// work; use [`settle`](Self::settle) to wait until it has run.
#[derive(Debug, Clone)]
pub struct AccountEngine {
    account: AccountId,
    local_peer: PeerId,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<AccountSnapshot>>,
    messages: broadcast::Sender<PeerMessage>,
}

impl AccountEngine {
    /// Load or create the account's state and start its owner task.
    ///
    /// Pushes go through a [`RateLimitedTransport`] built from
    /// `config.limits`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the store cannot be read, or
    /// the stored state belongs to a different device.
    pub async fn spawn<T>(
        account: AccountId,
        config: EngineConfig,
        identity: LocalIdentity,
        machines: MachineList,
        transport: T,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError>
    where
        T: Transport + 'static,
    {
        config.validate()?;
        let limits = RateLimits::new(&config.limits)?;
        let transport: Arc<dyn Transport> = Arc::new(RateLimitedTransport::new(transport, limits));

        let persisted = store.load(&account).await?;
        let worker = Worker::new(
            account.clone(),
            config,
            identity,
            machines,
            transport,
            store,
            persisted,
        )?;
        let local_peer = worker.local_peer_id();
        let snapshots = worker.subscribe();
        let messages = worker.message_sender();

        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(worker.run(receiver));
        tracing::info!("Started engine for account {} as {}", account, local_peer);

        Ok(Self {
            account,
            local_peer,
            commands,
            snapshots,
            messages,
        })
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// The account this engine serves.
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// This device's peer id.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    // ===========================================
    // Circle Operations
    // ===========================================

    /// Join the account's circle, founding it if the relay has none.
    pub async fn join(&self) -> Result<(), EngineError> {
        self.send(Command::Join).await
    }

    /// Accept an applicant. Missing shares are issued afterwards.
    pub async fn accept(&self, applicant: PeerId) -> Result<(), EngineError> {
        self.send(Command::Accept(applicant)).await
    }

    /// Reject an applicant.
    pub async fn reject(&self, applicant: PeerId) -> Result<(), EngineError> {
        self.send(Command::Reject(applicant)).await
    }

    /// Remove a member and rotate every view it could read.
    pub async fn remove(&self, peer: PeerId) -> Result<(), EngineError> {
        self.send(Command::Remove(peer)).await
    }

    /// Leave the circle. The engine halts afterwards.
    pub async fn retire(&self) -> Result<(), EngineError> {
        self.send(Command::Retire).await
    }

    /// Rotate a view's key set.
    pub async fn rotate(&self, view: ViewName) -> Result<(), EngineError> {
        self.send(Command::Rotate(view)).await
    }

    /// Pull from the relay now.
    pub async fn fetch(&self) -> Result<(), EngineError> {
        self.send(Command::Fetch).await
    }

    /// Report whether the device is unlocked.
    pub async fn set_lock_state(&self, lock_state: LockState) -> Result<(), EngineError> {
        self.send(Command::SetLockState(lock_state)).await
    }

    /// Leave the error state.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.send(Command::Reset).await
    }

    // ===========================================
    // Sessions
    // ===========================================

    /// Send `payload` to another member over an encrypted session.
    pub async fn send_to(&self, to: PeerId, payload: Vec<u8>) -> Result<(), EngineError> {
        self.send(Command::Send { to, payload }).await
    }

    /// Receive payloads other members send to this device.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<PeerMessage> {
        self.messages.subscribe()
    }

    // ===========================================
    // Observation
    // ===========================================

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<AccountSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// A receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<AccountSnapshot>> {
        self.snapshots.clone()
    }

    /// The latest published status.
    pub fn status(&self) -> AccountStatus {
        self.snapshots.borrow().status.clone()
    }

    /// The key set new data in `view` must be written under, if any.
    pub fn current_key_set(&self, view: &ViewName) -> Option<KeySet> {
        self.snapshots.borrow().current_key_set(view).cloned()
    }

    /// Wait until `view` has a current key set.
    ///
    /// Never returns a missing key: callers must not write unencrypted.
    pub async fn wait_for_key_set(&self, view: &ViewName) -> Result<KeySet, EngineError> {
        let mut snapshots = self.snapshots.clone();
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if let Some(key_set) = snapshot.current_key_set(view) {
                    return Ok(key_set.clone());
                }
            }
            snapshots.changed().await.map_err(|_| EngineError::Closed)?;
        }
    }

    /// Wait until every queued operation has run, then return the status.
    ///
    /// Operations parked on a deadline or an unlock do not hold this up.
    pub async fn settle(&self) -> Result<AccountStatus, EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Settle(reply)).await?;
        response.await.map_err(|_| EngineError::Closed)
    }

    /// Persist state and stop the owner task.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        response.await.map_err(|_| EngineError::Closed)
    }
}
