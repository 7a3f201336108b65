//! The owner task of one account.
//!
//! Runs the state machine until it is quiescent, persists and publishes
//! the result, then sleeps until a command, the next pending-flag
//! deadline or the poll interval wakes it.

use super::machine::{
    engine_machine, EngineFlag, EngineMachine, EngineOp, EnginePredicate, EngineState,
};
use super::{Command, PeerMessage};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::status::{AccountSnapshot, AccountStatus};
use crate::store::{Outgoing, PendingWork, PersistedAccount, StateStore};
use crate::transport::{RelayItem, Transport, TransportError};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};
use zerok_trust_core::{
    Backoff, Circle, CircleChange, CircleError, CircleStatus, Classify, Condition, Description,
    ErrorClass, Failure, Frame, KeyError, KeyHierarchy, KeySet, LocalIdentity, LockState,
    MachineList, MergeOutcome, Merged, OpResult, Outcome, PeerInfo, Poll, SessionCoder,
    SessionError, SessionState, TlkShare,
};
use zerok_trust_types::{
    AccountId, BlobKey, BlobKind, Cursor, Destination, Envelope, PeerId, ViewName, WireError,
};

type EngineFailure = Failure<EngineState, EngineFlag, EnginePredicate>;
type EngineResult = OpResult<EngineState, EngineFlag, EnginePredicate>;

/// Why an operation stopped early.
enum OpError {
    /// Classified by [`Worker::escalate`].
    Failed(EngineError),
    /// Already decided.
    Deferred(EngineFailure),
}

impl From<EngineError> for OpError {
    fn from(e: EngineError) -> Self {
        Self::Failed(e)
    }
}

impl From<CircleError> for OpError {
    fn from(e: CircleError) -> Self {
        Self::Failed(e.into())
    }
}

impl From<KeyError> for OpError {
    fn from(e: KeyError) -> Self {
        Self::Failed(e.into())
    }
}

impl From<WireError> for OpError {
    fn from(e: WireError) -> Self {
        Self::Failed(e.into())
    }
}

impl From<SessionError> for OpError {
    fn from(e: SessionError) -> Self {
        Self::Failed(e.into())
    }
}

type OpOutput = Result<Vec<EngineFlag>, OpError>;

fn wait_for_unlock(flag: EngineFlag) -> OpError {
    OpError::Deferred(Failure::Retry {
        flag,
        condition: Condition::Predicate(EnginePredicate::DeviceUnlocked),
        wait_state: Some(EngineState::WaitForUnlock),
    })
}

fn add_flags(flags: &mut Vec<EngineFlag>, more: impl IntoIterator<Item = EngineFlag>) {
    for flag in more {
        if !flags.contains(&flag) {
            flags.push(flag);
        }
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub(crate) struct Worker {
    account: AccountId,
    config: EngineConfig,
    identity: LocalIdentity,
    local_peer: PeerInfo,
    machines: MachineList,
    views: Vec<ViewName>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    backoff: Backoff,

    machine: EngineMachine,
    circle: Option<Circle>,
    keys: KeyHierarchy,
    cursor: Cursor,
    fetched_to: Cursor,
    work: PendingWork,
    health: AccountStatus,
    lock_state: LockState,

    inbox: VecDeque<RelayItem>,
    sessions: BTreeMap<PeerId, SessionCoder>,
    outgoing_messages: BTreeMap<PeerId, VecDeque<Vec<u8>>>,

    snapshots: watch::Sender<Arc<AccountSnapshot>>,
    messages: broadcast::Sender<PeerMessage>,
    settle_waiters: Vec<oneshot::Sender<AccountStatus>>,
}

impl Worker {
    /// Build the worker from persisted state, or fresh state if none.
    pub(crate) fn new(
        account: AccountId,
        config: EngineConfig,
        identity: LocalIdentity,
        machines: MachineList,
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
        persisted: Option<PersistedAccount>,
    ) -> Result<Self, EngineError> {
        let mut machine = engine_machine();
        let persisted = match persisted {
            Some(state) => {
                if state.local_peer.id() != identity.peer_id() {
                    return Err(EngineError::IdentityMismatch {
                        stored: state.local_peer.id(),
                        local: identity.peer_id(),
                    });
                }
                tracing::info!(
                    "Restored account {} at cursor {} in state {:?}",
                    account,
                    state.cursor,
                    state.machine.current
                );
                machine.restore(state.machine.clone());
                state
            }
            None => {
                let mut description = Description::new();
                description.insert("name".to_string(), config.account.device_name.clone());
                PersistedAccount {
                    local_peer: PeerInfo::create(&identity, description)?,
                    circle: None,
                    keys: KeyHierarchy::new(),
                    machine: machine.snapshot(),
                    cursor: Cursor::zero(),
                    work: PendingWork::default(),
                    status: AccountStatus::default(),
                }
            }
        };

        machine.set_flag(EngineFlag::FetchRequested);
        if !persisted.work.outbox.is_empty() {
            machine.set_flag(EngineFlag::PushPending);
        }

        let health = AccountStatus {
            degraded: persisted.status.degraded,
            last_error: persisted.status.last_error.clone(),
            last_warning: persisted.status.last_warning.clone(),
            ..AccountStatus::default()
        };
        let initial = AccountSnapshot {
            account: account.clone(),
            local_peer: persisted.local_peer.clone(),
            circle: persisted.circle.clone(),
            keys: persisted.keys.clone(),
            status: persisted.status.clone(),
        };
        let (snapshots, _) = watch::channel(Arc::new(initial));
        let (messages, _) = broadcast::channel(super::MESSAGE_CAPACITY);

        let worker = Self {
            views: config.account.view_names(),
            backoff: config.retry.backoff(),
            account,
            config,
            identity,
            local_peer: persisted.local_peer,
            machines,
            transport,
            store,
            machine,
            circle: persisted.circle,
            keys: persisted.keys,
            cursor: persisted.cursor,
            fetched_to: persisted.cursor,
            work: persisted.work,
            health,
            lock_state: LockState::Unlocked,
            inbox: VecDeque::new(),
            sessions: BTreeMap::new(),
            outgoing_messages: BTreeMap::new(),
            snapshots,
            messages,
            settle_waiters: Vec::new(),
        };
        worker.publish();
        Ok(worker)
    }

    pub(crate) fn local_peer_id(&self) -> PeerId {
        self.local_peer.id()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<AccountSnapshot>> {
        self.snapshots.subscribe()
    }

    pub(crate) fn message_sender(&self) -> broadcast::Sender<PeerMessage> {
        self.messages.clone()
    }

    // ===========================================
    // Owner Loop
    // ===========================================

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = self.config.fetch.poll_interval().map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut dirty = true;

        loop {
            if self.drive().await || dirty {
                self.persist().await;
                self.publish();
            }
            dirty = false;

            if !self.settle_waiters.is_empty() {
                let status = self.status();
                for waiter in self.settle_waiters.drain(..) {
                    let _ = waiter.send(status.clone());
                }
            }

            let delay = self
                .machine
                .next_deadline()
                .filter(|_| !self.machine.is_halted())
                .map(|deadline| {
                    deadline
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO)
                });

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.persist().await;
                        tracing::info!("Stopped engine for account {}", self.account);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => dirty = self.handle(command),
                    None => {
                        self.persist().await;
                        tracing::debug!("All handles for {} dropped, stopping", self.account);
                        break;
                    }
                },
                _ = sleep_for(delay) => {}
                _ = tick(&mut ticker) => {
                    self.machine.set_flag(EngineFlag::FetchRequested);
                }
            }
        }
    }

    /// Apply a command. Returns whether published state may have changed.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Join => self.machine.set_flag(EngineFlag::JoinRequested),
            Command::Accept(peer) => self.queue_change(CircleChange::Accept(peer)),
            Command::Reject(peer) => self.queue_change(CircleChange::Reject(peer)),
            Command::Remove(peer) => self.queue_change(CircleChange::Remove(peer)),
            Command::Retire => self.machine.set_flag(EngineFlag::RetireRequested),
            Command::Fetch => self.machine.set_flag(EngineFlag::FetchRequested),
            Command::Rotate(view) => {
                if !self.work.rotations.contains(&view) {
                    self.work.rotations.push(view);
                }
                self.machine.set_flag(EngineFlag::RotateKeys);
            }
            Command::SetLockState(lock_state) => {
                tracing::debug!("Account {} is now {:?}", self.account, lock_state);
                self.lock_state = lock_state;
                return false;
            }
            Command::Reset => self.machine.set_flag(EngineFlag::ResetRequested),
            Command::Send { to, payload } => {
                self.outgoing_messages.entry(to).or_default().push_back(payload);
                self.machine.set_flag(EngineFlag::SessionTraffic);
            }
            Command::Settle(reply) => {
                self.settle_waiters.push(reply);
                return false;
            }
            Command::Shutdown(_) => return false,
        }
        true
    }

    fn queue_change(&mut self, change: CircleChange) {
        self.work.queued.push_back(change);
        self.machine.set_flag(EngineFlag::ApplyChanges);
    }

    /// Run operations until nothing is runnable. Returns whether any ran.
    async fn drive(&mut self) -> bool {
        let mut ran = false;
        loop {
            let unlocked = self.lock_state == LockState::Unlocked;
            let dispatch = match self.machine.poll(SystemTime::now(), |predicate| match predicate {
                EnginePredicate::DeviceUnlocked => unlocked,
            }) {
                Poll::Run(dispatch) => dispatch,
                Poll::Quiescent | Poll::Halted => break,
            };
            ran = true;

            let op = dispatch.op;
            let result = match self.execute(op).await {
                Ok(flags) => Ok(flags),
                Err(OpError::Deferred(failure)) => Err(failure),
                Err(OpError::Failed(e)) => Err(self.escalate(op, e)),
            };
            let outcome = self.machine.complete(dispatch, result);
            self.log_outcome(outcome);
        }
        ran
    }

    async fn execute(&mut self, op: EngineOp) -> OpOutput {
        match op {
            EngineOp::Fetch => self.fetch(EngineFlag::FetchRequested).await,
            EngineOp::Process => self.process().await,
            EngineOp::Join => self.join().await,
            EngineOp::ApplyChanges => self.apply_changes().await,
            EngineOp::Rotate => self.rotate(),
            EngineOp::IssueShares => self.issue_shares(),
            EngineOp::Push => self.push().await,
            EngineOp::ConfirmPush => self.fetch(EngineFlag::ConfirmPush).await,
            EngineOp::EnsureKeys => self.ensure_keys(),
            EngineOp::FlushSessions => self.flush_sessions(),
            EngineOp::Retire => self.retire().await,
            EngineOp::Reset => Ok(self.reset()),
        }
    }

    fn log_outcome(&mut self, outcome: Outcome<EngineState, EngineFlag, EngineOp>) {
        match outcome {
            Outcome::Advanced { op, state, .. } => {
                tracing::debug!("{}: {:?} completed, now {:?}", self.account, op, state);
            }
            Outcome::Waiting { flag, state } => {
                tracing::debug!("{}: {:?} deferred, now {:?}", self.account, flag, state);
            }
            Outcome::Errored { op, reason } => {
                tracing::error!("{}: {:?} failed: {}", self.account, op, reason);
                self.health.last_error = Some(reason);
            }
            Outcome::Quiescent | Outcome::Halted => {}
        }
    }

    /// Map an error to the failure policy of its class.
    fn escalate(&mut self, op: EngineOp, error: EngineError) -> EngineFailure {
        match error.class() {
            ErrorClass::Integrity | ErrorClass::Crypto => {
                Failure::Fatal(format!("{:?}: {}", op, error))
            }
            ErrorClass::TrustGap => {
                tracing::debug!("{}: {:?} waiting for trust: {}", self.account, op, error);
                self.trust_gap()
            }
            ErrorClass::Transport => {
                tracing::warn!("{}: {:?} failed: {}", self.account, op, error);
                self.retry_after(op.trigger(), 1)
            }
        }
    }

    /// Re-check keys after the trust-gap delay, fetching first.
    fn trust_gap(&mut self) -> EngineFailure {
        let at = SystemTime::now() + self.config.fetch.trust_gap_retry();
        self.machine
            .set_pending_flag(EngineFlag::FetchRequested, Condition::At(at));
        Failure::Retry {
            flag: EngineFlag::EnsureKeys,
            condition: Condition::At(at),
            wait_state: Some(EngineState::WaitForTrust),
        }
    }

    fn retry_after(&self, flag: EngineFlag, attempt: u32) -> EngineFailure {
        Failure::Retry {
            flag,
            condition: Condition::At(SystemTime::now() + self.backoff.delay(attempt)),
            wait_state: None,
        }
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{}: {}", self.account, message);
        self.health.last_warning = Some(message);
    }

    // ===========================================
    // Persistence and Publication
    // ===========================================

    fn status(&self) -> AccountStatus {
        let me = self.local_peer.id();
        let state = *self.machine.current();
        let circle_status = match (&self.circle, state) {
            (_, EngineState::Retired) => CircleStatus::Retired,
            (Some(circle), _) => circle.status_for(&me),
            (None, _) => CircleStatus::NotInCircle,
        };
        let pending_applicants = match &self.circle {
            Some(circle) if circle.is_member(&me) => circle.pending_applicant_count(),
            _ => 0,
        };
        AccountStatus {
            circle_status,
            pending_applicants,
            state,
            waiting: state.is_waiting(),
            degraded: self.health.degraded,
            generation: self.circle.as_ref().map(Circle::generation),
            last_error: self.health.last_error.clone(),
            last_warning: self.health.last_warning.clone(),
        }
    }

    async fn persist(&self) {
        let state = PersistedAccount {
            local_peer: self.local_peer.clone(),
            circle: self.circle.clone(),
            keys: self.keys.clone(),
            machine: self.machine.snapshot(),
            cursor: self.cursor,
            work: self.work.clone(),
            status: self.status(),
        };
        if let Err(e) = self.store.save(&self.account, &state).await {
            tracing::error!("Failed to persist account {}: {}", self.account, e);
        }
    }

    fn publish(&self) {
        let snapshot = AccountSnapshot {
            account: self.account.clone(),
            local_peer: self.local_peer.clone(),
            circle: self.circle.clone(),
            keys: self.keys.clone(),
            status: self.status(),
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    async fn record_circle(&self, circle: &Circle) {
        if let Err(e) = self.store.record_circle(&self.account, circle).await {
            tracing::warn!("Failed to record circle history for {}: {}", self.account, e);
        }
    }

    fn is_member(&self) -> bool {
        let me = self.local_peer.id();
        self.circle.as_ref().map_or(false, |circle| circle.is_member(&me))
    }

    // ===========================================
    // Outbox
    // ===========================================

    fn enqueue<T: Serialize>(&mut self, key: BlobKey, value: &T) -> Result<(), EngineError> {
        let blob = Envelope::seal(key.kind(), self.local_peer.id(), value)?.to_bytes()?;
        self.work.outbox.push_back(Outgoing { key, blob });
        Ok(())
    }

    fn enqueue_circle(&mut self, circle: &Circle) -> Result<(), EngineError> {
        self.enqueue(BlobKey::circle(circle.name()), circle)
    }

    fn enqueue_shares(&mut self, key_set: &KeySet, shares: &[TlkShare]) -> Result<(), EngineError> {
        if shares.is_empty() {
            return Ok(());
        }
        let key = BlobKey::shares(key_set.view(), &key_set.uuid(), &self.local_peer.id());
        self.enqueue(key, &shares)
    }

    /// Push the outbox in order, stopping at the first failure.
    async fn push_outbox(&mut self) -> Result<usize, (BlobKey, TransportError)> {
        let mut pushed = 0;
        while let Some(outgoing) = self.work.outbox.front() {
            let key = outgoing.key.clone();
            let blob = outgoing.blob.clone();
            self.transport
                .push(&key, blob)
                .await
                .map_err(|e| (key.clone(), e))?;
            self.work.outbox.pop_front();
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Pull every page after the last fetched cursor into the inbox.
    async fn pull_all(&mut self) -> Result<usize, TransportError> {
        let page_size = self.config.fetch.page_size;
        let mut pulled = 0;
        loop {
            let page = self.transport.pull(self.fetched_to, page_size).await?;
            let count = page.items.len();
            pulled += count;
            self.inbox.extend(page.items);
            if page.token > self.fetched_to {
                self.fetched_to = page.token;
            }
            if count < page_size as usize {
                return Ok(pulled);
            }
        }
    }

    fn record_fetch_failure(&mut self, error: &TransportError) -> u32 {
        self.work.fetch_attempts = self.work.fetch_attempts.saturating_add(1);
        let attempts = self.work.fetch_attempts;
        tracing::warn!(
            "Fetch for {} failed (attempt {}): {}",
            self.account,
            attempts,
            error
        );
        self.note_attempts(attempts);
        attempts
    }

    fn note_attempts(&mut self, attempts: u32) {
        if attempts >= self.config.retry.max_attempts && !self.health.degraded {
            tracing::warn!(
                "Relay unavailable for {} after {} attempts, marking degraded",
                self.account,
                attempts
            );
            self.health.degraded = true;
        }
    }

    // ===========================================
    // Relay Operations
    // ===========================================

    async fn fetch(&mut self, flag: EngineFlag) -> OpOutput {
        match self.pull_all().await {
            Ok(pulled) => {
                if pulled > 0 {
                    tracing::debug!("Fetched {} blob(s) for {}", pulled, self.account);
                }
                self.work.fetch_attempts = 0;
                self.work.fetched_once = true;
                if self.work.outbox.is_empty() {
                    self.health.degraded = false;
                }
                Ok(if self.inbox.is_empty() {
                    vec![]
                } else {
                    vec![EngineFlag::ProcessIncoming]
                })
            }
            Err(e) => {
                let attempts = self.record_fetch_failure(&e);
                Err(OpError::Deferred(self.retry_after(flag, attempts)))
            }
        }
    }

    async fn push(&mut self) -> OpOutput {
        match self.push_outbox().await {
            Ok(0) => Ok(vec![]),
            Ok(pushed) => {
                tracing::debug!("Pushed {} blob(s) for {}", pushed, self.account);
                self.work.push_attempts = 0;
                self.health.degraded = false;
                Ok(vec![EngineFlag::ConfirmPush])
            }
            Err((key, e)) => {
                self.work.push_attempts = self.work.push_attempts.saturating_add(1);
                let attempts = self.work.push_attempts;
                tracing::warn!(
                    "Push of {} for {} failed (attempt {}): {}",
                    key,
                    self.account,
                    attempts,
                    e
                );
                self.note_attempts(attempts);
                Err(OpError::Deferred(
                    self.retry_after(EngineFlag::PushPending, attempts),
                ))
            }
        }
    }

    // ===========================================
    // Incoming Blobs
    // ===========================================

    async fn process(&mut self) -> OpOutput {
        let mut follow_ups = Vec::new();
        while let Some(item) = self.inbox.pop_front() {
            let result = self.process_item(&item).await;
            if item.cursor > self.cursor {
                self.cursor = item.cursor;
            }
            add_flags(&mut follow_ups, result?);
        }
        Ok(follow_ups)
    }

    async fn process_item(&mut self, item: &RelayItem) -> OpOutput {
        let envelope = match Envelope::from_bytes(&item.blob) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.warn(format!("skipped unreadable blob {}: {}", item.key, e));
                return Ok(vec![]);
            }
        };
        if envelope.sender == self.local_peer.id() {
            return Ok(vec![]);
        }
        match item.key.kind() {
            BlobKind::Circle => self.process_circle(&envelope).await,
            BlobKind::Shares => Ok(self.process_shares(&item.key, &envelope)),
            BlobKind::Session => self.process_session(&item.key, &envelope),
        }
    }

    async fn process_circle(&mut self, envelope: &Envelope) -> OpOutput {
        let remote: Circle = match envelope.open(BlobKind::Circle) {
            Ok(circle) => circle,
            Err(e) => {
                self.warn(format!("skipped circle from {}: {}", envelope.sender, e));
                return Ok(vec![]);
            }
        };
        if remote.name() != self.config.account.circle_name {
            tracing::debug!("Ignoring circle {} for {}", remote.name(), self.account);
            return Ok(vec![]);
        }

        let merged = match self.circle.as_ref() {
            Some(local) => Circle::merge(local, &remote)?,
            None => {
                remote.verify()?;
                Merged {
                    circle: remote,
                    outcome: MergeOutcome::RemoteNewer,
                }
            }
        };

        match merged.outcome {
            MergeOutcome::Identical => {
                let me = self.local_peer.id();
                self.work
                    .unconfirmed
                    .retain(|change| !change.is_reflected_in(&merged.circle, &me));
                self.circle = Some(merged.circle);
                Ok(vec![])
            }
            MergeOutcome::LocalNewer | MergeOutcome::TieLocalWon => Ok(vec![]),
            MergeOutcome::Unverified => {
                tracing::debug!(
                    "Kept generation {} for {}: sibling from {} signed by no member",
                    merged.circle.generation(),
                    self.account,
                    envelope.sender
                );
                Ok(vec![])
            }
            MergeOutcome::RemoteNewer | MergeOutcome::TieRemoteWon => {
                if self.circle.is_none() || merged.circle.is_genesis() {
                    self.check_provisioned(&merged.circle)?;
                }
                self.adopt(merged.circle, merged.outcome).await
            }
        }
    }

    /// A circle taken on trust must only list provisioned machines.
    fn check_provisioned(&self, circle: &Circle) -> Result<(), EngineError> {
        match circle.peers().keys().find(|peer| !self.machines.allows(peer)) {
            Some(peer) => Err(CircleError::Integrity {
                reason: format!("unprovisioned member {}", peer),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Replace the local circle with a snapshot that won a merge.
    async fn adopt(&mut self, circle: Circle, outcome: MergeOutcome) -> OpOutput {
        let me = self.local_peer.id();
        let was_member = self.is_member();
        let member = circle.is_member(&me);
        tracing::info!(
            "Adopted circle {} generation {} for {} ({:?})",
            circle.name(),
            circle.generation(),
            self.account,
            outcome
        );
        self.record_circle(&circle).await;

        let mut follow_ups = vec![EngineFlag::EnsureKeys];

        let mut lost = Vec::new();
        for change in std::mem::take(&mut self.work.unconfirmed) {
            if !change.is_reflected_in(&circle, &me) {
                lost.push(change);
            }
        }
        if !lost.is_empty() {
            tracing::info!(
                "Resubmitting {} change(s) for {} on generation {}",
                lost.len(),
                self.account,
                circle.generation()
            );
            for change in lost.into_iter().rev() {
                self.work.queued.push_front(change);
            }
            follow_ups.push(EngineFlag::ApplyChanges);
        }

        let circle = if member && !circle.signatures().contains_key(&me) {
            let signed = circle.countersign(&self.identity)?;
            self.enqueue_circle(&signed)?;
            follow_ups.push(EngineFlag::PushPending);
            signed
        } else {
            circle
        };

        if was_member && !member {
            tracing::warn!("{} is no longer a member of {}", me, circle.name());
            self.keys.relinquish();
            self.sessions.clear();
            self.outgoing_messages.clear();
        } else {
            self.sessions.retain(|peer, _| circle.is_member(peer));
        }
        if member {
            let previous = self.circle.take();
            if self.rotate_after_retirement(previous.as_ref(), &circle) {
                follow_ups.push(EngineFlag::RotateKeys);
            }
            follow_ups.push(EngineFlag::IssueShares);
        }

        self.circle = Some(circle);
        Ok(follow_ups)
    }

    fn process_shares(&mut self, key: &BlobKey, envelope: &Envelope) -> Vec<EngineFlag> {
        let shares: Vec<TlkShare> = match envelope.open(BlobKind::Shares) {
            Ok(shares) => shares,
            Err(e) => {
                self.warn(format!("skipped shares {}: {}", key, e));
                return vec![];
            }
        };
        if shares.iter().any(|share| share.sender() != envelope.sender) {
            self.warn(format!("skipped shares {} relayed for another sender", key));
            return vec![];
        }

        self.keys.record_shares(&shares);
        let me = self.local_peer.id();
        if shares.iter().any(|share| share.receiver() == me) {
            vec![EngineFlag::EnsureKeys]
        } else {
            vec![]
        }
    }

    fn process_session(&mut self, key: &BlobKey, envelope: &Envelope) -> OpOutput {
        let me = self.local_peer.id();
        if key.destination() != Destination::Peer(me) {
            return Ok(vec![]);
        }
        let frame: Frame = match envelope.open(BlobKind::Session) {
            Ok(frame) => frame,
            Err(e) => {
                self.warn(format!("skipped session frame {}: {}", key, e));
                return Ok(vec![]);
            }
        };

        let sender = envelope.sender;
        let remote = self
            .circle
            .as_ref()
            .filter(|circle| circle.is_member(&me))
            .and_then(|circle| circle.peers().get(&sender))
            .cloned();
        let Some(remote) = remote else {
            self.warn(format!("ignored session frame from non-member {}", sender));
            return Ok(vec![]);
        };

        let coder = self
            .sessions
            .entry(sender)
            .or_insert_with(|| SessionCoder::new(remote));
        let ended = matches!(coder.state(), SessionState::Faulted | SessionState::Retired);
        if ended && matches!(frame, Frame::Hello(_)) {
            tracing::debug!("Restarting {:?} session with {} on hello", coder.state(), sender);
            coder.reset();
        }
        let result = coder.handle_incoming(&self.identity, &frame);
        let state = coder.state();
        let waiting = self
            .outgoing_messages
            .get(&sender)
            .map_or(false, |queue| !queue.is_empty());
        let incoming = match result {
            Ok(incoming) => incoming,
            Err(e) => {
                self.warn(format!("session with {} failed: {}", sender, e));
                let stalled = matches!(
                    state,
                    SessionState::Uninitialized | SessionState::Faulted | SessionState::Retired
                );
                if stalled && matches!(frame, Frame::Data { .. }) {
                    // The sender still holds keys this side no longer has.
                    return self.restart_session(sender);
                }
                return Ok(if waiting && stalled {
                    vec![EngineFlag::SessionTraffic]
                } else {
                    vec![]
                });
            }
        };

        let mut follow_ups = Vec::new();
        if let Some(reply) = incoming.reply {
            self.enqueue(BlobKey::session(&me, &sender), &reply)?;
            follow_ups.push(EngineFlag::PushPending);
        }
        if let Some(payload) = incoming.plaintext {
            if self
                .messages
                .send(PeerMessage {
                    from: sender,
                    payload,
                })
                .is_err()
            {
                tracing::debug!("No subscriber for message from {}", sender);
            }
        }
        if waiting && state != SessionState::Negotiating {
            follow_ups.push(EngineFlag::SessionTraffic);
        }
        Ok(follow_ups)
    }

    /// Open a fresh handshake with `peer`, dropping any ended session.
    fn restart_session(&mut self, peer: PeerId) -> OpOutput {
        let me = self.local_peer.id();
        let Some(coder) = self.sessions.get_mut(&peer) else {
            return Ok(vec![]);
        };
        if coder.state() != SessionState::Uninitialized {
            coder.reset();
        }
        let hello = match coder.start(&self.identity) {
            Ok(hello) => hello,
            Err(e) => {
                self.warn(format!("handshake with {} failed: {}", peer, e));
                return Ok(vec![]);
            }
        };
        tracing::debug!("Restarting session with {} for {}", peer, self.account);
        self.enqueue(BlobKey::session(&me, &peer), &hello)?;
        Ok(vec![EngineFlag::PushPending])
    }

    // ===========================================
    // Membership
    // ===========================================

    async fn join(&mut self) -> OpOutput {
        if let Err(e) = self.pull_all().await {
            let attempts = self.record_fetch_failure(&e);
            return Err(OpError::Deferred(
                self.retry_after(EngineFlag::JoinRequested, attempts),
            ));
        }
        self.work.fetch_attempts = 0;
        self.work.fetched_once = true;
        let mut follow_ups = self.process().await?;

        let me = self.local_peer.id();
        match self.circle.as_ref().map(|circle| circle.status_for(&me)) {
            Some(CircleStatus::InCircle) | Some(CircleStatus::Applying) => Ok(follow_ups),
            Some(_) => {
                let already_queued = self
                    .work
                    .queued
                    .iter()
                    .any(|change| matches!(change, CircleChange::Apply(info) if info.id() == me));
                if !already_queued {
                    tracing::info!("{} applying to circle for {}", me, self.account);
                    self.work
                        .queued
                        .push_back(CircleChange::Apply(self.local_peer.clone()));
                }
                add_flags(&mut follow_ups, [EngineFlag::ApplyChanges]);
                Ok(follow_ups)
            }
            None => {
                add_flags(&mut follow_ups, self.found().await?);
                Ok(follow_ups)
            }
        }
    }

    /// Create the genesis circle and the first key set of every view.
    async fn found(&mut self) -> OpOutput {
        let circle = Circle::new(
            &self.config.account.circle_name,
            &self.local_peer,
            &self.identity,
        )?;
        tracing::info!(
            "{} founded circle {} for {}",
            self.local_peer.id(),
            circle.name(),
            self.account
        );
        self.record_circle(&circle).await;
        self.enqueue_circle(&circle)?;
        for view in self.views.clone() {
            self.rotate_view(&view, &circle)?;
        }

        // Kept so a lost founding race turns into an application.
        self.work
            .unconfirmed
            .push(CircleChange::Apply(self.local_peer.clone()));
        self.circle = Some(circle);
        Ok(vec![EngineFlag::PushPending, EngineFlag::EnsureKeys])
    }

    /// Apply the oldest queued change.
    async fn apply_changes(&mut self) -> OpOutput {
        let Some(change) = self.work.queued.front().cloned() else {
            return Ok(vec![]);
        };
        if self.lock_state == LockState::Locked {
            return Err(wait_for_unlock(EngineFlag::ApplyChanges));
        }
        let mut follow_ups = Vec::new();
        if self.work.queued.len() > 1 {
            follow_ups.push(EngineFlag::ApplyChanges);
        }

        let Some(circle) = self.circle.clone() else {
            self.work.queued.pop_front();
            self.warn(format!("dropped {:?}: no circle yet", change));
            return Ok(follow_ups);
        };
        let applied = match &change {
            CircleChange::Accept(peer) if !self.machines.allows(peer) => {
                Err(CircleError::NotAuthorized { peer: *peer })
            }
            _ => change.apply_to(&circle, &self.identity, &self.machines),
        };
        let next = match applied {
            Ok(next) => next,
            Err(e) if e.is_refusal() => {
                self.work.queued.pop_front();
                self.warn(format!("dropped {:?}: {}", change, e));
                return Ok(follow_ups);
            }
            Err(e) => return Err(e.into()),
        };

        self.enqueue_circle(&next)?;
        match &change {
            CircleChange::Remove(peer) => {
                tracing::debug!(
                    "Removing {} for {}, shares seen for {:?}",
                    peer,
                    self.account,
                    self.keys.views_shared_with(peer)
                );
                for view in self.current_views() {
                    self.rotate_view(&view, &next)?;
                }
                self.sessions.remove(peer);
                self.outgoing_messages.remove(peer);
            }
            CircleChange::Accept(_) => {
                self.issue_missing(&next)?;
            }
            CircleChange::Apply(_) => follow_ups.push(EngineFlag::EnsureKeys),
            CircleChange::Reject(_) | CircleChange::Retire => {}
        }

        tracing::info!(
            "Applied {:?} for {}, circle now at generation {}",
            change,
            self.account,
            next.generation()
        );
        self.record_circle(&next).await;
        self.work.queued.pop_front();
        self.work.unconfirmed.push(change);
        self.circle = Some(next);
        follow_ups.push(EngineFlag::PushPending);
        Ok(follow_ups)
    }

    async fn retire(&mut self) -> OpOutput {
        let Some(circle) = self.circle.clone() else {
            return Ok(vec![]);
        };
        if !self.is_member() {
            return Ok(vec![]);
        }
        let next = circle.retire_self(&self.identity)?;
        let blob = Envelope::seal(BlobKind::Circle, self.local_peer.id(), &next)?.to_bytes()?;
        let key = BlobKey::circle(next.name());

        let pushed = match self.push_outbox().await {
            Ok(_) => self.transport.push(&key, blob).await,
            Err((_, e)) => Err(e),
        };
        if let Err(e) = pushed {
            self.work.push_attempts = self.work.push_attempts.saturating_add(1);
            let attempts = self.work.push_attempts;
            tracing::warn!("Retirement of {} not published: {}", self.account, e);
            self.note_attempts(attempts);
            return Err(OpError::Deferred(
                self.retry_after(EngineFlag::RetireRequested, attempts),
            ));
        }

        tracing::info!("{} retired from circle {}", self.local_peer.id(), next.name());
        self.record_circle(&next).await;
        self.circle = Some(next);
        self.keys.relinquish();
        self.sessions.clear();
        self.outgoing_messages.clear();
        self.work.queued.clear();
        self.work.unconfirmed.clear();
        self.work.push_attempts = 0;
        Ok(vec![])
    }

    fn reset(&mut self) -> Vec<EngineFlag> {
        tracing::info!("Resetting account {}", self.account);
        self.health.last_error = None;
        self.sessions.clear();

        let mut follow_ups = vec![EngineFlag::FetchRequested, EngineFlag::EnsureKeys];
        if !self.inbox.is_empty() {
            follow_ups.push(EngineFlag::ProcessIncoming);
        }
        if !self.work.outbox.is_empty() {
            follow_ups.push(EngineFlag::PushPending);
        }
        follow_ups
    }

    // ===========================================
    // Keys
    // ===========================================

    fn rotate_view(&mut self, view: &ViewName, circle: &Circle) -> Result<KeySet, EngineError> {
        let rotation = self.keys.rotate(view, circle, &self.identity)?;
        self.enqueue_shares(&rotation.key_set, &rotation.shares)?;
        tracing::info!(
            "Rotated {} for {} to epoch {}",
            view,
            self.account,
            rotation.key_set.epoch()
        );
        Ok(rotation.key_set)
    }

    /// Views that have a current key set.
    fn current_views(&self) -> Vec<ViewName> {
        self.keys
            .views()
            .filter(|view| self.keys.current_key_set(view).is_some())
            .cloned()
            .collect()
    }

    /// Queue rotation of every current view when members retired in
    /// `circle` since `previous`. Only the remaining member with the
    /// lowest id rotates.
    fn rotate_after_retirement(&mut self, previous: Option<&Circle>, circle: &Circle) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        let retired: Vec<PeerId> = circle
            .retired()
            .keys()
            .filter(|peer| previous.is_member(peer))
            .copied()
            .collect();
        let me = self.local_peer.id();
        let rotator = circle.peers().keys().next().copied();
        if retired.is_empty() || rotator != Some(me) {
            return false;
        }
        tracing::info!(
            "{:?} retired from {}, rotating views for {}",
            retired,
            circle.name(),
            self.account
        );
        for view in self.current_views() {
            if !self.work.rotations.contains(&view) {
                self.work.rotations.push(view);
            }
        }
        !self.work.rotations.is_empty()
    }

    /// Share every current key set with members that lack it.
    fn issue_missing(&mut self, circle: &Circle) -> Result<usize, EngineError> {
        let current: Vec<KeySet> = self
            .keys
            .views()
            .filter_map(|view| self.keys.current_key_set(view).cloned())
            .collect();

        let mut issued = 0;
        for key_set in current {
            let shares = self
                .keys
                .issue_missing_shares(&key_set, circle, &self.identity)?;
            issued += shares.len();
            self.enqueue_shares(&key_set, &shares)?;
        }
        Ok(issued)
    }

    fn rotate(&mut self) -> OpOutput {
        if self.work.rotations.is_empty() {
            return Ok(vec![]);
        }
        if self.lock_state == LockState::Locked {
            return Err(wait_for_unlock(EngineFlag::RotateKeys));
        }
        let Some(circle) = self.circle.clone().filter(|_| self.is_member()) else {
            let dropped = std::mem::take(&mut self.work.rotations);
            self.warn(format!("dropped rotation of {:?}: not a member", dropped));
            return Ok(vec![]);
        };

        for view in std::mem::take(&mut self.work.rotations) {
            self.rotate_view(&view, &circle)?;
        }
        Ok(vec![EngineFlag::PushPending])
    }

    fn issue_shares(&mut self) -> OpOutput {
        let Some(circle) = self.circle.clone().filter(|_| self.is_member()) else {
            return Ok(vec![]);
        };
        if self.lock_state == LockState::Locked {
            return Err(wait_for_unlock(EngineFlag::IssueShares));
        }
        let issued = self.issue_missing(&circle)?;
        if issued == 0 {
            return Ok(vec![]);
        }
        tracing::debug!("Issued {} missing share(s) for {}", issued, self.account);
        Ok(vec![EngineFlag::PushPending])
    }

    /// Make sure every configured view has a current key set.
    fn ensure_keys(&mut self) -> OpOutput {
        let me = self.local_peer.id();
        let Some(circle) = self.circle.clone() else {
            return Ok(vec![]);
        };
        match circle.status_for(&me) {
            CircleStatus::InCircle => {}
            CircleStatus::Applying => return Err(OpError::Deferred(self.trust_gap())),
            CircleStatus::NotInCircle | CircleStatus::Retired => return Ok(vec![]),
        }
        if self.lock_state == LockState::Locked {
            return Err(wait_for_unlock(EngineFlag::EnsureKeys));
        }

        let mut follow_ups = vec![EngineFlag::IssueShares];
        let mut missing = Vec::new();
        for view in self.views.clone() {
            let shares = self.keys.shares_for_view(&view);
            match self.keys.ingest_shares(&view, &shares, &circle, &self.identity) {
                Ok(_) => {}
                Err(KeyError::MissingTrustedShare { .. }) => {
                    if self.keys.current_key_set(&view).is_some() {
                        continue;
                    }
                    if shares.is_empty() {
                        self.rotate_view(&view, &circle)?;
                        add_flags(&mut follow_ups, [EngineFlag::PushPending]);
                    } else {
                        missing.push(view);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !missing.is_empty() {
            tracing::debug!("{} waiting for shares of {:?}", self.account, missing);
            for flag in follow_ups {
                self.machine.set_flag(flag);
            }
            return Err(OpError::Deferred(self.trust_gap()));
        }
        Ok(follow_ups)
    }

    // ===========================================
    // Sessions
    // ===========================================

    /// Start handshakes and send queued messages over established sessions.
    fn flush_sessions(&mut self) -> OpOutput {
        let me = self.local_peer.id();
        let members = match self.circle.as_ref().filter(|circle| circle.is_member(&me)) {
            Some(circle) => circle.peers().clone(),
            None => {
                if !self.outgoing_messages.is_empty() {
                    self.outgoing_messages.clear();
                    self.warn("dropped queued messages: not a member".to_string());
                }
                return Ok(vec![]);
            }
        };

        let mut frames = Vec::new();
        let mut warnings = Vec::new();
        let peers: Vec<PeerId> = self.outgoing_messages.keys().copied().collect();
        for peer in peers {
            let Some(info) = members.get(&peer).filter(|_| peer != me) else {
                self.outgoing_messages.remove(&peer);
                warnings.push(format!("dropped messages for non-member {}", peer));
                continue;
            };
            let coder = self
                .sessions
                .entry(peer)
                .or_insert_with(|| SessionCoder::new(info.clone()));

            match coder.state() {
                SessionState::Uninitialized | SessionState::Faulted | SessionState::Retired => {
                    if coder.state() != SessionState::Uninitialized {
                        tracing::debug!("Restarting {:?} session with {}", coder.state(), peer);
                        coder.reset();
                    }
                    match coder.start(&self.identity) {
                        Ok(hello) => frames.push((peer, hello)),
                        Err(e) => warnings.push(format!("handshake with {} failed: {}", peer, e)),
                    }
                }
                SessionState::Negotiating => {}
                SessionState::Established => {
                    let queue = self.outgoing_messages.remove(&peer).unwrap_or_default();
                    for payload in queue {
                        match coder.wrap(&payload) {
                            Ok(frame) => frames.push((peer, frame)),
                            Err(e) => warnings.push(format!("dropped message to {}: {}", peer, e)),
                        }
                    }
                }
            }
        }

        for warning in warnings {
            self.warn(warning);
        }
        if frames.is_empty() {
            return Ok(vec![]);
        }
        for (peer, frame) in frames {
            self.enqueue(BlobKey::session(&me, &peer), &frame)?;
        }
        Ok(vec![EngineFlag::PushPending])
    }
}
