//! Shared harness for multi-device engine tests.
//!
//! Every device is a separate engine with its own identity and store,
//! talking to one shared `MockTransport` relay.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zerok_trust_core::{LocalIdentity, MachineList};
use zerok_trust_engine::{
    AccountEngine, AccountSnapshot, EngineConfig, LimitsConfig, MemoryStore, MockTransport,
    Pulled, RetryConfig, StateStore, Transport, TransportError,
};
use zerok_trust_types::{AccountId, BlobKey, Cursor, PeerId, ViewName};

/// How long a test waits for a condition before failing.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn account() -> AccountId {
    AccountId::new("alice@example.com")
}

pub fn passwords() -> ViewName {
    ViewName::new("passwords")
}

pub fn wifi() -> ViewName {
    ViewName::new("wifi")
}

/// Fast retries, no background polling, limits out of the way.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fetch.poll_interval_secs = 0;
    config.fetch.trust_gap_retry_ms = 20;
    config.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 10,
        max_delay_ms: 40,
        jitter_ms: 0,
    };
    config.limits = LimitsConfig {
        pushes_per_minute: 100_000,
        burst: 10_000,
        global_per_second: 100_000,
    };
    config
}

pub struct Device {
    pub engine: AccountEngine,
    pub id: PeerId,
}

pub async fn device<T: Transport + 'static>(transport: T) -> Device {
    device_with(transport, MachineList::unrestricted()).await
}

pub async fn device_with<T: Transport + 'static>(transport: T, machines: MachineList) -> Device {
    let identity = LocalIdentity::generate().unwrap();
    spawn_identity(transport, machines, identity, Arc::new(MemoryStore::new())).await
}

pub async fn spawn_identity<T: Transport + 'static>(
    transport: T,
    machines: MachineList,
    identity: LocalIdentity,
    store: Arc<dyn StateStore>,
) -> Device {
    let id = identity.peer_id();
    let engine = AccountEngine::spawn(account(), test_config(), identity, machines, transport, store)
        .await
        .unwrap();
    engine.settle().await.unwrap();
    Device { engine, id }
}

/// Let every device fetch and run until idle, a few rounds over.
pub async fn sync_all(devices: &[&Device]) {
    for _ in 0..4 {
        for device in devices {
            device.engine.fetch().await.unwrap();
            device.engine.settle().await.unwrap();
        }
    }
}

/// Wait until a published snapshot satisfies `check`.
pub async fn wait_for(
    device: &Device,
    check: impl Fn(&AccountSnapshot) -> bool,
) -> Arc<AccountSnapshot> {
    let mut snapshots = device.engine.watch();
    tokio::time::timeout(PATIENCE, async {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            if check(&snapshot) {
                return snapshot;
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Found a circle and join a second device to it.
pub async fn founded_pair(relay: &MockTransport) -> (Device, Device) {
    let a = device(relay.clone()).await;
    a.engine.join().await.unwrap();
    a.engine.settle().await.unwrap();

    let b = device(relay.clone()).await;
    b.engine.join().await.unwrap();
    b.engine.settle().await.unwrap();

    a.engine.fetch().await.unwrap();
    a.engine.settle().await.unwrap();
    a.engine.accept(b.id).await.unwrap();
    a.engine.settle().await.unwrap();

    wait_for(&b, |s| s.current_key_set(&passwords()).is_some()).await;
    sync_all(&[&a, &b]).await;
    (a, b)
}

/// Transport that can hide the relay's contents from one device.
#[derive(Clone)]
pub struct Blindfold {
    relay: MockTransport,
    blind: Arc<AtomicBool>,
}

impl Blindfold {
    pub fn new(relay: MockTransport) -> Self {
        Self {
            relay,
            blind: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn lift(&self) {
        self.blind.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for Blindfold {
    async fn push(&self, key: &BlobKey, blob: Vec<u8>) -> Result<(), TransportError> {
        self.relay.push(key, blob).await
    }

    async fn pull(&self, since: Cursor, limit: u32) -> Result<Pulled, TransportError> {
        if self.blind.load(Ordering::SeqCst) {
            return Ok(Pulled {
                items: vec![],
                token: since,
            });
        }
        self.relay.pull(since, limit).await
    }
}
