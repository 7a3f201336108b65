//! Process-wide registry of account engines.
//!
//! One engine per account id. Engines are created on first use and shut
//! down when their account is removed.

use crate::account::AccountEngine;
use crate::error::EngineError;
use dashmap::DashMap;
use std::future::Future;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use zerok_trust_types::AccountId;

static GLOBAL: OnceLock<AccountRegistry> = OnceLock::new();

/// Engines keyed by account.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    engines: DashMap<AccountId, AccountEngine>,
    init_lock: Mutex<()>,
}

impl AccountRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static AccountRegistry {
        GLOBAL.get_or_init(AccountRegistry::new)
    }

    /// The engine for `account`, if one is running.
    pub fn get(&self, account: &AccountId) -> Option<AccountEngine> {
        self.engines.get(account).map(|entry| entry.value().clone())
    }

    /// The engine for `account`, starting it with `init` if needed.
    ///
    /// Concurrent callers for the same account get the same engine; `init`
    /// runs at most once per registration.
    pub async fn get_or_init<F, Fut>(
        &self,
        account: &AccountId,
        init: F,
    ) -> Result<AccountEngine, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccountEngine, EngineError>>,
    {
        if let Some(engine) = self.get(account) {
            return Ok(engine);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(engine) = self.get(account) {
            return Ok(engine);
        }

        let engine = init().await?;
        self.engines.insert(account.clone(), engine.clone());
        tracing::debug!("Registered engine for account {}", account);
        Ok(engine)
    }

    /// Stop and forget the engine for `account`.
    ///
    /// Returns whether an engine was registered.
    pub async fn remove(&self, account: &AccountId) -> bool {
        let Some((_, engine)) = self.engines.remove(account) else {
            return false;
        };
        if let Err(e) = engine.shutdown().await {
            tracing::warn!("Engine for {} did not shut down cleanly: {}", account, e);
        }
        true
    }

    /// Accounts with a running engine, sorted.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> =
            self.engines.iter().map(|entry| entry.key().clone()).collect();
        accounts.sort();
        accounts
    }

    /// Number of registered engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether no engine is registered.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Stop every engine.
    pub async fn shutdown_all(&self) {
        for account in self.accounts() {
            self.remove(&account).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use zerok_trust_core::{LocalIdentity, MachineList};

    async fn start(account: AccountId) -> Result<AccountEngine, EngineError> {
        AccountEngine::spawn(
            account,
            EngineConfig::default(),
            LocalIdentity::generate()?,
            MachineList::unrestricted(),
            MockTransport::new(),
            Arc::new(MemoryStore::new()),
        )
        .await
    }

    #[tokio::test]
    async fn init_runs_once_per_account() {
        let registry = AccountRegistry::new();
        let account = AccountId::new("alice");
        let calls = AtomicUsize::new(0);

        let first = registry
            .get_or_init(&account, || {
                calls.fetch_add(1, Ordering::SeqCst);
                start(account.clone())
            })
            .await
            .unwrap();
        let second = registry
            .get_or_init(&account, || {
                calls.fetch_add(1, Ordering::SeqCst);
                start(account.clone())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.local_peer(), second.local_peer());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_init_registers_nothing() {
        let registry = AccountRegistry::new();
        let account = AccountId::new("alice");

        let result = registry
            .get_or_init(&account, || async { Err(EngineError::Closed) })
            .await;

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_shuts_engine_down() {
        let registry = AccountRegistry::new();
        let account = AccountId::new("alice");
        let engine = registry
            .get_or_init(&account, || start(account.clone()))
            .await
            .unwrap();

        assert!(registry.remove(&account).await);
        assert!(!registry.remove(&account).await);
        assert!(registry.get(&account).is_none());
        assert!(matches!(engine.settle().await, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_all_empties_registry() {
        let registry = AccountRegistry::new();
        for name in ["a", "b"] {
            let account = AccountId::new(name);
            registry
                .get_or_init(&account, || start(account.clone()))
                .await
                .unwrap();
        }
        assert_eq!(
            registry.accounts(),
            vec![AccountId::new("a"), AccountId::new("b")]
        );

        registry.shutdown_all().await;
        assert!(registry.is_empty());
    }
}
