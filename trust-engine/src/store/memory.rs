//! In-memory store, for tests and the simulator.

use super::{PersistedAccount, StateStore};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use zerok_trust_core::Circle;
use zerok_trust_types::AccountId;

/// Store that keeps encoded state in memory.
///
/// State is held as MessagePack bytes so encoding problems show up here
/// the same way they would with SQLite. Clones share the same maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<DashMap<AccountId, Vec<u8>>>,
    history: Arc<DashMap<AccountId, Vec<Circle>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, account: &AccountId) -> Result<Option<PersistedAccount>, StoreError> {
        self.accounts
            .get(account)
            .map(|bytes| PersistedAccount::from_bytes(account, bytes.value()))
            .transpose()
    }

    async fn save(&self, account: &AccountId, state: &PersistedAccount) -> Result<(), StoreError> {
        let bytes = state.to_bytes()?;
        self.accounts.insert(account.clone(), bytes);
        Ok(())
    }

    async fn delete(&self, account: &AccountId) -> Result<bool, StoreError> {
        Ok(self.accounts.remove(account).is_some())
    }

    async fn list_accounts(&self) -> Result<Vec<AccountId>, StoreError> {
        let mut accounts: Vec<AccountId> =
            self.accounts.iter().map(|entry| entry.key().clone()).collect();
        accounts.sort();
        Ok(accounts)
    }

    async fn record_circle(&self, account: &AccountId, circle: &Circle) -> Result<(), StoreError> {
        let mut history = self.history.entry(account.clone()).or_default();
        if !history.contains(circle) {
            history.push(circle.clone());
            history.sort_by_key(|c| c.generation());
        }
        Ok(())
    }

    async fn circle_history(&self, account: &AccountId) -> Result<Vec<Circle>, StoreError> {
        Ok(self
            .history
            .get(account)
            .map(|history| history.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::account_state;

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = MemoryStore::new();
        let loaded = store.load(&AccountId::new("nobody")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryStore::new();
        let account = AccountId::new("alice");
        let (_identity, state) = account_state();

        store.save(&account, &state).await.unwrap();
        let loaded = store.load(&account).await.unwrap().unwrap();

        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn delete_and_list() {
        let store = MemoryStore::new();
        let (_identity, state) = account_state();
        store.save(&AccountId::new("b"), &state).await.unwrap();
        store.save(&AccountId::new("a"), &state).await.unwrap();

        assert_eq!(
            store.list_accounts().await.unwrap(),
            vec![AccountId::new("a"), AccountId::new("b")]
        );
        assert!(store.delete(&AccountId::new("a")).await.unwrap());
        assert!(!store.delete(&AccountId::new("a")).await.unwrap());
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn circle_history_ignores_duplicates() {
        let store = MemoryStore::new();
        let account = AccountId::new("alice");
        let (_identity, state) = account_state();
        let circle = state.circle.unwrap();

        store.record_circle(&account, &circle).await.unwrap();
        store.record_circle(&account, &circle).await.unwrap();

        assert_eq!(store.circle_history(&account).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        let (_identity, state) = account_state();

        store.save(&AccountId::new("alice"), &state).await.unwrap();
        assert!(other.load(&AccountId::new("alice")).await.unwrap().is_some());
    }
}
