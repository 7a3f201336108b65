//! SQLite storage backend for account state.

use super::{PersistedAccount, StateStore};
use crate::error::StoreError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use zerok_trust_core::Circle;
use zerok_trust_types::AccountId;

/// SQLite-based account storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open a store at `path`.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StoreError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_state (
                account_id TEXT PRIMARY KEY,
                local_peer BLOB NOT NULL,
                generation INTEGER NOT NULL,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS circle_history (
                account_id TEXT NOT NULL,
                digest BLOB NOT NULL,
                generation INTEGER NOT NULL,
                circle BLOB NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, digest)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_circle_history_generation ON circle_history(account_id, generation)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, account: &AccountId) -> Result<Option<PersistedAccount>, StoreError> {
        let row = sqlx::query("SELECT state FROM account_state WHERE account_id = ?1")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        row.map(|row| {
            let bytes: Vec<u8> = row.get("state");
            PersistedAccount::from_bytes(account, &bytes)
        })
        .transpose()
    }

    async fn save(&self, account: &AccountId, state: &PersistedAccount) -> Result<(), StoreError> {
        let bytes = state.to_bytes()?;
        let generation = state
            .circle
            .as_ref()
            .map_or(0, |circle| circle.generation().value() as i64);

        sqlx::query(
            r#"
            INSERT INTO account_state (account_id, local_peer, generation, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id) DO UPDATE SET
                local_peer = excluded.local_peer,
                generation = excluded.generation,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(account.as_str())
        .bind(state.local_peer.id().as_bytes().as_slice())
        .bind(generation)
        .bind(&bytes)
        .bind(Self::current_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn delete(&self, account: &AccountId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM account_state WHERE account_id = ?1")
            .bind(account.as_str())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_accounts(&self) -> Result<Vec<AccountId>, StoreError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT account_id FROM account_state ORDER BY account_id ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::Database)?;

        Ok(ids.into_iter().map(AccountId::new).collect())
    }

    async fn record_circle(&self, account: &AccountId, circle: &Circle) -> Result<(), StoreError> {
        let digest = circle
            .digest()
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let bytes =
            rmp_serde::to_vec_named(circle).map_err(|e| StoreError::Encoding(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO circle_history (account_id, digest, generation, circle, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(account.as_str())
        .bind(digest.as_bytes().as_slice())
        .bind(circle.generation().value() as i64)
        .bind(&bytes)
        .bind(Self::current_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn circle_history(&self, account: &AccountId) -> Result<Vec<Circle>, StoreError> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT circle FROM circle_history
            WHERE account_id = ?1
            ORDER BY generation ASC, recorded_at ASC
            "#,
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        rows.iter()
            .map(|bytes| {
                rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decoding {
                    account: account.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}
