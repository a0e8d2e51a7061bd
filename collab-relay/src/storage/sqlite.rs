//! SQLite session store.

use super::SessionStore;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use collab_types::SessionId;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-based session content storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> StoreResult<Self> {
        let path_str = path.to_str().ok_or_else(|| StoreError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // One connection: every pooled connection would get its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS code_sessions (
                session_id TEXT PRIMARY KEY,
                content TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of sessions with stored content.
    pub async fn session_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM code_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session_id: &SessionId) -> StoreResult<String> {
        let content: Option<String> =
            sqlx::query_scalar("SELECT content FROM code_sessions WHERE session_id = ?1")
                .bind(session_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(content.unwrap_or_default())
    }

    async fn save(&self, session_id: &SessionId, content: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO code_sessions (session_id, content, updated_at)
            VALUES (?1, ?2, strftime('%s', 'now'))
            ON CONFLICT(session_id) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id.as_str())
        .bind(content)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
