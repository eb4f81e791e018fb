//! SQLite storage layer implementing the repository pattern.
//!
//! All persistence goes through these repositories; SQL outside this module
//! is forbidden. The queue table is the write-ahead-log-backed heart of the
//! guaranteed-delivery contract: every status transition is durable before
//! the caller observes it.

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};

pub mod bindings;
pub mod queue;
pub mod settings;

use crate::{error::Result, time::Clock};

/// Container for all repository instances sharing one SQLite pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for delivery queue operations.
    pub queue: Arc<queue::Repository>,

    /// Repository for binding registry operations.
    pub bindings: Arc<bindings::Repository>,

    /// Repository for key-value settings (source enable flags and the like).
    pub settings: Arc<settings::Repository>,

    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Opens (or creates) the database at `path` and runs migrations.
    ///
    /// WAL journal mode is required: it is what lets a crash at any point
    /// leave every delivery item either untouched or fully transitioned.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // Single writer by design; readers share the same connection to keep
        // claim/transition ordering trivially serialized.
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        Self::from_pool(pool, clock).await
    }

    /// Opens an in-memory database for tests.
    pub async fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .journal_mode(SqliteJournalMode::Memory);

        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        Self::from_pool(pool, clock).await
    }

    async fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = Arc::new(pool);
        migrate(&pool).await?;

        Ok(Self {
            queue: Arc::new(queue::Repository::new(pool.clone(), clock.clone())),
            bindings: Arc::new(bindings::Repository::new(pool.clone(), clock)),
            settings: Arc::new(settings::Repository::new(pool.clone())),
            pool,
        })
    }

    /// Verifies the database connection is usable.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }

    /// Closes the underlying pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Creates tables and indexes. Idempotent; runs at every open.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delivery_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL UNIQUE,
            source_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            retry_log TEXT NOT NULL DEFAULT '[]',
            trigger_type TEXT NOT NULL DEFAULT 'file_change',
            target_endpoint_id TEXT,
            delivered_to TEXT,
            available_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            delivered_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_queue_ready
        ON delivery_queue(status, available_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_queue_endpoint
        ON delivery_queue(target_endpoint_id, status)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bindings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            endpoint_id TEXT NOT NULL,
            endpoint_url TEXT NOT NULL,
            endpoint_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            custom_headers TEXT NOT NULL DEFAULT '{}',
            auth_header_name TEXT,
            auth_credential_key TEXT,
            delivery_mode TEXT NOT NULL DEFAULT 'on_change',
            schedule_time TEXT,
            schedule_day TEXT,
            last_scheduled_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(source_id, endpoint_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
