//! Repository for persisted key-value settings.
//!
//! Holds the small pieces of engine state that are configuration-shaped
//! rather than queue-shaped, chiefly the per-source enabled flags.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::error::Result;

/// Repository for key-value settings.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Fetches a setting value.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(value)
    }

    /// Stores a setting value, replacing any previous one.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Whether a source is enabled. Sources default to enabled.
    pub async fn source_enabled(&self, source_id: &str) -> Result<bool> {
        let value = self.get(&format!("source.{source_id}.enabled")).await?;
        Ok(value.as_deref() != Some("false"))
    }

    /// Enables or disables a source.
    pub async fn set_source_enabled(&self, source_id: &str, enabled: bool) -> Result<()> {
        self.set(&format!("source.{source_id}.enabled"), if enabled { "true" } else { "false" })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::Storage, time::TestClock};

    async fn setup() -> Storage {
        Storage::open_in_memory(Arc::new(TestClock::new())).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let storage = setup().await;
        assert!(storage.settings.get("missing").await.unwrap().is_none());

        storage.settings.set("poll_hint", "5").await.unwrap();
        storage.settings.set("poll_hint", "3").await.unwrap();
        assert_eq!(storage.settings.get("poll_hint").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn sources_default_to_enabled() {
        let storage = setup().await;
        assert!(storage.settings.source_enabled("stats").await.unwrap());

        storage.settings.set_source_enabled("stats", false).await.unwrap();
        assert!(!storage.settings.source_enabled("stats").await.unwrap());

        storage.settings.set_source_enabled("stats", true).await.unwrap();
        assert!(storage.settings.source_enabled("stats").await.unwrap());
    }
}
