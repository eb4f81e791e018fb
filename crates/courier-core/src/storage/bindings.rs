//! Repository for the binding registry.
//!
//! Bindings are upserted keyed on (source_id, endpoint_id): rebinding
//! replaces, never duplicates. Removal deactivates rather than deletes while
//! delivery history may still reference the route; hard deletion is a
//! separate explicit call.

use std::{collections::HashMap, sync::Arc};

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    error::{CoreError, Result},
    models::{Binding, NewBinding},
    time::Clock,
};

/// Repository for binding registry operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Creates or replaces the binding for (source_id, endpoint_id).
    ///
    /// When `preserve_credential` is set and the input carries no new
    /// credential key, the existing reference is kept. This is what lets a
    /// user edit headers or schedule without re-entering the secret.
    pub async fn upsert(&self, binding: NewBinding) -> Result<Binding> {
        let now = self.clock.now_unix();

        let credential_key = if binding.auth_credential_key.is_none() && binding.preserve_credential
        {
            self.find(&binding.source_id, &binding.endpoint_id)
                .await?
                .and_then(|existing| existing.auth_credential_key)
        } else {
            binding.auth_credential_key.clone()
        };

        let headers_json = serde_json::to_string(&binding.custom_headers)?;

        sqlx::query(
            r#"
            INSERT INTO bindings
                (source_id, target_id, endpoint_id, endpoint_url, endpoint_name, active,
                 custom_headers, auth_header_name, auth_credential_key, delivery_mode,
                 schedule_time, schedule_day, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, endpoint_id) DO UPDATE SET
                target_id = excluded.target_id,
                endpoint_url = excluded.endpoint_url,
                endpoint_name = excluded.endpoint_name,
                active = 1,
                custom_headers = excluded.custom_headers,
                auth_header_name = excluded.auth_header_name,
                auth_credential_key = excluded.auth_credential_key,
                delivery_mode = excluded.delivery_mode,
                schedule_time = excluded.schedule_time,
                schedule_day = excluded.schedule_day
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.target_id)
        .bind(&binding.endpoint_id)
        .bind(&binding.endpoint_url)
        .bind(&binding.endpoint_name)
        .bind(headers_json)
        .bind(&binding.auth_header_name)
        .bind(&credential_key)
        .bind(binding.delivery_mode.as_str())
        .bind(&binding.schedule_time)
        .bind(&binding.schedule_day)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        self.find(&binding.source_id, &binding.endpoint_id)
            .await?
            .ok_or_else(|| CoreError::binding_not_found(&binding.source_id, &binding.endpoint_id))
    }

    /// Fetches one binding, active or not.
    pub async fn find(&self, source_id: &str, endpoint_id: &str) -> Result<Option<Binding>> {
        let row =
            sqlx::query("SELECT * FROM bindings WHERE source_id = ? AND endpoint_id = ?")
                .bind(source_id)
                .bind(endpoint_id)
                .fetch_optional(&*self.pool)
                .await?;

        row.as_ref().map(binding_from_row).transpose()
    }

    /// Active bindings for a source, the worker's fan-out set.
    ///
    /// Reads straight from the table, so a deactivation is visible to the
    /// very next call with no cache window.
    pub async fn active_for_source(&self, source_id: &str) -> Result<Vec<Binding>> {
        let rows = sqlx::query(
            "SELECT * FROM bindings WHERE source_id = ? AND active = 1 ORDER BY created_at ASC",
        )
        .bind(source_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(binding_from_row).collect()
    }

    /// All bindings for a source, including inactive ones.
    pub async fn for_source(&self, source_id: &str) -> Result<Vec<Binding>> {
        let rows =
            sqlx::query("SELECT * FROM bindings WHERE source_id = ? ORDER BY created_at ASC")
                .bind(source_id)
                .fetch_all(&*self.pool)
                .await?;

        rows.iter().map(binding_from_row).collect()
    }

    /// Every binding in the registry.
    pub async fn list_all(&self) -> Result<Vec<Binding>> {
        let rows = sqlx::query("SELECT * FROM bindings ORDER BY source_id ASC, created_at ASC")
            .fetch_all(&*self.pool)
            .await?;

        rows.iter().map(binding_from_row).collect()
    }

    /// Active bindings whose delivery mode is scheduler-driven.
    pub async fn scheduled(&self) -> Result<Vec<Binding>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bindings
            WHERE active = 1 AND delivery_mode != 'on_change'
            ORDER BY source_id ASC, created_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(binding_from_row).collect()
    }

    /// Soft-disables a binding; new deliveries stop immediately.
    pub async fn deactivate(&self, source_id: &str, endpoint_id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE bindings SET active = 0 WHERE source_id = ? AND endpoint_id = ?")
                .bind(source_id)
                .bind(endpoint_id)
                .execute(&*self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::binding_not_found(source_id, endpoint_id));
        }
        Ok(())
    }

    /// Permanently deletes a binding row.
    pub async fn delete(&self, source_id: &str, endpoint_id: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM bindings WHERE source_id = ? AND endpoint_id = ?")
                .bind(source_id)
                .bind(endpoint_id)
                .execute(&*self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::binding_not_found(source_id, endpoint_id));
        }
        Ok(())
    }

    /// Records when the scheduler last fired this binding.
    pub async fn touch_last_scheduled(
        &self,
        source_id: &str,
        endpoint_id: &str,
        timestamp: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE bindings SET last_scheduled_at = ? WHERE source_id = ? AND endpoint_id = ?",
        )
        .bind(timestamp)
        .bind(source_id)
        .bind(endpoint_id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::binding_not_found(source_id, endpoint_id));
        }
        Ok(())
    }
}

fn binding_from_row(row: &SqliteRow) -> Result<Binding> {
    let headers_json: String = row.try_get("custom_headers")?;
    let custom_headers: HashMap<String, String> = serde_json::from_str(&headers_json)?;
    let mode: String = row.try_get("delivery_mode")?;
    let active: i64 = row.try_get("active")?;

    Ok(Binding {
        source_id: row.try_get("source_id")?,
        target_id: row.try_get("target_id")?,
        endpoint_id: row.try_get("endpoint_id")?,
        endpoint_url: row.try_get("endpoint_url")?,
        endpoint_name: row.try_get("endpoint_name")?,
        active: active != 0,
        custom_headers,
        auth_header_name: row.try_get("auth_header_name")?,
        auth_credential_key: row.try_get("auth_credential_key")?,
        delivery_mode: mode.parse()?,
        schedule_time: row.try_get("schedule_time")?,
        schedule_day: row.try_get("schedule_day")?,
        last_scheduled_at: row.try_get("last_scheduled_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::DeliveryMode, storage::Storage, time::TestClock};

    async fn setup() -> Storage {
        Storage::open_in_memory(Arc::new(TestClock::new())).await.unwrap()
    }

    fn new_binding(source: &str, endpoint: &str) -> NewBinding {
        NewBinding {
            source_id: source.to_string(),
            target_id: "t1".to_string(),
            endpoint_id: endpoint.to_string(),
            endpoint_url: format!("https://hooks.example.com/{endpoint}"),
            endpoint_name: "Hook".to_string(),
            delivery_mode: DeliveryMode::OnChange,
            ..NewBinding::default()
        }
    }

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let storage = setup().await;

        storage.bindings.upsert(new_binding("stats", "ep1")).await.unwrap();

        let mut updated = new_binding("stats", "ep1");
        updated.endpoint_name = "Renamed".to_string();
        storage.bindings.upsert(updated).await.unwrap();

        let all = storage.bindings.for_source("stats").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].endpoint_name, "Renamed");
    }

    #[tokio::test]
    async fn preserve_flag_keeps_existing_credential_reference() {
        let storage = setup().await;

        let mut with_secret = new_binding("stats", "ep1");
        with_secret.auth_header_name = Some("Authorization".to_string());
        with_secret.auth_credential_key = Some("binding:stats:ep1".to_string());
        storage.bindings.upsert(with_secret).await.unwrap();

        // Edit the schedule without re-entering the secret
        let mut edit = new_binding("stats", "ep1");
        edit.auth_header_name = Some("Authorization".to_string());
        edit.delivery_mode = DeliveryMode::Daily;
        edit.schedule_time = Some("09:00".to_string());
        edit.preserve_credential = true;
        let saved = storage.bindings.upsert(edit).await.unwrap();

        assert_eq!(saved.auth_credential_key.as_deref(), Some("binding:stats:ep1"));
        assert_eq!(saved.delivery_mode, DeliveryMode::Daily);
    }

    #[tokio::test]
    async fn upsert_without_preserve_clears_credential_reference() {
        let storage = setup().await;

        let mut with_secret = new_binding("stats", "ep1");
        with_secret.auth_credential_key = Some("binding:stats:ep1".to_string());
        storage.bindings.upsert(with_secret).await.unwrap();

        let saved = storage.bindings.upsert(new_binding("stats", "ep1")).await.unwrap();
        assert!(saved.auth_credential_key.is_none());
    }

    #[tokio::test]
    async fn deactivate_hides_from_active_reads_immediately() {
        let storage = setup().await;
        storage.bindings.upsert(new_binding("stats", "ep1")).await.unwrap();
        storage.bindings.upsert(new_binding("stats", "ep2")).await.unwrap();

        storage.bindings.deactivate("stats", "ep1").await.unwrap();

        let active = storage.bindings.active_for_source("stats").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].endpoint_id, "ep2");

        // Still visible in the unfiltered view
        assert_eq!(storage.bindings.for_source("stats").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reupsert_reactivates_a_deactivated_binding() {
        let storage = setup().await;
        storage.bindings.upsert(new_binding("stats", "ep1")).await.unwrap();
        storage.bindings.deactivate("stats", "ep1").await.unwrap();

        let saved = storage.bindings.upsert(new_binding("stats", "ep1")).await.unwrap();
        assert!(saved.active);
    }

    #[tokio::test]
    async fn scheduled_filter_excludes_on_change() {
        let storage = setup().await;
        storage.bindings.upsert(new_binding("stats", "ep1")).await.unwrap();

        let mut daily = new_binding("notes", "ep2");
        daily.delivery_mode = DeliveryMode::Daily;
        daily.schedule_time = Some("08:30".to_string());
        storage.bindings.upsert(daily).await.unwrap();

        let scheduled = storage.bindings.scheduled().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].source_id, "notes");
    }

    #[tokio::test]
    async fn touch_last_scheduled_persists() {
        let storage = setup().await;
        let mut daily = new_binding("stats", "ep1");
        daily.delivery_mode = DeliveryMode::Daily;
        storage.bindings.upsert(daily).await.unwrap();

        storage.bindings.touch_last_scheduled("stats", "ep1", 1_700_000_123).await.unwrap();

        let binding = storage.bindings.find("stats", "ep1").await.unwrap().unwrap();
        assert_eq!(binding.last_scheduled_at, Some(1_700_000_123));
    }

    #[tokio::test]
    async fn missing_binding_operations_report_not_found() {
        let storage = setup().await;
        assert!(matches!(
            storage.bindings.deactivate("ghost", "ep").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            storage.bindings.delete("ghost", "ep").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
    }
}
