//! Repository for the durable delivery queue.
//!
//! Implements the delivery item state machine at the storage level:
//! `pending -> in_flight -> {delivered | failed}`, `failed -> {pending | dlq}`,
//! with `target_paused` as the held-back state for degraded targets and
//! `dismissed` as the acknowledged-failure terminal state.
//!
//! Every transition is a single durable write; a crash between any two
//! operations leaves each item in a well-defined state. Items are never
//! deleted, only transitioned.

use std::{sync::Arc, time::Duration};

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    error::{CoreError, Result},
    models::{
        DeliveredTo, DeliveryItem, DeliveryStatus, ItemId, QueueStats, RetryLogEntry, TriggerType,
    },
    time::Clock,
};

/// Repository for delivery queue operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Enqueues a new item with no resolved endpoint.
    ///
    /// Used when no binding exists yet; fan-out enqueues use
    /// [`Repository::enqueue_targeted`] instead.
    pub async fn enqueue(
        &self,
        source_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        trigger: TriggerType,
    ) -> Result<ItemId> {
        self.insert(source_id, event_type, payload, trigger, None).await
    }

    /// Enqueues a new item fanned out to a specific endpoint.
    ///
    /// One item is created per binding at enqueue time, so each route has
    /// independent retry state and failure isolation.
    pub async fn enqueue_targeted(
        &self,
        source_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        trigger: TriggerType,
        endpoint_id: &str,
    ) -> Result<ItemId> {
        self.insert(source_id, event_type, payload, trigger, Some(endpoint_id)).await
    }

    async fn insert(
        &self,
        source_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        trigger: TriggerType,
        endpoint_id: Option<&str>,
    ) -> Result<ItemId> {
        let item_id = ItemId::new();
        let now = self.clock.now_unix();

        sqlx::query(
            r#"
            INSERT INTO delivery_queue
                (item_id, source_id, event_type, payload, status, trigger_type,
                 target_endpoint_id, available_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(item_id.to_string())
        .bind(source_id)
        .bind(event_type)
        .bind(payload.to_string())
        .bind(trigger.as_str())
        .bind(endpoint_id)
        .bind(now)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(item_id)
    }

    /// Claims up to `limit` ready items, marking them `in_flight`.
    ///
    /// Ready means `pending` or `failed` with the backoff gate passed.
    /// Selection and transition happen in one transaction, so two workers
    /// can never claim the same row. Claimed rows get `available_at` stamped
    /// with the claim time, which is what orphan recovery measures age from.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<DeliveryItem>> {
        let now = self.clock.now_unix();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM delivery_queue
            WHERE status IN ('pending', 'failed') AND available_at <= ?
            ORDER BY available_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut item = item_from_row(row)?;

            sqlx::query(
                "UPDATE delivery_queue SET status = 'in_flight', available_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(item.id)
            .execute(&mut *tx)
            .await?;

            item.status = DeliveryStatus::InFlight;
            item.available_at = now;
            items.push(item);
        }

        tx.commit().await?;
        Ok(items)
    }

    /// Marks an in-flight item delivered, recording where it went.
    ///
    /// Only valid from `in_flight`; this is the write whose durability makes
    /// "a crash after this returns never replays the delivery" hold.
    pub async fn mark_delivered(&self, item_id: ItemId, delivered_to: &DeliveredTo) -> Result<()> {
        let now = self.clock.now_unix();
        let delivered_json = serde_json::to_string(delivered_to)?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'delivered', delivered_at = ?, delivered_to = ?
            WHERE item_id = ? AND status = 'in_flight'
            "#,
        )
        .bind(now)
        .bind(delivered_json)
        .bind(item_id.to_string())
        .execute(&*self.pool)
        .await?;

        self.require_transition(result.rows_affected(), item_id, "delivered").await
    }

    /// Records a failed attempt on an in-flight item.
    ///
    /// Increments the retry count and appends to the retry log. A failure
    /// that reaches `max_retries` moves the item to the DLQ; otherwise the
    /// item returns to the retry path gated by `backoff`. Returns the
    /// resulting status.
    pub async fn mark_failed(
        &self,
        item_id: ItemId,
        error: &str,
        backoff: Duration,
    ) -> Result<DeliveryStatus> {
        let now = self.clock.now_unix();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, retry_count, max_retries, retry_log FROM delivery_queue WHERE item_id = ?",
        )
        .bind(item_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::item_not_found(item_id))?;

        let status: String = row.try_get("status")?;
        if status != "in_flight" {
            return Err(CoreError::InvalidTransition(format!(
                "cannot fail item {item_id} from status {status}"
            )));
        }

        let retry_count: i64 = row.try_get("retry_count")?;
        let max_retries: i64 = row.try_get("max_retries")?;
        let log_json: String = row.try_get("retry_log")?;

        let new_count = retry_count + 1;
        let mut log: Vec<RetryLogEntry> = serde_json::from_str(&log_json)?;
        log.push(RetryLogEntry {
            at: now,
            error: error.to_string(),
            attempt: u32::try_from(new_count).unwrap_or(u32::MAX),
        });
        let log_json = serde_json::to_string(&log)?;

        let new_status = if new_count >= max_retries {
            DeliveryStatus::Dlq
        } else {
            DeliveryStatus::Failed
        };
        let available_at = match new_status {
            DeliveryStatus::Failed => now + i64::try_from(backoff.as_secs()).unwrap_or(i64::MAX),
            _ => now,
        };

        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = ?, retry_count = ?, last_error = ?, retry_log = ?, available_at = ?
            WHERE item_id = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(new_count)
        .bind(error)
        .bind(log_json)
        .bind(available_at)
        .bind(item_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(new_status)
    }

    /// Returns a claimed item to `pending` without consuming a retry.
    ///
    /// Used when an attempt could not even start (binding vanished mid-claim,
    /// say): the item was never sent, so it keeps its retry budget and simply
    /// becomes eligible again after `delay`.
    pub async fn release(&self, item_id: ItemId, delay: Duration) -> Result<()> {
        let available_at =
            self.clock.now_unix() + i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'pending', available_at = ?
            WHERE item_id = ? AND status = 'in_flight'
            "#,
        )
        .bind(available_at)
        .bind(item_id.to_string())
        .execute(&*self.pool)
        .await?;

        self.require_transition(result.rows_affected(), item_id, "pending").await
    }

    /// Parks a claimed item behind a degraded target.
    ///
    /// Does NOT consume a retry attempt: the item was never sent anywhere.
    pub async fn mark_target_paused(&self, item_id: ItemId, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'target_paused', last_error = ?
            WHERE item_id = ? AND status = 'in_flight'
            "#,
        )
        .bind(reason)
        .bind(item_id.to_string())
        .execute(&*self.pool)
        .await?;

        self.require_transition(result.rows_affected(), item_id, "target_paused").await
    }

    /// Parks every ready item bound for an endpoint. Returns how many.
    pub async fn pause_ready_for_endpoint(&self, endpoint_id: &str, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'target_paused', last_error = ?
            WHERE target_endpoint_id = ? AND status IN ('pending', 'failed')
            "#,
        )
        .bind(reason)
        .bind(endpoint_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Releases every parked item bound for an endpoint back to `pending`,
    /// immediately eligible. Returns how many resumed.
    pub async fn resume_paused_for_endpoint(&self, endpoint_id: &str) -> Result<u64> {
        let now = self.clock.now_unix();
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'pending', available_at = ?
            WHERE target_endpoint_id = ? AND status = 'target_paused'
            "#,
        )
        .bind(now)
        .bind(endpoint_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Counts items currently parked behind an endpoint.
    pub async fn count_paused_for_endpoint(&self, endpoint_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM delivery_queue
            WHERE target_endpoint_id = ? AND status = 'target_paused'
            "#,
        )
        .bind(endpoint_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Returns items stuck `in_flight` longer than `max_age` to the retry
    /// path.
    ///
    /// Run at startup: an item claimed before a crash had its attempt
    /// outcome lost, so it is retried rather than abandoned (at-least-once).
    pub async fn recover_orphans(&self, max_age: Duration) -> Result<u64> {
        let now = self.clock.now_unix();
        let cutoff = now - i64::try_from(max_age.as_secs()).unwrap_or(0);

        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'pending', last_error = 'recovered after restart: attempt outcome unknown',
                available_at = ?
            WHERE status = 'in_flight' AND available_at <= ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "recovered orphaned in-flight items after restart");
        }
        Ok(recovered)
    }

    /// Dismisses a failed or dead-lettered item, keeping the audit row.
    pub async fn dismiss(&self, item_id: ItemId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'dismissed'
            WHERE item_id = ? AND status IN ('failed', 'dlq')
            "#,
        )
        .bind(item_id.to_string())
        .execute(&*self.pool)
        .await?;

        self.require_transition(result.rows_affected(), item_id, "dismissed").await
    }

    /// Records the resolved destination at enqueue time, before any attempt,
    /// so activity views can show where an item is headed.
    pub async fn set_attempted_target(
        &self,
        item_id: ItemId,
        delivered_to: &DeliveredTo,
    ) -> Result<()> {
        let delivered_json = serde_json::to_string(delivered_to)?;
        let result = sqlx::query("UPDATE delivery_queue SET delivered_to = ? WHERE item_id = ?")
            .bind(delivered_json)
            .bind(item_id.to_string())
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::item_not_found(item_id));
        }
        Ok(())
    }

    /// Fetches a single item by id.
    pub async fn find(&self, item_id: ItemId) -> Result<Option<DeliveryItem>> {
        let row = sqlx::query("SELECT * FROM delivery_queue WHERE item_id = ?")
            .bind(item_id.to_string())
            .fetch_optional(&*self.pool)
            .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    /// All items in creation order.
    pub async fn list_all(&self) -> Result<Vec<DeliveryItem>> {
        let rows = sqlx::query("SELECT * FROM delivery_queue ORDER BY created_at ASC, id ASC")
            .fetch_all(&*self.pool)
            .await?;

        rows.iter().map(item_from_row).collect()
    }

    /// Items for one source, in creation order.
    pub async fn list_by_source(&self, source_id: &str) -> Result<Vec<DeliveryItem>> {
        let rows = sqlx::query(
            "SELECT * FROM delivery_queue WHERE source_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(source_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    /// Items in one status, in creation order.
    pub async fn list_by_status(&self, status: DeliveryStatus) -> Result<Vec<DeliveryItem>> {
        let rows = sqlx::query(
            "SELECT * FROM delivery_queue WHERE status = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    /// The per-attempt failure history of an item.
    pub async fn retry_history(&self, item_id: ItemId) -> Result<Vec<RetryLogEntry>> {
        let log_json: String =
            sqlx::query_scalar("SELECT retry_log FROM delivery_queue WHERE item_id = ?")
                .bind(item_id.to_string())
                .fetch_optional(&*self.pool)
                .await?
                .ok_or_else(|| CoreError::item_not_found(item_id))?;

        Ok(serde_json::from_str(&log_json)?)
    }

    /// Aggregate counters for status display.
    pub async fn stats(&self) -> Result<QueueStats> {
        let now = self.clock.now_unix();
        let mut stats = QueueStats::default();

        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM delivery_queue GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<DeliveryStatus>()? {
                DeliveryStatus::Pending => stats.pending = n,
                DeliveryStatus::InFlight => stats.in_flight = n,
                DeliveryStatus::Failed => stats.failed = n,
                DeliveryStatus::Dlq => stats.dlq = n,
                DeliveryStatus::TargetPaused => stats.target_paused = n,
                DeliveryStatus::Delivered | DeliveryStatus::Dismissed => {},
            }
        }

        stats.delivered_today = sqlx::query_scalar(
            "SELECT COUNT(*) FROM delivery_queue WHERE status = 'delivered' AND delivered_at >= ?",
        )
        .bind(now - 86_400)
        .fetch_one(&*self.pool)
        .await?;

        stats.last_delivered_at =
            sqlx::query_scalar("SELECT MAX(delivered_at) FROM delivery_queue")
                .fetch_one(&*self.pool)
                .await?;

        Ok(stats)
    }

    /// Distinguishes "no such item" from "wrong state" after a guarded
    /// UPDATE matched zero rows.
    async fn require_transition(
        &self,
        rows_affected: u64,
        item_id: ItemId,
        to: &str,
    ) -> Result<()> {
        if rows_affected > 0 {
            return Ok(());
        }

        match self.find(item_id).await? {
            Some(item) => Err(CoreError::InvalidTransition(format!(
                "cannot move item {item_id} from {} to {to}",
                item.status
            ))),
            None => Err(CoreError::item_not_found(item_id)),
        }
    }
}

fn item_from_row(row: &SqliteRow) -> Result<DeliveryItem> {
    let item_id: String = row.try_get("item_id")?;
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger_type")?;
    let payload: String = row.try_get("payload")?;
    let delivered_to: Option<String> = row.try_get("delivered_to")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let max_retries: i64 = row.try_get("max_retries")?;

    Ok(DeliveryItem {
        id: row.try_get("id")?,
        item_id: item_id.parse()?,
        source_id: row.try_get("source_id")?,
        event_type: row.try_get("event_type")?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse()?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        last_error: row.try_get("last_error")?,
        trigger_type: trigger.parse()?,
        target_endpoint_id: row.try_get("target_endpoint_id")?,
        delivered_to: delivered_to.as_deref().map(serde_json::from_str).transpose()?,
        available_at: row.try_get("available_at")?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}
