//! Command/query facade over the pipeline.
//!
//! `PipelineService` is the narrow surface a host application (UI, CLI)
//! calls. Commands validate, mutate durable state, and return; queries are
//! computed fresh from rows on every call rather than from any global
//! status flag, so unrelated sources can never alias each other's state.

use std::sync::Arc;

use courier_core::{
    Binding, CoreError, CredentialError, CredentialStore, DeliveryItem, DeliveryStatus, ItemId,
    NewBinding, SourceError, Storage, TimelineGap, TriggerType,
};
use courier_delivery::{
    diagnose::diagnose_error, DeliveryError, ErrorDiagnosis, Scheduler, SourceDirectory,
    TargetDirectory, TargetHealthTracker,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Result type alias using `ServiceError`.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced to the host application. Every variant renders as a
/// human-readable message.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Durable storage failed.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// Delivery machinery failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Reading a source payload failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The credential store failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// No source registered under the id.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// No target registered under the id.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// The source is disabled in settings.
    #[error("source {0} is disabled")]
    SourceDisabled(String),

    /// The source has no active bindings to push through.
    #[error("source {0} has no active bindings")]
    NoActiveBindings(String),

    /// The item is in a state the operation does not apply to.
    #[error("item {item_id} is {status}, {operation} does not apply")]
    InvalidState {
        /// Item the operation was attempted on.
        item_id: ItemId,
        /// Its current status.
        status: DeliveryStatus,
        /// The rejected operation.
        operation: &'static str,
    },
}

/// Overall pipeline state, derived from queue rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Nothing queued, nothing wrong.
    Active,
    /// Work is queued or in flight.
    Pending,
    /// Something failed and has not been resolved or dismissed.
    Error,
}

/// Pipeline status summary.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatusSummary {
    /// Worst-state rollup across the queue.
    pub overall: OverallStatus,
    /// Items queued or in flight.
    pub pending_count: i64,
    /// Items failed, dead-lettered, or parked behind a degraded target.
    pub failed_count: i64,
    /// Unix timestamp of the most recent successful delivery.
    pub last_delivery: Option<i64>,
}

/// Health of one registered target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetHealthReport {
    /// Target id.
    pub target_id: String,
    /// Human-readable target name.
    pub name: String,
    /// `healthy` or `degraded`.
    pub state: &'static str,
    /// Why the target degraded, when it did.
    pub reason: Option<String>,
    /// Unix timestamp of the degradation, when degraded.
    pub degraded_at: Option<i64>,
    /// Items currently held back behind this target.
    pub queued_count: i64,
}

/// Outcome of a reconnect probe.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectOutcome {
    /// Target that was probed.
    pub target_id: String,
    /// Whether the probe succeeded.
    pub healthy: bool,
    /// Parked items returned to the queue on success.
    pub resumed_count: u64,
    /// On failure, whether the error was auth-class (re-auth required
    /// rather than waiting out an outage).
    pub needs_reauth: bool,
}

/// Confirmation of a triggered push.
#[derive(Debug, Clone, Serialize)]
pub struct PushReceipt {
    /// Source that was pushed.
    pub source_id: String,
    /// One enqueued item per active binding.
    pub item_ids: Vec<ItemId>,
}

/// The service facade over storage, health, and the directories.
pub struct PipelineService {
    storage: Arc<Storage>,
    health: Arc<TargetHealthTracker>,
    targets: Arc<TargetDirectory>,
    sources: Arc<SourceDirectory>,
    credentials: Arc<dyn CredentialStore>,
    scheduler: Arc<Scheduler>,
}

impl PipelineService {
    /// Creates the service.
    pub fn new(
        storage: Arc<Storage>,
        health: Arc<TargetHealthTracker>,
        targets: Arc<TargetDirectory>,
        sources: Arc<SourceDirectory>,
        credentials: Arc<dyn CredentialStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self { storage, health, targets, sources, credentials, scheduler }
    }

    /// Rollup status across the whole queue.
    pub async fn delivery_status(&self) -> Result<DeliveryStatusSummary> {
        let stats = self.storage.queue.stats().await?;
        Ok(summarize(
            stats.pending + stats.in_flight,
            stats.failed + stats.dlq + stats.target_paused,
            stats.last_delivered_at,
        ))
    }

    /// Rollup status for one source, computed from its rows alone.
    pub async fn source_delivery_status(&self, source_id: &str) -> Result<DeliveryStatusSummary> {
        let items = self.storage.queue.list_by_source(source_id).await?;

        let mut pending = 0;
        let mut failed = 0;
        let mut last_delivery = None;
        for item in &items {
            match item.status {
                DeliveryStatus::Pending | DeliveryStatus::InFlight => pending += 1,
                DeliveryStatus::Failed | DeliveryStatus::Dlq | DeliveryStatus::TargetPaused => {
                    failed += 1;
                },
                DeliveryStatus::Delivered => {
                    last_delivery = last_delivery.max(item.delivered_at);
                },
                DeliveryStatus::Dismissed => {},
            }
        }

        Ok(summarize(pending, failed, last_delivery))
    }

    /// Every queue item, newest first.
    pub async fn delivery_queue(&self) -> Result<Vec<DeliveryItem>> {
        let mut items = self.storage.queue.list_all().await?;
        items.reverse();
        Ok(items)
    }

    /// Scheduled deliveries that should have fired but did not.
    pub async fn timeline_gaps(&self) -> Result<Vec<TimelineGap>> {
        Ok(self.scheduler.timeline_gaps().await?)
    }

    /// Health of every registered target, with the count of items held
    /// back behind degraded ones.
    pub async fn target_health(&self) -> Result<Vec<TargetHealthReport>> {
        let bindings = self.storage.bindings.list_all().await?;

        let mut reports = Vec::new();
        for target_id in self.targets.ids() {
            let Some(target) = self.targets.get(&target_id) else { continue };

            let mut queued_count = 0;
            for binding in bindings.iter().filter(|b| b.target_id == target_id) {
                queued_count +=
                    self.storage.queue.count_paused_for_endpoint(&binding.endpoint_id).await?;
            }

            let report = match self.health.is_degraded(&target_id) {
                Some(info) => TargetHealthReport {
                    target_id,
                    name: target.name().to_string(),
                    state: "degraded",
                    reason: Some(info.reason),
                    degraded_at: Some(info.degraded_at),
                    queued_count,
                },
                None => TargetHealthReport {
                    target_id,
                    name: target.name().to_string(),
                    state: "healthy",
                    reason: None,
                    degraded_at: None,
                    queued_count,
                },
            };
            reports.push(report);
        }

        Ok(reports)
    }

    /// Pushes a fresh snapshot of a source through every active binding.
    ///
    /// One item is enqueued per binding, so each route retries and fails
    /// independently.
    #[instrument(skip(self))]
    pub async fn trigger_source_push(&self, source_id: &str) -> Result<PushReceipt> {
        if !self.storage.settings.source_enabled(source_id).await? {
            return Err(ServiceError::SourceDisabled(source_id.to_string()));
        }

        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| ServiceError::SourceNotFound(source_id.to_string()))?;

        let bindings = self.storage.bindings.active_for_source(source_id).await?;
        if bindings.is_empty() {
            return Err(ServiceError::NoActiveBindings(source_id.to_string()));
        }

        // One parse, fanned out to every binding
        let payload = source.snapshot()?;

        let mut item_ids = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let item_id = self
                .storage
                .queue
                .enqueue_targeted(
                    source_id,
                    source.event_type(),
                    &payload,
                    TriggerType::Manual,
                    &binding.endpoint_id,
                )
                .await?;

            self.record_attempted_target(item_id, binding).await?;
            item_ids.push(item_id);
        }

        info!(source_id, enqueued = item_ids.len(), "manual push enqueued");
        Ok(PushReceipt { source_id: source_id.to_string(), item_ids })
    }

    /// Re-enqueues a finished item's payload as a fresh manual delivery.
    ///
    /// The original entry is never mutated; replaying twice produces two
    /// independent new items.
    #[instrument(skip(self))]
    pub async fn replay_delivery(&self, entry_id: ItemId) -> Result<ItemId> {
        let item = self
            .storage
            .queue
            .find(entry_id)
            .await?
            .ok_or_else(|| CoreError::item_not_found(entry_id))?;

        if matches!(item.status, DeliveryStatus::Pending | DeliveryStatus::InFlight) {
            return Err(ServiceError::InvalidState {
                item_id: entry_id,
                status: item.status,
                operation: "replay",
            });
        }

        let new_id = match &item.target_endpoint_id {
            Some(endpoint_id) => {
                self.storage
                    .queue
                    .enqueue_targeted(
                        &item.source_id,
                        &item.event_type,
                        &item.payload,
                        TriggerType::Manual,
                        endpoint_id,
                    )
                    .await?
            },
            None => {
                self.storage
                    .queue
                    .enqueue(&item.source_id, &item.event_type, &item.payload, TriggerType::Manual)
                    .await?
            },
        };

        if let Some(delivered_to) = &item.delivered_to {
            self.storage.queue.set_attempted_target(new_id, delivered_to).await?;
        }

        info!(original = %entry_id, replay = %new_id, "delivery replayed");
        Ok(new_id)
    }

    /// Diagnoses the recorded failure of a queue entry.
    ///
    /// Advisory only; the retry state machine never consults the result.
    pub async fn diagnose_entry(&self, entry_id: ItemId) -> Result<ErrorDiagnosis> {
        let item = self
            .storage
            .queue
            .find(entry_id)
            .await?
            .ok_or_else(|| CoreError::item_not_found(entry_id))?;

        let Some(error_text) = &item.last_error else {
            return Err(ServiceError::InvalidState {
                item_id: entry_id,
                status: item.status,
                operation: "diagnose",
            });
        };

        let source_name = self
            .sources
            .get(&item.source_id)
            .map_or_else(|| item.source_id.clone(), |s| s.name().to_string());
        let endpoint_name = item
            .delivered_to
            .as_ref()
            .map(|d| d.endpoint_name.clone())
            .or_else(|| item.target_endpoint_id.clone())
            .unwrap_or_else(|| "endpoint".to_string());

        Ok(diagnose_error(
            extract_http_status(error_text),
            error_text,
            &source_name,
            &endpoint_name,
        ))
    }

    /// Dismisses a failed or dead-lettered entry, keeping the audit row.
    pub async fn dismiss_dlq_entry(&self, entry_id: ItemId) -> Result<()> {
        self.storage.queue.dismiss(entry_id).await?;
        info!(item_id = %entry_id, "entry dismissed");
        Ok(())
    }

    /// Probes a target and, on success, restores its health and resumes
    /// every item parked behind it.
    #[instrument(skip(self))]
    pub async fn reconnect_target(&self, target_id: &str) -> Result<ReconnectOutcome> {
        let target = self
            .targets
            .get(target_id)
            .ok_or_else(|| ServiceError::TargetNotFound(target_id.to_string()))?;

        match target.test_connection().await {
            Ok(()) => {
                self.health.mark_reconnected(target_id);

                let mut resumed_count = 0;
                for binding in self.storage.bindings.list_all().await? {
                    if binding.target_id == target_id {
                        resumed_count += self
                            .storage
                            .queue
                            .resume_paused_for_endpoint(&binding.endpoint_id)
                            .await?;
                    }
                }

                info!(target_id, resumed_count, "target reconnected");
                Ok(ReconnectOutcome {
                    target_id: target_id.to_string(),
                    healthy: true,
                    resumed_count,
                    needs_reauth: false,
                })
            },
            Err(error) => {
                warn!(target_id, error = %error, "reconnect probe failed");
                Ok(ReconnectOutcome {
                    target_id: target_id.to_string(),
                    healthy: false,
                    resumed_count: 0,
                    needs_reauth: error.is_auth(),
                })
            },
        }
    }

    /// Creates or replaces a binding.
    ///
    /// When `auth_header_value` is provided the secret is written to the
    /// credential store and only its key is persisted; when it is absent
    /// an existing credential for the same binding survives the update.
    pub async fn create_binding(
        &self,
        mut binding: NewBinding,
        auth_header_value: Option<String>,
    ) -> Result<Binding> {
        match auth_header_value {
            Some(secret) => {
                let key = format!("binding:{}:{}", binding.source_id, binding.endpoint_id);
                self.credentials.store(&key, &secret)?;
                binding.auth_credential_key = Some(key);
                binding.preserve_credential = false;
            },
            None => {
                binding.preserve_credential = true;
            },
        }

        let stored = self.storage.bindings.upsert(binding).await?;
        info!(binding_id = %stored.binding_id(), "binding saved");
        Ok(stored)
    }

    /// Deactivates a binding. Items already queued for other bindings of
    /// the same source are unaffected.
    pub async fn remove_binding(&self, source_id: &str, endpoint_id: &str) -> Result<()> {
        self.storage.bindings.deactivate(source_id, endpoint_id).await?;
        info!(source_id, endpoint_id, "binding removed");
        Ok(())
    }

    /// Bindings for one source, active or not.
    pub async fn source_bindings(&self, source_id: &str) -> Result<Vec<Binding>> {
        Ok(self.storage.bindings.for_source(source_id).await?)
    }

    /// Every binding.
    pub async fn all_bindings(&self) -> Result<Vec<Binding>> {
        Ok(self.storage.bindings.list_all().await?)
    }

    /// Enables pushes for a source.
    pub async fn enable_source(&self, source_id: &str) -> Result<()> {
        self.storage.settings.set_source_enabled(source_id, true).await?;
        Ok(())
    }

    /// Disables pushes for a source. Already-queued items still deliver.
    pub async fn disable_source(&self, source_id: &str) -> Result<()> {
        self.storage.settings.set_source_enabled(source_id, false).await?;
        Ok(())
    }

    async fn record_attempted_target(&self, item_id: ItemId, binding: &Binding) -> Result<()> {
        let delivered_to = match self.targets.get(&binding.target_id) {
            Some(target) => binding.delivered_to(target.target_type(), target.base_url()),
            None => binding.delivered_to("webhook", &binding.endpoint_url),
        };
        self.storage.queue.set_attempted_target(item_id, &delivered_to).await?;
        Ok(())
    }
}

/// Pulls an "HTTP NNN" status code out of a recorded error message, where
/// one survives only as text.
fn extract_http_status(text: &str) -> Option<u16> {
    let digits: String = text
        .split("HTTP ")
        .nth(1)?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn summarize(pending: i64, failed: i64, last_delivery: Option<i64>) -> DeliveryStatusSummary {
    let overall = if failed > 0 {
        OverallStatus::Error
    } else if pending > 0 {
        OverallStatus::Pending
    } else {
        OverallStatus::Active
    };

    DeliveryStatusSummary { overall, pending_count: pending, failed_count: failed, last_delivery }
}
