//! Domain models for the delivery pipeline.
//!
//! A [`DeliveryItem`] is one unit of work: one payload snapshot bound for one
//! target endpoint. Fan-out happens at enqueue time, so a source with two
//! active bindings produces two independent items with independent retry
//! state.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Unique identifier for a delivery item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generates a new random item ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidInput(format!("malformed item id {s:?}: {e}")))
    }
}

/// Lifecycle status of a delivery item.
///
/// Transitions: `pending -> in_flight -> {delivered | failed}`;
/// `failed -> {pending (retry) | dlq}`. A claimed item whose target is
/// degraded is parked as `target_paused` without consuming a retry.
/// `failed` and `dlq` items can be `dismissed`, which removes them from
/// active failure views while keeping the audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for the worker to pick it up.
    Pending,
    /// Claimed by a worker, delivery attempt in progress.
    InFlight,
    /// Delivered successfully. Terminal.
    Delivered,
    /// Last attempt failed; eligible again once the backoff gate passes.
    Failed,
    /// Retries exhausted. Terminal until replayed or dismissed.
    Dlq,
    /// Held back because the target is degraded; no retry consumed.
    TargetPaused,
    /// Acknowledged failure, excluded from active views. Terminal.
    Dismissed,
}

impl DeliveryStatus {
    /// Canonical storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
            Self::TargetPaused => "target_paused",
            Self::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dlq" => Ok(Self::Dlq),
            "target_paused" => Ok(Self::TargetPaused),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(CoreError::InvalidInput(format!("unknown delivery status {other:?}"))),
        }
    }
}

/// Provenance of a delivery item. Surfaced for audit, never consulted by the
/// delivery logic itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Enqueued by a source watcher reacting to a local change.
    FileChange,
    /// Enqueued by an explicit "push now" or replay request.
    Manual,
    /// Enqueued by the scheduler for a daily/weekly binding.
    Scheduled,
}

impl TriggerType {
    /// Canonical storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileChange => "file_change",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_change" => Ok(Self::FileChange),
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(CoreError::InvalidInput(format!("unknown trigger type {other:?}"))),
        }
    }
}

/// One entry of a delivery item's failure history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLogEntry {
    /// Unix timestamp of the failed attempt.
    pub at: i64,
    /// Error message recorded for the attempt.
    pub error: String,
    /// Attempt number (1-based).
    pub attempt: u32,
}

/// Resolved destination of a delivery, recorded for audit and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredTo {
    /// Target the endpoint belongs to.
    pub target_id: String,
    /// Target kind (webhook, automation platform, ...).
    pub target_type: String,
    /// Base URL of the target.
    pub base_url: String,
    /// Endpoint identifier within the target.
    pub endpoint_id: String,
    /// Human-readable endpoint name.
    pub endpoint_name: String,
    /// Endpoint URL the payload was (or will be) sent to.
    pub endpoint_url: String,
}

/// One unit of delivery work, durably persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryItem {
    /// Monotonic row id, reflects creation order.
    pub id: i64,
    /// Stable unique identifier.
    pub item_id: ItemId,
    /// Source that produced the payload.
    pub source_id: String,
    /// Semantic tag for the payload shape.
    pub event_type: String,
    /// Payload snapshot, stored verbatim for replay.
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Failed attempts so far. Monotonically non-decreasing.
    pub retry_count: u32,
    /// Attempt bound; a failure at this count moves the item to the DLQ.
    pub max_retries: u32,
    /// Error recorded by the most recent failed attempt.
    pub last_error: Option<String>,
    /// How this item came to exist.
    pub trigger_type: TriggerType,
    /// Endpoint this item was fanned out to, when known at enqueue time.
    pub target_endpoint_id: Option<String>,
    /// Resolved destination, recorded at enqueue and confirmed on delivery.
    pub delivered_to: Option<DeliveredTo>,
    /// Unix timestamp before which the item is not eligible for claiming.
    pub available_at: i64,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of successful delivery. Set iff status is `delivered`.
    pub delivered_at: Option<i64>,
}

/// Per-binding delivery cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Deliver whenever the source reports a change.
    OnChange,
    /// Deliver on a fixed interval. Excluded from gap detection.
    Interval,
    /// Deliver once per day at `schedule_time`.
    Daily,
    /// Deliver once per week at `schedule_time` on `schedule_day`.
    Weekly,
}

impl DeliveryMode {
    /// Canonical storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnChange => "on_change",
            Self::Interval => "interval",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// True for modes driven by the scheduler rather than source changes.
    pub fn is_scheduled(self) -> bool {
        !matches!(self, Self::OnChange)
    }
}

impl Default for DeliveryMode {
    fn default() -> Self {
        Self::OnChange
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_change" => Ok(Self::OnChange),
            "interval" => Ok(Self::Interval),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(CoreError::InvalidInput(format!("unknown delivery mode {other:?}"))),
        }
    }
}

/// A configured delivery route from a source to a target endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Source side of the route.
    pub source_id: String,
    /// Target the endpoint belongs to.
    pub target_id: String,
    /// Endpoint identifier within the target. Unique per source.
    pub endpoint_id: String,
    /// Endpoint URL deliveries are sent to.
    pub endpoint_url: String,
    /// Human-readable endpoint name.
    pub endpoint_name: String,
    /// Soft-disable flag; inactive bindings receive no new deliveries.
    pub active: bool,
    /// Non-secret custom headers sent with every delivery.
    pub custom_headers: HashMap<String, String>,
    /// Header that carries the auth credential, when one is configured.
    /// The credential value itself lives in the credential store.
    pub auth_header_name: Option<String>,
    /// Opaque reference into the credential store. Never the secret itself.
    pub auth_credential_key: Option<String>,
    /// Delivery cadence.
    pub delivery_mode: DeliveryMode,
    /// "HH:MM" local fire time for daily/weekly modes.
    pub schedule_time: Option<String>,
    /// Weekday name for weekly mode.
    pub schedule_day: Option<String>,
    /// Unix timestamp of the last scheduler-initiated delivery.
    pub last_scheduled_at: Option<i64>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl Binding {
    /// Stable display identifier for a binding.
    pub fn binding_id(&self) -> String {
        format!("{}.{}", self.source_id, self.endpoint_id)
    }

    /// Builds the destination audit record for this binding.
    pub fn delivered_to(&self, target_type: &str, base_url: &str) -> DeliveredTo {
        DeliveredTo {
            target_id: self.target_id.clone(),
            target_type: target_type.to_string(),
            base_url: base_url.to_string(),
            endpoint_id: self.endpoint_id.clone(),
            endpoint_name: self.endpoint_name.clone(),
            endpoint_url: self.endpoint_url.clone(),
        }
    }
}

/// Input for creating or replacing a binding.
///
/// `auth_credential_key: None` combined with `preserve_credential: true`
/// keeps the existing credential reference, letting a user edit non-secret
/// fields without re-entering the secret.
#[derive(Debug, Clone, Default)]
pub struct NewBinding {
    /// Source side of the route.
    pub source_id: String,
    /// Target the endpoint belongs to.
    pub target_id: String,
    /// Endpoint identifier within the target.
    pub endpoint_id: String,
    /// Endpoint URL deliveries are sent to.
    pub endpoint_url: String,
    /// Human-readable endpoint name.
    pub endpoint_name: String,
    /// Non-secret custom headers.
    pub custom_headers: HashMap<String, String>,
    /// Header carrying the auth credential, when configured.
    pub auth_header_name: Option<String>,
    /// New credential reference, when the secret was (re-)entered.
    pub auth_credential_key: Option<String>,
    /// Keep the existing credential reference when no new one is supplied.
    pub preserve_credential: bool,
    /// Delivery cadence.
    pub delivery_mode: DeliveryMode,
    /// "HH:MM" local fire time for daily/weekly modes.
    pub schedule_time: Option<String>,
    /// Weekday name for weekly mode.
    pub schedule_day: Option<String>,
}

/// Aggregate queue counters for status display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items waiting to be claimed.
    pub pending: i64,
    /// Items currently being attempted.
    pub in_flight: i64,
    /// Items delivered in the last 24 hours.
    pub delivered_today: i64,
    /// Items waiting out a backoff after a failed attempt.
    pub failed: i64,
    /// Items that exhausted their retries.
    pub dlq: i64,
    /// Items held back behind a degraded target.
    pub target_paused: i64,
    /// Unix timestamp of the most recent successful delivery.
    pub last_delivered_at: Option<i64>,
}

/// A missed scheduled-delivery window. Computed on demand, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineGap {
    /// Source whose scheduled delivery is overdue.
    pub source_id: String,
    /// Human-readable source name.
    pub source_name: String,
    /// Binding display identifier (`source.endpoint`).
    pub binding_id: String,
    /// RFC 3339 time the delivery was expected to fire.
    pub expected_at: String,
    /// Cadence of the overdue binding.
    pub delivery_mode: DeliveryMode,
    /// RFC 3339 time of the last scheduler-initiated delivery, if any.
    pub last_delivered_at: Option<String>,
}
