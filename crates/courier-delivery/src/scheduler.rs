//! Scheduled delivery cadence and timeline-gap detection.
//!
//! A 60-second loop checks daily/weekly/interval bindings and enqueues a
//! fresh source snapshot when one becomes due; the delivery workers handle
//! the actual dispatch with the full retry guarantees. Gap detection is the
//! read-only converse: scheduled bindings past their expected fire time
//! whose delivery never happened.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, Local, NaiveTime, Weekday};
use courier_core::{Binding, Clock, DeliveryMode, Storage, TimelineGap, TriggerType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    directory::{SourceDirectory, TargetDirectory},
    error::Result,
};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due bindings are checked.
    pub check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { check_interval: Duration::from_secs(60) }
    }
}

/// Drives scheduled (non-`on_change`) bindings.
pub struct Scheduler {
    storage: Arc<Storage>,
    sources: Arc<SourceDirectory>,
    targets: Arc<TargetDirectory>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(
        storage: Arc<Storage>,
        sources: Arc<SourceDirectory>,
        targets: Arc<TargetDirectory>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, sources, targets, config, clock, cancellation_token }
    }

    /// Runs the check loop until cancelled.
    pub async fn run(&self) {
        info!(
            check_interval_seconds = self.config.check_interval.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.check_interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
        }

        info!("scheduler stopped");
    }

    /// One pass: enqueue a delivery for every due binding.
    pub async fn tick(&self) -> Result<()> {
        let scheduled = self.storage.bindings.scheduled().await?;
        if scheduled.is_empty() {
            return Ok(());
        }

        let now = self.local_now();

        for binding in &scheduled {
            if !is_due(binding, now) {
                continue;
            }

            if !self.storage.settings.source_enabled(&binding.source_id).await? {
                debug!(
                    source_id = %binding.source_id,
                    "skipping scheduled delivery, source disabled"
                );
                continue;
            }

            let Some(source) = self.sources.get(&binding.source_id) else {
                warn!(source_id = %binding.source_id, "source not found for scheduled delivery");
                continue;
            };

            let payload = match source.snapshot() {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        source_id = %binding.source_id,
                        error = %e,
                        "failed to snapshot source for scheduled delivery"
                    );
                    continue;
                },
            };

            let item_id = self
                .storage
                .queue
                .enqueue_targeted(
                    &binding.source_id,
                    source.event_type(),
                    &payload,
                    TriggerType::Scheduled,
                    &binding.endpoint_id,
                )
                .await?;

            // Record the destination up front so activity views can show
            // where the item is headed before the first attempt
            let delivered_to = match self.targets.get(&binding.target_id) {
                Some(target) => binding.delivered_to(target.target_type(), target.base_url()),
                None => binding.delivered_to("webhook", &binding.endpoint_url),
            };
            self.storage.queue.set_attempted_target(item_id, &delivered_to).await?;

            self.storage
                .bindings
                .touch_last_scheduled(&binding.source_id, &binding.endpoint_id, now.timestamp())
                .await?;

            info!(
                source_id = %binding.source_id,
                endpoint_id = %binding.endpoint_id,
                item_id = %item_id,
                mode = ?binding.delivery_mode,
                "scheduled delivery enqueued"
            );
        }

        Ok(())
    }

    /// Scheduled deliveries that should have fired but did not.
    pub async fn timeline_gaps(&self) -> Result<Vec<TimelineGap>> {
        let bindings = self.storage.bindings.scheduled().await?;
        let now = self.local_now();

        let mut gaps = Vec::new();
        for binding in bindings {
            let Some(expected_ts) = missed_fire_time(&binding, now) else {
                continue;
            };

            let source_name = self
                .sources
                .get(&binding.source_id)
                .map_or_else(|| binding.source_id.clone(), |s| s.name().to_string());

            gaps.push(TimelineGap {
                source_id: binding.source_id.clone(),
                source_name,
                binding_id: binding.binding_id(),
                expected_at: DateTime::from_timestamp(expected_ts, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default(),
                delivery_mode: binding.delivery_mode,
                last_delivered_at: binding
                    .last_scheduled_at
                    .and_then(|ts| DateTime::from_timestamp(ts, 0))
                    .map(|dt| dt.to_rfc3339()),
            });
        }

        debug!(gaps_found = gaps.len(), "timeline gaps computed");
        Ok(gaps)
    }

    fn local_now(&self) -> DateTime<Local> {
        DateTime::<Local>::from(self.clock.now_system())
    }
}

/// Whether a scheduled binding is due to fire now.
fn is_due(binding: &Binding, now: DateTime<Local>) -> bool {
    match binding.delivery_mode {
        DeliveryMode::OnChange => false,
        DeliveryMode::Interval => interval_elapsed(binding, now),
        DeliveryMode::Daily | DeliveryMode::Weekly => {
            let Some(target_ts) = todays_fire_time(binding, now) else {
                return false;
            };

            if now.timestamp() < target_ts {
                return false;
            }

            if binding.delivery_mode == DeliveryMode::Weekly && !weekday_matches(binding, now) {
                return false;
            }

            binding.last_scheduled_at.map_or(true, |last| last < target_ts)
        },
    }
}

/// Interval bindings store their cadence in `schedule_time` as minutes.
fn interval_elapsed(binding: &Binding, now: DateTime<Local>) -> bool {
    let Some(minutes) = binding.schedule_time.as_deref().and_then(|t| t.parse::<i64>().ok())
    else {
        warn!(
            source_id = %binding.source_id,
            schedule_time = ?binding.schedule_time,
            "invalid interval schedule_time"
        );
        return false;
    };

    match binding.last_scheduled_at {
        None => true,
        Some(last) => now.timestamp() - last >= minutes * 60,
    }
}

/// Today's fire time for a daily/weekly binding, as a unix timestamp in the
/// local timezone. None when `schedule_time` is missing or malformed, or
/// the local time does not exist (DST spring-forward).
fn todays_fire_time(binding: &Binding, now: DateTime<Local>) -> Option<i64> {
    let schedule_time = binding.schedule_time.as_deref()?;

    let target_time = match NaiveTime::parse_from_str(schedule_time, "%H:%M") {
        Ok(t) => t,
        Err(_) => {
            warn!(
                source_id = %binding.source_id,
                schedule_time = %schedule_time,
                "invalid schedule_time format"
            );
            return None;
        },
    };

    now.date_naive()
        .and_time(target_time)
        .and_local_timezone(now.timezone())
        .single()
        .map(|dt| dt.timestamp())
}

fn weekday_matches(binding: &Binding, now: DateTime<Local>) -> bool {
    let Some(target_day) = binding.schedule_day.as_deref().and_then(parse_weekday) else {
        warn!(
            source_id = %binding.source_id,
            schedule_day = ?binding.schedule_day,
            "invalid schedule_day"
        );
        return false;
    };

    now.weekday() == target_day
}

/// The expected fire time a binding missed, when it missed one.
fn missed_fire_time(binding: &Binding, now: DateTime<Local>) -> Option<i64> {
    // Interval bindings have no fixed expected time
    if !matches!(binding.delivery_mode, DeliveryMode::Daily | DeliveryMode::Weekly) {
        return None;
    }

    let target_ts = todays_fire_time(binding, now)?;
    if now.timestamp() < target_ts {
        return None;
    }

    if binding.delivery_mode == DeliveryMode::Weekly && !weekday_matches(binding, now) {
        return None;
    }

    let delivered = binding.last_scheduled_at.is_some_and(|last| last >= target_ts);
    if delivered {
        None
    } else {
        Some(target_ts)
    }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_lowercase().as_str() {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use courier_core::{DeliveryStatus, NewBinding, Source, SourceError, TestClock};

    use super::*;

    fn binding(mode: DeliveryMode, time: &str, day: Option<&str>, last: Option<i64>) -> Binding {
        Binding {
            source_id: "stats".to_string(),
            target_id: "t1".to_string(),
            endpoint_id: "e1".to_string(),
            endpoint_url: "https://example.com/hook".to_string(),
            endpoint_name: "alerts".to_string(),
            active: true,
            custom_headers: HashMap::new(),
            auth_header_name: None,
            auth_credential_key: None,
            delivery_mode: mode,
            schedule_time: Some(time.to_string()),
            schedule_day: day.map(str::to_string),
            last_scheduled_at: last,
            created_at: 1000,
        }
    }

    #[test]
    fn daily_is_due_after_fire_time() {
        let b = binding(DeliveryMode::Daily, "09:00", None, None);
        // 2026-02-10 is a Tuesday
        let now = Local.with_ymd_and_hms(2026, 2, 10, 9, 30, 0).unwrap();
        assert!(is_due(&b, now));
    }

    #[test]
    fn daily_not_due_before_fire_time() {
        let b = binding(DeliveryMode::Daily, "09:00", None, None);
        let now = Local.with_ymd_and_hms(2026, 2, 10, 8, 59, 0).unwrap();
        assert!(!is_due(&b, now));
    }

    #[test]
    fn daily_not_due_when_already_fired_today() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let fired_at = Local.with_ymd_and_hms(2026, 2, 10, 9, 5, 0).unwrap().timestamp();
        let b = binding(DeliveryMode::Daily, "09:00", None, Some(fired_at));
        assert!(!is_due(&b, now));
    }

    #[test]
    fn daily_due_again_when_last_fire_was_yesterday() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 9, 30, 0).unwrap();
        let yesterday = Local.with_ymd_and_hms(2026, 2, 9, 9, 5, 0).unwrap().timestamp();
        let b = binding(DeliveryMode::Daily, "09:00", None, Some(yesterday));
        assert!(is_due(&b, now));
    }

    #[test]
    fn weekly_due_only_on_its_day() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 9, 30, 0).unwrap();
        let tuesday = binding(DeliveryMode::Weekly, "09:00", Some("tuesday"), None);
        let monday = binding(DeliveryMode::Weekly, "09:00", Some("monday"), None);

        assert!(is_due(&tuesday, now));
        assert!(!is_due(&monday, now));
    }

    #[test]
    fn interval_fires_when_enough_minutes_elapsed() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 9, 30, 0).unwrap();
        let fresh = binding(DeliveryMode::Interval, "15", None, Some(now.timestamp() - 60));
        let stale = binding(DeliveryMode::Interval, "15", None, Some(now.timestamp() - 1000));
        let never = binding(DeliveryMode::Interval, "15", None, None);

        assert!(!is_due(&fresh, now));
        assert!(is_due(&stale, now));
        assert!(is_due(&never, now));
    }

    #[test]
    fn malformed_schedules_are_never_due() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let mut no_time = binding(DeliveryMode::Daily, "09:00", None, None);
        no_time.schedule_time = None;
        let bad_time = binding(DeliveryMode::Daily, "9am", None, None);
        let bad_day = binding(DeliveryMode::Weekly, "09:00", Some("someday"), None);

        assert!(!is_due(&no_time, now));
        assert!(!is_due(&bad_time, now));
        assert!(!is_due(&bad_day, now));
    }

    #[test]
    fn weekday_parsing_is_case_insensitive() {
        assert_eq!(parse_weekday("monday"), Some(Weekday::Mon));
        assert_eq!(parse_weekday("TUESDAY"), Some(Weekday::Tue));
        assert_eq!(parse_weekday("Sunday"), Some(Weekday::Sun));
        assert_eq!(parse_weekday("invalid"), None);
    }

    #[test]
    fn gap_reported_for_missed_daily_fire() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let expected = Local.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap().timestamp();

        let missed = binding(DeliveryMode::Daily, "09:00", None, None);
        assert_eq!(missed_fire_time(&missed, now), Some(expected));

        let fired = binding(DeliveryMode::Daily, "09:00", None, Some(expected + 60));
        assert_eq!(missed_fire_time(&fired, now), None);
    }

    #[test]
    fn gap_not_reported_before_fire_time_or_for_interval() {
        let now = Local.with_ymd_and_hms(2026, 2, 10, 8, 0, 0).unwrap();
        let pending = binding(DeliveryMode::Daily, "09:00", None, None);
        assert_eq!(missed_fire_time(&pending, now), None);

        let later = Local.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let interval = binding(DeliveryMode::Interval, "15", None, None);
        assert_eq!(missed_fire_time(&interval, later), None);
    }

    #[test]
    fn gap_not_reported_for_weekly_on_other_days() {
        // 2026-02-10 is a Tuesday
        let now = Local.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap();
        let monday = binding(DeliveryMode::Weekly, "09:00", Some("monday"), None);
        assert_eq!(missed_fire_time(&monday, now), None);
    }

    struct FakeSource;

    impl Source for FakeSource {
        fn id(&self) -> &str {
            "stats"
        }

        fn name(&self) -> &str {
            "Stats"
        }

        fn event_type(&self) -> &str {
            "stats.updated"
        }

        fn snapshot(&self) -> std::result::Result<serde_json::Value, SourceError> {
            Ok(serde_json::json!({"sessions": 3}))
        }
    }

    async fn scheduler_with_storage() -> (Scheduler, Arc<Storage>) {
        let clock = Arc::new(TestClock::with_start_time(
            // 2026-02-10 12:00:00 UTC
            std::time::UNIX_EPOCH + Duration::from_secs(1_770_724_800),
        ));
        let storage =
            Arc::new(Storage::open_in_memory(clock.clone() as Arc<dyn Clock>).await.unwrap());
        let sources = Arc::new(SourceDirectory::new());
        sources.register(Arc::new(FakeSource));

        let scheduler = Scheduler::new(
            storage.clone(),
            sources,
            Arc::new(TargetDirectory::new()),
            SchedulerConfig::default(),
            clock as Arc<dyn Clock>,
            CancellationToken::new(),
        );
        (scheduler, storage)
    }

    #[tokio::test]
    async fn tick_enqueues_due_binding_once() {
        let (scheduler, storage) = scheduler_with_storage().await;

        // Midnight fire time is always in the past for the current local day
        storage
            .bindings
            .upsert(NewBinding {
                source_id: "stats".to_string(),
                target_id: "t1".to_string(),
                endpoint_id: "e1".to_string(),
                endpoint_url: "https://example.com/hook".to_string(),
                endpoint_name: "alerts".to_string(),
                delivery_mode: DeliveryMode::Daily,
                schedule_time: Some("00:00".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        scheduler.tick().await.unwrap();

        let items = storage.queue.list_all().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, DeliveryStatus::Pending);
        assert_eq!(items[0].trigger_type, TriggerType::Scheduled);
        assert_eq!(items[0].target_endpoint_id.as_deref(), Some("e1"));
        // Destination recorded before any attempt
        assert!(items[0].delivered_to.is_some());

        // Second tick in the same window must not double-enqueue
        scheduler.tick().await.unwrap();
        assert_eq!(storage.queue.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tick_skips_disabled_sources() {
        let (scheduler, storage) = scheduler_with_storage().await;

        storage
            .bindings
            .upsert(NewBinding {
                source_id: "stats".to_string(),
                target_id: "t1".to_string(),
                endpoint_id: "e1".to_string(),
                endpoint_url: "https://example.com/hook".to_string(),
                endpoint_name: "alerts".to_string(),
                delivery_mode: DeliveryMode::Daily,
                schedule_time: Some("00:00".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        storage.settings.set_source_enabled("stats", false).await.unwrap();

        scheduler.tick().await.unwrap();
        assert!(storage.queue.list_all().await.unwrap().is_empty());
    }
}
