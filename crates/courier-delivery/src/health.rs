//! Per-target health tracking with automatic degradation.
//!
//! Health is derived, never set directly: a target degrades after the
//! configured run of consecutive failures (auth failures degrade at once),
//! and only a successful reconnect probe restores it. A delivery success
//! resets the failure counter but deliberately does not clear degradation;
//! the worker stops attempting degraded targets, so a stray success says
//! nothing about whether the operator fixed the underlying problem.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use courier_core::Clock;
use serde::Serialize;
use tracing::{info, warn};

/// Health tracker configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive transient failures before a target degrades.
    pub degrade_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { degrade_threshold: 3 }
    }
}

/// Classification of a delivery failure for health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Auth rejection. Degrades the target immediately; retrying with the
    /// same credential cannot succeed.
    Auth,
    /// Network, timeout, or endpoint failure. Counts toward the threshold.
    Transient,
    /// Our own misconfiguration or storage trouble. Never the target's
    /// fault, never degrades it.
    Benign,
}

#[derive(Debug, Clone)]
enum HealthState {
    Healthy,
    Degraded { reason: String, degraded_at: i64 },
}

#[derive(Debug)]
struct Entry {
    state: HealthState,
    consecutive_failures: u32,
}

impl Default for Entry {
    fn default() -> Self {
        Self { state: HealthState::Healthy, consecutive_failures: 0 }
    }
}

/// Details of a degraded target.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationInfo {
    /// Target that is degraded.
    pub target_id: String,
    /// Error that tipped it over.
    pub reason: String,
    /// Unix timestamp of the transition.
    pub degraded_at: i64,
}

/// Tracks delivery health per target.
pub struct TargetHealthTracker {
    entries: Mutex<HashMap<String, Entry>>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
}

impl TargetHealthTracker {
    /// Creates a tracker; every target starts healthy.
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), config, clock }
    }

    /// Records a delivery failure. Returns true when this failure caused
    /// the transition to degraded, in which case the caller should pause
    /// the target's backlog.
    pub fn report_failure(&self, target_id: &str, class: FailureClass, reason: &str) -> bool {
        let now = self.clock.now_unix();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(target_id.to_string()).or_default();

        if matches!(entry.state, HealthState::Degraded { .. }) {
            return false;
        }

        entry.consecutive_failures += 1;

        let should_degrade = match class {
            FailureClass::Auth => true,
            FailureClass::Transient => entry.consecutive_failures >= self.config.degrade_threshold,
            FailureClass::Benign => false,
        };

        if should_degrade {
            warn!(
                target_id,
                reason,
                consecutive_failures = entry.consecutive_failures,
                "target degraded"
            );
            entry.state =
                HealthState::Degraded { reason: reason.to_string(), degraded_at: now };
            true
        } else {
            false
        }
    }

    /// Records a successful delivery, resetting the failure run.
    pub fn report_success(&self, target_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(target_id) {
            entry.consecutive_failures = 0;
        }
    }

    /// Degradation details for a target, when it is degraded.
    pub fn is_degraded(&self, target_id: &str) -> Option<DegradationInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(target_id).and_then(|entry| match &entry.state {
            HealthState::Degraded { reason, degraded_at } => Some(DegradationInfo {
                target_id: target_id.to_string(),
                reason: reason.clone(),
                degraded_at: *degraded_at,
            }),
            HealthState::Healthy => None,
        })
    }

    /// Restores a target to healthy after a successful reconnect probe.
    pub fn mark_reconnected(&self, target_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(target_id) {
            info!(target_id, "target reconnected, marking healthy");
            entry.state = HealthState::Healthy;
            entry.consecutive_failures = 0;
        }
    }

    /// All currently degraded targets.
    pub fn all_degraded(&self) -> Vec<DegradationInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter_map(|(target_id, entry)| match &entry.state {
                HealthState::Degraded { reason, degraded_at } => Some(DegradationInfo {
                    target_id: target_id.clone(),
                    reason: reason.clone(),
                    degraded_at: *degraded_at,
                }),
                HealthState::Healthy => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    fn tracker() -> TargetHealthTracker {
        TargetHealthTracker::new(HealthConfig::default(), Arc::new(TestClock::new()))
    }

    #[test]
    fn targets_start_healthy() {
        assert!(tracker().is_degraded("t1").is_none());
    }

    #[test]
    fn auth_failure_degrades_immediately() {
        let tracker = tracker();
        let transitioned = tracker.report_failure("t1", FailureClass::Auth, "HTTP 401");
        assert!(transitioned);

        let info = tracker.is_degraded("t1").unwrap();
        assert_eq!(info.reason, "HTTP 401");
    }

    #[test]
    fn transient_failures_degrade_at_threshold() {
        let tracker = tracker();

        assert!(!tracker.report_failure("t1", FailureClass::Transient, "refused"));
        assert!(tracker.is_degraded("t1").is_none());
        assert!(!tracker.report_failure("t1", FailureClass::Transient, "refused"));
        assert!(tracker.is_degraded("t1").is_none());

        assert!(tracker.report_failure("t1", FailureClass::Transient, "refused"));
        assert!(tracker.is_degraded("t1").is_some());
    }

    #[test]
    fn success_resets_the_run_but_not_degradation() {
        let tracker = tracker();
        tracker.report_failure("t1", FailureClass::Transient, "refused");
        tracker.report_failure("t1", FailureClass::Transient, "refused");
        tracker.report_success("t1");

        // The run starts over
        assert!(!tracker.report_failure("t1", FailureClass::Transient, "refused"));
        assert!(tracker.is_degraded("t1").is_none());

        // Once degraded, success does not heal
        tracker.report_failure("t1", FailureClass::Auth, "HTTP 401");
        tracker.report_success("t1");
        assert!(tracker.is_degraded("t1").is_some());
    }

    #[test]
    fn only_reconnect_restores_health() {
        let tracker = tracker();
        tracker.report_failure("t1", FailureClass::Auth, "token expired");
        assert!(tracker.is_degraded("t1").is_some());

        tracker.mark_reconnected("t1");
        assert!(tracker.is_degraded("t1").is_none());
    }

    #[test]
    fn benign_failures_never_degrade() {
        let tracker = tracker();
        for _ in 0..5 {
            assert!(!tracker.report_failure("t1", FailureClass::Benign, "no credential"));
        }
        assert!(tracker.is_degraded("t1").is_none());
    }

    #[test]
    fn already_degraded_target_reports_no_second_transition() {
        let tracker = tracker();
        assert!(tracker.report_failure("t1", FailureClass::Auth, "HTTP 401"));
        assert!(!tracker.report_failure("t1", FailureClass::Auth, "HTTP 401"));
    }

    #[test]
    fn targets_are_tracked_independently() {
        let tracker = tracker();
        tracker.report_failure("t1", FailureClass::Auth, "HTTP 401");
        tracker.report_failure("t2", FailureClass::Transient, "refused");

        assert!(tracker.is_degraded("t1").is_some());
        assert!(tracker.is_degraded("t2").is_none());
        assert_eq!(tracker.all_degraded().len(), 1);
    }
}
