//! Safety subsystem: rate limiting, stalled-assessment recovery, phase
//! staleness nudges, input truncation, and lab-value validation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::diary::header::Phase;
use crate::diary::monitoring::{MonitoringEntry, Severity};
use crate::diary::PatientDiary;
use crate::domain_types::PatientId;
use crate::event::EventType;

/// User messages are truncated to this many characters before an agent sees them.
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Per-phase staleness SLA. `None` means the phase never goes stale.
#[must_use]
pub fn phase_stale_threshold(phase: Phase) -> Option<Duration> {
    match phase {
        Phase::Intake | Phase::Clinical => Some(Duration::from_secs(72 * 3600)),
        Phase::Booking => Some(Duration::from_secs(48 * 3600)),
        Phase::Monitoring | Phase::Closed => None,
    }
}

/// Truncates `text` in place to [`MAX_MESSAGE_LENGTH`] characters.
pub fn truncate_message(text: &mut String) -> bool {
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        *text = text.chars().take(MAX_MESSAGE_LENGTH).collect();
        true
    } else {
        false
    }
}

/// `true` if the diary's current phase has exceeded its staleness SLA and no
/// nudge has been recorded for it yet.
#[must_use]
pub fn phase_is_newly_stale(diary: &PatientDiary) -> bool {
    let Some(threshold) = phase_stale_threshold(diary.header.current_phase) else {
        return false;
    };
    let elapsed = Utc::now() - diary.header.phase_entered_at;
    let kind = phase_stale_entry_kind(diary.header.current_phase);
    elapsed > chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero())
        && !diary.monitoring.has_entry_kind(&kind)
}

/// The bounded-log entry kind recorded for a phase-staleness nudge.
#[must_use]
pub fn phase_stale_entry_kind(phase: Phase) -> String {
    let name = match phase {
        Phase::Intake => "intake",
        Phase::Clinical => "clinical",
        Phase::Booking => "booking",
        Phase::Monitoring => "monitoring",
        Phase::Closed => "closed",
    };
    format!("phase_stale_{name}")
}

/// Force-completes a deterioration assessment that has stalled past
/// `timeout`, appending the matching monitoring entry (evicted per
/// `monitoring_cap` like every other entry). Returns `true` if the
/// assessment was stalled and has now been completed.
pub fn recover_stalled_assessment(diary: &mut PatientDiary, timeout: Duration, monitoring_cap: usize) -> bool {
    let assessment = &diary.monitoring.deterioration_assessment;
    let stalled = assessment.active
        && !assessment.assessment_complete
        && assessment
            .started
            .map(|started| Utc::now() - started > chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero()))
            .unwrap_or(false);

    if !stalled {
        return false;
    }

    diary.monitoring.deterioration_assessment.force_complete_as_stalled();
    diary.monitoring.push_entry(
        MonitoringEntry {
            kind: "assessment_timeout".to_string(),
            detail: "deterioration assessment stalled and was force-completed".to_string(),
            timestamp: Utc::now(),
        },
        monitoring_cap,
    );
    true
}

/// `true` iff the just-completed stalled assessment warrants a
/// `DETERIORATION_ALERT` (moderate severity or higher).
#[must_use]
pub fn warrants_deterioration_alert(diary: &PatientDiary) -> bool {
    diary
        .monitoring
        .deterioration_assessment
        .severity
        .is_some_and(|s| s >= Severity::Moderate)
}

/// A plausibility range for one lab value, outside of which the value is
/// excluded from baseline/comparison updates.
#[derive(Debug, Clone, Copy)]
pub struct LabPlausibilityRange {
    /// Inclusive lower bound.
    pub min: f64,
    /// Inclusive upper bound.
    pub max: f64,
}

impl LabPlausibilityRange {
    /// `true` iff `value` falls within `[min, max]`.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Validates a lab value against its plausibility range. When out of range,
/// appends a `lab_validation_warning` entry and the value is excluded from
/// baseline/comparison updates by the caller.
pub fn validate_lab_value(
    diary: &mut PatientDiary,
    test_name: &str,
    value: f64,
    range: LabPlausibilityRange,
    monitoring_cap: usize,
) -> bool {
    if range.contains(value) {
        return true;
    }
    diary.monitoring.push_entry(
        MonitoringEntry {
            kind: "lab_validation_warning".to_string(),
            detail: format!("{test_name} value {value} outside plausible range [{}, {}]", range.min, range.max),
            timestamp: Utc::now(),
        },
        monitoring_cap,
    );
    diary.monitoring.alerts_fired.push("lab_validation_warning".to_string());
    false
}

/// `true` if `content_hash` already matches a clinical document on file.
#[must_use]
pub fn is_duplicate_document(diary: &PatientDiary, content_hash: &str) -> bool {
    diary.clinical.has_duplicate_document(content_hash)
}

const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_RATE_LIMIT_THRESHOLD: usize = 15;

/// Per-patient sliding-window rate limiter for `USER_MESSAGE` events at
/// chain depth 0. Internal/hand-off events bypass it entirely. Window and
/// threshold are configured by the caller, typically from `GatewayConfig`.
pub struct RateLimiter {
    window: Duration,
    threshold: usize,
    windows: Mutex<HashMap<PatientId, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_WINDOW, DEFAULT_RATE_LIMIT_THRESHOLD)
    }
}

impl RateLimiter {
    /// Builds a rate limiter with an explicit window and per-window threshold.
    #[must_use]
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a user message for `patient_id` and reports whether the
    /// patient has now exceeded the configured threshold within the window.
    pub fn record_and_check(&self, patient_id: &PatientId) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let window = windows.entry(patient_id.clone()).or_default();
        while let Some(&front) = window.front() {
            if now.duration_since(front) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back(now);
        window.len() > self.threshold
    }
}

/// Checks whether this event type/chain-depth combination is subject to
/// rate limiting at all.
#[must_use]
pub fn is_rate_limit_eligible(event_type: EventType, chain_depth: u32) -> bool {
    chain_depth == 0 && matches!(event_type, EventType::UserMessage)
}

/// Timestamp helper: `true` if `started` is more than `window` in the past.
#[must_use]
pub fn older_than(started: DateTime<Utc>, window: Duration) -> bool {
    Utc::now() - started > chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_caps_at_max_message_length() {
        let mut text = "x".repeat(MAX_MESSAGE_LENGTH + 50);
        assert!(truncate_message(&mut text));
        assert_eq!(text.chars().count(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn rate_limiter_flags_the_16th_message_within_window() {
        let limiter = RateLimiter::default();
        let pid = PatientId::try_new("PT-RATE").unwrap();
        let mut last = false;
        for _ in 0..16 {
            last = limiter.record_and_check(&pid);
        }
        assert!(last);
    }

    #[test]
    fn lab_value_outside_range_is_flagged() {
        let mut diary = PatientDiary::new(PatientId::try_new("PT-1").unwrap(), None);
        let range = LabPlausibilityRange { min: 0.0, max: 10.0 };
        assert!(!validate_lab_value(&mut diary, "glucose", 999.0, range, 50));
        assert!(diary.monitoring.has_entry_kind("lab_validation_warning"));
        assert!(validate_lab_value(&mut diary, "glucose", 5.0, range, 50));
    }
}
