//! Post-appointment monitoring: entries, alerts, and deterioration tracking.
//!
//! Entries are capped per `GatewayConfig::monitoring_entries_cap`, passed
//! in by every caller of [`MonitoringSection::push_entry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Clinical severity assigned to a completed deterioration assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Mild, no escalation needed.
    Mild,
    /// Moderate, should be reviewed soon.
    Moderate,
    /// Severe, needs prompt clinical attention.
    Severe,
    /// Emergency; immediate escalation required.
    Emergency,
}

/// A single answered or unanswered question in a deterioration assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentQuestion {
    /// The question text.
    pub question: String,
    /// The patient's answer, if given.
    pub answer: Option<String>,
    /// Clinical category the question belongs to.
    pub category: String,
}

/// An interactive post-appointment deterioration check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeteriorationAssessment {
    /// `true` while the assessment is in progress.
    pub active: bool,
    /// Ordered list of questions asked so far.
    pub questions: Vec<AssessmentQuestion>,
    /// `true` once the assessment has a final severity and recommendation.
    pub assessment_complete: bool,
    /// Final severity, once complete.
    pub severity: Option<Severity>,
    /// Recommended next action, once complete.
    pub recommendation: Option<String>,
    /// Free-text reasoning behind the severity/recommendation.
    pub reasoning: Option<String>,
    /// When the assessment started.
    pub started: Option<DateTime<Utc>>,
}

impl DeteriorationAssessment {
    /// Starts a fresh assessment, replacing any previous state.
    pub fn start(&mut self) {
        *self = Self {
            active: true,
            started: Some(Utc::now()),
            ..Self::default()
        };
    }

    /// Force-completes a stalled assessment with a conservative severity:
    /// at least moderate when answers exist, exactly moderate otherwise.
    pub fn force_complete_as_stalled(&mut self) {
        let has_answers = self.questions.iter().any(|q| q.answer.is_some());
        self.assessment_complete = true;
        self.severity = Some(if has_answers {
            self.severity.unwrap_or(Severity::Moderate).max(Severity::Moderate)
        } else {
            Severity::Moderate
        });
        self.recommendation.get_or_insert_with(|| {
            "Escalating due to no response; please contact the patient directly.".to_string()
        });
    }
}

/// A single bounded monitoring log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEntry {
    /// Machine-readable entry kind, e.g. `"heartbeat_14d"`, `"assessment_timeout"`.
    pub kind: String,
    /// Free-text detail.
    pub detail: String,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A scheduled question in the risk-stratified post-appointment plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledQuestion {
    /// Day offset from the appointment at which to ask.
    pub day_offset: i64,
    /// The question text.
    pub text: String,
    /// `true` once asked.
    pub asked: bool,
}

/// Monitoring state: activity flag, baseline, bounded log, alerts, plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringSection {
    /// `true` while the patient is in the post-appointment monitoring window.
    pub monitoring_active: bool,
    /// Baseline lab snapshot, keyed by test name.
    pub baseline: std::collections::HashMap<String, f64>,
    /// Bounded, FIFO-evicted log of monitoring events.
    pub entries: VecDeque<MonitoringEntry>,
    /// Tags of alerts fired so far (e.g. `"phase_stale_booking"`).
    pub alerts_fired: Vec<String>,
    /// Next scheduled automated check, if any.
    pub next_scheduled_check: Option<DateTime<Utc>>,
    /// The date of the patient's appointment.
    pub appointment_date: Option<DateTime<Utc>>,
    /// Risk-stratified plan of scheduled post-appointment questions.
    pub communication_plan: Vec<ScheduledQuestion>,
    /// Interactive deterioration check state.
    pub deterioration_assessment: DeteriorationAssessment,
}

impl MonitoringSection {
    /// Appends `entry`, evicting the oldest entry if over `cap`.
    pub fn push_entry(&mut self, entry: MonitoringEntry, cap: usize) {
        self.entries.push_back(entry);
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
    }

    /// `true` iff an entry with this exact `kind` already exists.
    #[must_use]
    pub fn has_entry_kind(&self, kind: &str) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_capped_with_fifo_eviction() {
        const CAP: usize = 50;
        let mut monitoring = MonitoringSection::default();
        for i in 0..(CAP + 10) {
            monitoring.push_entry(
                MonitoringEntry {
                    kind: format!("entry_{i}"),
                    detail: String::new(),
                    timestamp: Utc::now(),
                },
                CAP,
            );
        }
        assert_eq!(monitoring.entries.len(), CAP);
        assert!(!monitoring.has_entry_kind("entry_0"));
        assert!(monitoring.has_entry_kind("entry_59"));
    }

    #[test]
    fn stalled_assessment_with_no_answers_completes_as_moderate() {
        let mut assessment = DeteriorationAssessment::default();
        assessment.start();
        assessment.force_complete_as_stalled();
        assert!(assessment.assessment_complete);
        assert_eq!(assessment.severity, Some(Severity::Moderate));
    }
}
