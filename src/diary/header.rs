//! Diary header: identity, phase, risk level, phase-transition timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain_types::{CorrelationId, PatientId};

/// Top-level state of a patient's journey; drives phase-based routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Collecting demographic and referral data.
    Intake,
    /// Clinical assessment in progress.
    Clinical,
    /// Selecting and confirming an appointment slot.
    Booking,
    /// Post-appointment monitoring.
    Monitoring,
    /// Terminal: events are logged but not routed.
    Closed,
}

/// Clinical risk stratification carried on the diary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// No risk indicators observed.
    None,
    /// Low risk.
    Low,
    /// Medium risk.
    Medium,
    /// High risk.
    High,
    /// Critical, immediate-attention risk.
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::None
    }
}

/// Identity, phase and risk-level section of [`crate::diary::PatientDiary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiaryHeader {
    /// The patient this diary belongs to.
    pub patient_id: PatientId,
    /// Current top-level phase.
    pub current_phase: Phase,
    /// Current risk stratification.
    pub risk_level: RiskLevel,
    /// When this diary was first created.
    pub created: DateTime<Utc>,
    /// When this diary was last successfully mutated.
    pub last_updated: DateTime<Utc>,
    /// Correlation id of the chain that created this diary, if any.
    pub correlation_id: Option<CorrelationId>,
    /// Timestamp of the most recent phase transition; equals `created`
    /// initially and must survive process restarts (it is persisted on the
    /// diary itself, not held only in memory).
    pub phase_entered_at: DateTime<Utc>,
}

impl DiaryHeader {
    /// Builds a fresh header for a brand-new diary, entering intake now.
    #[must_use]
    pub fn new(patient_id: PatientId, correlation_id: Option<CorrelationId>) -> Self {
        let now = Utc::now();
        Self {
            patient_id,
            current_phase: Phase::Intake,
            risk_level: RiskLevel::None,
            created: now,
            last_updated: now,
            correlation_id,
            phase_entered_at: now,
        }
    }

    /// Transitions to `phase`, stamping `phase_entered_at` only if the phase
    /// actually changed.
    pub fn transition_to(&mut self, phase: Phase) {
        if phase != self.current_phase {
            self.current_phase = phase;
            self.phase_entered_at = Utc::now();
        }
    }
}
