//! The `PatientDiary` aggregate: the single document every agent reads and
//! writes, grouped into sub-sections per concern.

pub mod booking;
pub mod clinical;
pub mod cross_phase;
pub mod gp_channel;
pub mod header;
pub mod helper_registry;
pub mod intake;
pub mod monitoring;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::domain_types::{CorrelationId, PatientId};

pub use booking::BookingSection;
pub use clinical::ClinicalSection;
pub use cross_phase::{CrossPhaseExtraction, CrossPhaseState};
pub use gp_channel::GpChannel;
pub use header::{DiaryHeader, Phase, RiskLevel};
pub use helper_registry::HelperRegistry;
pub use intake::IntakeSection;
pub use monitoring::MonitoringSection;

/// Outbound/inbound direction of a conversation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From the sender to the Gateway/agent.
    Inbound,
    /// From an agent to the sender.
    Outbound,
}

/// Logical conversation separation independent of the transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatChannel {
    /// Before the appointment.
    PreConsultation,
    /// After the appointment, during monitoring.
    Monitoring,
}

/// A single entry in the bounded conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// Inbound or outbound.
    pub direction: Direction,
    /// Transport channel (`"websocket"`, `"sms"`, ...).
    pub channel: String,
    /// The message text, truncated to 200 characters for outbound entries.
    pub message: String,
    /// When this entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Logical chat channel this entry belongs to.
    pub chat_channel: ChatChannel,
}

/// The root per-patient aggregate document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientDiary {
    /// Identity, phase, and risk level.
    pub header: DiaryHeader,
    /// Demographic/intake data.
    pub intake: IntakeSection,
    /// Registered informal helpers.
    pub helper_registry: HelperRegistry,
    /// GP identity and query log.
    pub gp_channel: GpChannel,
    /// Clinical assessment state.
    pub clinical: ClinicalSection,
    /// Appointment booking state.
    pub booking: BookingSection,
    /// Post-appointment monitoring state.
    pub monitoring: MonitoringSection,
    /// Bounded log of all inbound/outbound conversation entries.
    pub conversation_log: VecDeque<ConversationEntry>,
    /// Audit trail of cross-phase content routing.
    pub cross_phase_extractions: Vec<CrossPhaseExtraction>,
    /// In-progress interactive cross-phase follow-up, if any.
    pub cross_phase_state: CrossPhaseState,
}

impl PatientDiary {
    /// Builds a fresh diary for `patient_id`, entering intake now.
    #[must_use]
    pub fn new(patient_id: PatientId, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            header: DiaryHeader::new(patient_id, correlation_id),
            intake: IntakeSection::default(),
            helper_registry: HelperRegistry::default(),
            gp_channel: GpChannel::default(),
            clinical: ClinicalSection::default(),
            booking: BookingSection::default(),
            monitoring: MonitoringSection::default(),
            conversation_log: VecDeque::new(),
            cross_phase_extractions: Vec::new(),
            cross_phase_state: CrossPhaseState::default(),
        }
    }

    /// Appends a conversation entry, evicting the oldest when over `cap`.
    /// Outbound messages are truncated to 200 characters before being
    /// recorded.
    pub fn append_conversation_entry(
        &mut self,
        direction: Direction,
        channel: impl Into<String>,
        message: impl Into<String>,
        chat_channel: ChatChannel,
        cap: usize,
    ) {
        let mut message = message.into();
        if matches!(direction, Direction::Outbound) && message.chars().count() > 200 {
            message = message.chars().take(200).collect();
        }
        self.conversation_log.push_back(ConversationEntry {
            direction,
            channel: channel.into(),
            message,
            timestamp: Utc::now(),
            chat_channel,
        });
        while self.conversation_log.len() > cap {
            self.conversation_log.pop_front();
        }
    }

    /// Stamps `last_updated` to now. Called immediately before a save.
    pub fn touch(&mut self) {
        self.header.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diary() -> PatientDiary {
        PatientDiary::new(PatientId::try_new("PT-1").unwrap(), None)
    }

    #[test]
    fn fresh_diary_enters_intake_with_matching_timestamps() {
        let d = diary();
        assert_eq!(d.header.current_phase, Phase::Intake);
        assert_eq!(d.header.phase_entered_at, d.header.created);
    }

    #[test]
    fn conversation_log_caps_at_100_with_fifo_eviction() {
        const CAP: usize = 100;
        let mut d = diary();
        for i in 0..110 {
            d.append_conversation_entry(
                Direction::Inbound,
                "sms",
                format!("msg {i}"),
                ChatChannel::PreConsultation,
                CAP,
            );
        }
        assert_eq!(d.conversation_log.len(), CAP);
        assert!(d.conversation_log.front().unwrap().message.starts_with("msg 10"));
    }

    #[test]
    fn outbound_entries_truncated_to_200_chars() {
        let mut d = diary();
        let long = "x".repeat(500);
        d.append_conversation_entry(Direction::Outbound, "sms", long, ChatChannel::PreConsultation, 100);
        assert_eq!(d.conversation_log.back().unwrap().message.chars().count(), 200);
    }

    #[test]
    fn round_trip_through_json_is_stable() {
        let d = diary();
        let json = serde_json::to_string(&d).unwrap();
        let back: PatientDiary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.header.patient_id, d.header.patient_id);
        assert_eq!(back.header.current_phase, d.header.current_phase);
    }
}
