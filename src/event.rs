//! Event envelope and the closed set of wire event types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{ChainDepth, CorrelationId, EventId, PatientId};

/// Closed set of event types the Gateway understands. Every variant belongs
/// to exactly one of the two routing classes (explicit or phase-based); see
/// [`crate::routing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A message typed by a patient, helper or GP through a chat channel.
    UserMessage,
    /// A document (referral letter, lab report, photo) was uploaded.
    DocumentUploaded,
    /// A generic external webhook notification.
    Webhook,
    /// A command issued by clinical staff through an operator tool.
    DoctorCommand,
    /// Intake has gathered everything it needs.
    IntakeComplete,
    /// Intake received a further piece of data mid-collection.
    IntakeDataProvided,
    /// Clinical assessment finished.
    ClinicalComplete,
    /// Booking finished.
    BookingComplete,
    /// Clinical or booking requests more intake data.
    NeedsIntakeData,
    /// Monitoring observed a deterioration signal.
    DeteriorationAlert,
    /// Patient asked to reschedule their appointment.
    RescheduleRequest,
    /// Clinical raised a question for the GP.
    GpQuery,
    /// The GP answered a previously raised query.
    GpResponse,
    /// A reminder that a GP query has gone unanswered too long.
    GpReminder,
    /// A helper registered themselves against a patient.
    HelperRegistration,
    /// A helper's registration was verified.
    HelperVerified,
    /// Internal hand-off carrying content detected for another phase's agent.
    CrossPhaseData,
    /// Internal hand-off re-prompting a patient for a pending-phase follow-up.
    CrossPhaseReprompt,
    /// An intake form was submitted through a structured form surface.
    IntakeFormSubmitted,
    /// A scheduler tick for a registered, monitoring-active patient.
    Heartbeat,
    /// An agent raised an unhandled exception while processing an event.
    AgentError,
}

impl EventType {
    /// `true` when this event type is fixed-mapped to a single agent,
    /// `false` when the diary's current phase selects the target.
    #[must_use]
    pub fn is_explicit_route(self) -> bool {
        crate::routing::explicit_target(self).is_some() || self.is_special_cased()
    }

    fn is_special_cased(self) -> bool {
        matches!(self, Self::CrossPhaseData | Self::CrossPhaseReprompt)
    }
}

/// Who originated an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The patient themselves.
    Patient,
    /// A registered helper (carer, family member, etc).
    Helper,
    /// The patient's GP.
    Gp,
    /// The Gateway or its scheduler, not a person.
    System,
    /// Another agent, via a hand-off.
    Agent,
}

/// Free-form, Gateway-opaque payload. A handful of keys are Gateway-private
/// by convention (prefixed with `_`): `_chain_depth`, `_target_agent`,
/// `_has_cross_phase_content`, `_cross_phase_targets`, `_cross_phase_followup`,
/// `_pending_phase`, `_source_chat_channel`.
pub type Payload = HashMap<String, Value>;

/// Universal inbound/internal event handed to [`crate::router::GatewayRouter::process_event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event, used for idempotency tracking.
    pub event_id: EventId,
    /// What kind of event this is.
    pub event_type: EventType,
    /// Patient this event concerns.
    pub patient_id: PatientId,
    /// Producer-specific data plus Gateway-private annotations.
    pub payload: Payload,
    /// Free-text description of where the event originated.
    pub source: String,
    /// Identifier of whoever/whatever sent this event.
    pub sender_id: Option<String>,
    /// Role of the sender, used for permission checks.
    pub sender_role: SenderRole,
    /// Propagated across an entire hand-off chain, set once at the root.
    pub correlation_id: Option<CorrelationId>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Number of hand-off hops since the root event that started this chain.
    pub chain_depth: ChainDepth,
}

impl EventEnvelope {
    /// Builds a raw envelope. Prefer [`Self::user_message`], [`Self::handoff`]
    /// or [`Self::heartbeat`] for the common cases.
    #[must_use]
    pub fn new(
        event_type: EventType,
        patient_id: PatientId,
        sender_role: SenderRole,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            event_type,
            patient_id,
            payload: Payload::new(),
            source: source.into(),
            sender_id: None,
            sender_role,
            correlation_id: None,
            timestamp: Utc::now(),
            chain_depth: ChainDepth::default(),
        }
    }

    /// A patient (or helper/GP) chat message.
    #[must_use]
    pub fn user_message(
        patient_id: PatientId,
        sender_role: SenderRole,
        sender_id: Option<String>,
        text: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        let mut env = Self::new(EventType::UserMessage, patient_id, sender_role, "chat");
        env.sender_id = sender_id;
        env.payload
            .insert("text".to_string(), Value::String(text.into()));
        env.payload
            .insert("channel".to_string(), Value::String(channel.into()));
        env
    }

    /// An internal hand-off emitted by an agent as part of a chain.
    #[must_use]
    pub fn handoff(
        event_type: EventType,
        patient_id: PatientId,
        parent: &Self,
        payload: Payload,
    ) -> Self {
        let mut env = Self::new(event_type, patient_id, SenderRole::Agent, "handoff");
        env.correlation_id = parent.correlation_id;
        env.chain_depth = parent.chain_depth.increment();
        env.payload = payload;
        env
    }

    /// A scheduler-originated heartbeat tick for a registered patient.
    #[must_use]
    pub fn heartbeat(patient_id: PatientId, days_since_appointment: i64, milestone: u32) -> Self {
        let mut env = Self::new(EventType::Heartbeat, patient_id, SenderRole::System, "scheduler");
        env.payload.insert(
            "days_since_appointment".to_string(),
            Value::from(days_since_appointment),
        );
        env.payload
            .insert("milestone".to_string(), Value::from(milestone));
        env
    }

    /// Returns the message text for a `USER_MESSAGE` event, if present.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }

    /// Sets the message text for a `USER_MESSAGE` event, truncating in place.
    pub fn set_text(&mut self, text: String) {
        self.payload.insert("text".to_string(), Value::String(text));
    }

    /// Returns the outbound channel recorded on this event, if present.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.payload.get("channel").and_then(Value::as_str)
    }

    /// Marks a Gateway-private boolean flag on the payload.
    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.payload.insert(key.to_string(), Value::Bool(value));
    }

    /// Reads a Gateway-private boolean flag from the payload.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.payload.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_carries_text_and_channel() {
        let pid = PatientId::try_new("PT-1").unwrap();
        let env = EventEnvelope::user_message(pid, SenderRole::Patient, None, "hi", "websocket");
        assert_eq!(env.text(), Some("hi"));
        assert_eq!(env.channel(), Some("websocket"));
        assert_eq!(env.chain_depth.as_u32(), 0);
    }

    #[test]
    fn handoff_increments_chain_depth_and_propagates_correlation() {
        let pid = PatientId::try_new("PT-1").unwrap();
        let mut parent = EventEnvelope::user_message(pid.clone(), SenderRole::Patient, None, "hi", "sms");
        parent.correlation_id = Some(CorrelationId::generate());
        let child = EventEnvelope::handoff(EventType::IntakeComplete, pid, &parent, Payload::new());
        assert_eq!(child.chain_depth.as_u32(), 1);
        assert_eq!(child.correlation_id, parent.correlation_id);
    }
}
