//! Routing classification: explicit event→agent mapping, phase-based
//! fallback, and cross-phase keyword detection.
//!
//! The two routing classes partition the [`EventType`] universe with no
//! overlap: every explicit type is listed in [`explicit_target`]; every
//! remaining type is phase-based and handled by [`phase_target`].

use crate::diary::Phase;
use crate::event::EventType;

/// Fixed event-type → agent-name mapping. Returns `None` for phase-based and
/// specially-cased event types.
#[must_use]
pub fn explicit_target(event_type: EventType) -> Option<&'static str> {
    use EventType::{
        AgentError, BookingComplete, ClinicalComplete, DeteriorationAlert, GpQuery, GpReminder,
        GpResponse, Heartbeat, HelperRegistration, HelperVerified, IntakeComplete,
        IntakeDataProvided, IntakeFormSubmitted, NeedsIntakeData, RescheduleRequest,
    };
    Some(match event_type {
        IntakeComplete | IntakeDataProvided => "clinical",
        ClinicalComplete => "booking",
        BookingComplete => "monitoring",
        NeedsIntakeData => "intake",
        Heartbeat => "monitoring",
        DeteriorationAlert => "clinical",
        RescheduleRequest => "booking",
        GpQuery => "gp_comms",
        GpResponse => "clinical",
        GpReminder => "gp_comms",
        HelperRegistration | HelperVerified => "helper_manager",
        AgentError => "error_handler",
        IntakeFormSubmitted => "intake",
        _ => return None,
    })
}

/// Resolves the agent that owns a given phase. Returns `None` for
/// [`Phase::Closed`] (log only, no routing).
#[must_use]
pub fn phase_target(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Intake => Some("intake"),
        Phase::Clinical => Some("clinical"),
        Phase::Booking => Some("booking"),
        Phase::Monitoring => Some("monitoring"),
        Phase::Closed => None,
    }
}

/// `true` for event types routed by the diary's current phase rather than a
/// fixed mapping.
#[must_use]
pub fn is_phase_based(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::UserMessage | EventType::DocumentUploaded | EventType::Webhook | EventType::DoctorCommand
    )
}

/// Clinical-concern keywords (case-insensitive substring match).
pub const CLINICAL_KEYWORDS: &[&str] = &[
    "allerg",
    "medication",
    "medicine",
    "taking",
    "prescribed",
    "symptom",
    "pain",
    "hurts",
    "bleeding",
    "dizzy",
    "nausea",
    "vomit",
    "fever",
    "swelling",
    "rash",
    "breathing",
    "diagnosed",
    "condition",
    "surgery",
    "operation",
    "side effect",
    "reaction",
    "intolerant",
];

/// Intake-concern keywords (case-insensitive substring match).
pub const INTAKE_KEYWORDS: &[&str] = &[
    "next of kin",
    "next-of-kin",
    "emergency contact",
    "my address",
    "moved to",
    "new phone",
    "new email",
    "my gp",
    "gp is",
    "changed my name",
    "nhs number",
];

/// Detects other-phase agents whose keywords appear in `text`, excluding the
/// agent that owns `current_phase` (no self-routing).
#[must_use]
pub fn detect_cross_phase_targets(text: &str, current_phase: Phase) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    let mut targets = Vec::new();

    let clinical_hit = CLINICAL_KEYWORDS.iter().any(|kw| lower.contains(kw));
    let intake_hit = INTAKE_KEYWORDS.iter().any(|kw| lower.contains(kw));

    if clinical_hit && current_phase != Phase::Clinical {
        targets.push("clinical");
    }
    if intake_hit && current_phase != Phase::Intake {
        targets.push("intake");
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_type_belongs_to_exactly_one_routing_class() {
        let all = [
            EventType::UserMessage,
            EventType::DocumentUploaded,
            EventType::Webhook,
            EventType::DoctorCommand,
            EventType::IntakeComplete,
            EventType::IntakeDataProvided,
            EventType::ClinicalComplete,
            EventType::BookingComplete,
            EventType::NeedsIntakeData,
            EventType::DeteriorationAlert,
            EventType::RescheduleRequest,
            EventType::GpQuery,
            EventType::GpResponse,
            EventType::GpReminder,
            EventType::HelperRegistration,
            EventType::HelperVerified,
            EventType::CrossPhaseData,
            EventType::CrossPhaseReprompt,
            EventType::IntakeFormSubmitted,
            EventType::Heartbeat,
            EventType::AgentError,
        ];
        for event_type in all {
            let explicit = explicit_target(event_type).is_some();
            let phase_based = is_phase_based(event_type);
            let special = matches!(event_type, EventType::CrossPhaseData | EventType::CrossPhaseReprompt);
            assert_eq!(
                [explicit, phase_based, special].iter().filter(|b| **b).count(),
                1,
                "{event_type:?} must belong to exactly one routing class"
            );
        }
    }

    #[test]
    fn cross_phase_detection_never_targets_current_phase() {
        let targets = detect_cross_phase_targets("I have a new allergy to penicillin", Phase::Booking);
        assert_eq!(targets, vec!["clinical"]);

        let targets = detect_cross_phase_targets("my allergy is bad", Phase::Clinical);
        assert!(targets.is_empty());
    }

    #[test]
    fn intake_keywords_detected_outside_intake_phase() {
        let targets = detect_cross_phase_targets("my address changed, I moved to a new flat", Phase::Clinical);
        assert_eq!(targets, vec!["intake"]);
    }
}
