//! Clinical assessment section: history, documents, risk, sub-phase.

use serde::{Deserialize, Serialize};

use crate::diary::header::RiskLevel;
use crate::domain_types::ClinicalItemId;

/// Fine-grained progress within the clinical phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPhase {
    /// Clinical has not started work on this patient yet.
    NotStarted,
    /// Reviewing the referral letter/documents.
    AnalyzingReferral,
    /// Asking the patient clarifying questions.
    AskingQuestions,
    /// Waiting on uploaded documents.
    CollectingDocuments,
    /// Computing the risk stratification.
    ScoringRisk,
    /// Clinical assessment finished.
    Complete,
}

/// A single clinical question posed to the patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalQuestion {
    /// Unique identifier.
    pub id: ClinicalItemId,
    /// The question text.
    pub text: String,
    /// The patient's answer, once given.
    pub answer: Option<String>,
}

/// A document associated with the clinical assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalDocument {
    /// Unique identifier.
    pub id: ClinicalItemId,
    /// Storage reference for the document's content.
    pub reference: String,
    /// Content hash used for deduplication, if supplied by the uploader.
    pub content_hash: Option<String>,
}

/// Clinical history, questions, documents, and risk assessment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalSection {
    /// The patient's stated chief complaint.
    pub chief_complaint: Option<String>,
    /// Free-text medical history.
    pub histories: Vec<String>,
    /// Current medications.
    pub medications: Vec<String>,
    /// Known allergies.
    pub allergies: Vec<String>,
    /// Red-flag symptoms observed.
    pub red_flags: Vec<String>,
    /// Ordered list of questions asked.
    pub questions: Vec<ClinicalQuestion>,
    /// Ordered list of documents received.
    pub documents: Vec<ClinicalDocument>,
    /// Computed risk level.
    pub risk_level: RiskLevel,
    /// Free-text justification for `risk_level`.
    pub risk_reasoning: Option<String>,
    /// Current sub-phase.
    pub sub_phase: SubPhase,
    /// Ordered set (no duplicates, first-insertion order) of sub-phases visited.
    pub sub_phase_history: Vec<SubPhase>,
    /// Number of times the sub-phase has moved backwards.
    pub backward_loop_count: u32,
}

impl Default for SubPhase {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl ClinicalSection {
    /// `true` if `content_hash` matches a document already on file.
    #[must_use]
    pub fn has_duplicate_document(&self, content_hash: &str) -> bool {
        self.documents
            .iter()
            .any(|d| d.content_hash.as_deref() == Some(content_hash))
    }

    /// Transitions into `sub_phase`, recording it in `sub_phase_history` the
    /// first time it is entered and bumping `backward_loop_count` when the
    /// new sub-phase appears earlier in the canonical ordering.
    pub fn enter_sub_phase(&mut self, sub_phase: SubPhase) {
        if sub_phase_rank(sub_phase) < sub_phase_rank(self.sub_phase) {
            self.backward_loop_count += 1;
        }
        self.sub_phase = sub_phase;
        if !self.sub_phase_history.contains(&sub_phase) {
            self.sub_phase_history.push(sub_phase);
        }
    }
}

fn sub_phase_rank(sub_phase: SubPhase) -> u8 {
    match sub_phase {
        SubPhase::NotStarted => 0,
        SubPhase::AnalyzingReferral => 1,
        SubPhase::AskingQuestions => 2,
        SubPhase::CollectingDocuments => 3,
        SubPhase::ScoringRisk => 4,
        SubPhase::Complete => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_phase_history_has_no_duplicates() {
        let mut clinical = ClinicalSection::default();
        clinical.enter_sub_phase(SubPhase::AnalyzingReferral);
        clinical.enter_sub_phase(SubPhase::AskingQuestions);
        clinical.enter_sub_phase(SubPhase::AnalyzingReferral);
        assert_eq!(
            clinical.sub_phase_history,
            vec![SubPhase::AnalyzingReferral, SubPhase::AskingQuestions]
        );
        assert_eq!(clinical.backward_loop_count, 1);
    }

    #[test]
    fn duplicate_document_detected_by_content_hash() {
        let mut clinical = ClinicalSection::default();
        clinical.documents.push(ClinicalDocument {
            id: ClinicalItemId::generate(),
            reference: "ref-1".to_string(),
            content_hash: Some("abc".to_string()),
        });
        assert!(clinical.has_duplicate_document("abc"));
        assert!(!clinical.has_duplicate_document("xyz"));
    }
}
