//! Cross-phase content routing state and audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diary::header::Phase;

/// One recorded instance of content being routed to a non-owning phase's agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossPhaseExtraction {
    /// The phase that owned the conversation when the content arrived.
    pub from_phase: Phase,
    /// The agent the content was routed to.
    pub target_agent: String,
    /// The verbatim text that triggered the routing.
    pub text: String,
    /// When this was recorded.
    pub timestamp: DateTime<Utc>,
}

/// An in-progress interactive hand-off awaiting the patient's reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossPhaseState {
    /// `true` while a follow-up is pending a patient response.
    pub active: bool,
    /// The agent the follow-up belongs to. Set whenever `active` is `true`.
    pub target_agent: Option<String>,
    /// The phase to return to once the follow-up resolves.
    pub pending_phase: Option<Phase>,
    /// The question asked of the patient, if any.
    pub follow_up_question: Option<String>,
    /// `true` while specifically waiting on the patient's next message.
    pub awaiting_response: bool,
    /// When the follow-up started; used for the 10-minute timeout.
    pub started: Option<DateTime<Utc>>,
}

impl CrossPhaseState {
    /// Begins an interactive follow-up.
    pub fn begin(&mut self, target_agent: String, pending_phase: Phase, question: Option<String>) {
        self.active = true;
        self.target_agent = Some(target_agent);
        self.pending_phase = Some(pending_phase);
        self.follow_up_question = question;
        self.awaiting_response = true;
        self.started = Some(Utc::now());
    }

    /// Clears the follow-up state entirely.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// `true` if the follow-up has been active longer than `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: std::time::Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        match self.started {
            Some(started) => self.active && Utc::now() - started > timeout,
            None => false,
        }
    }
}
