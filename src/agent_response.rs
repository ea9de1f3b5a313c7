//! Outbound response and per-event agent result types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::event::EventEnvelope;

/// A unit of outbound delivery produced by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Who the message is for (patient, helper, GP).
    pub recipient: String,
    /// Channel name; must be resolvable by the dispatcher registry, or
    /// dispatch fails without panicking.
    pub channel: String,
    /// The message body.
    pub message: String,
    /// Ordered list of attachment references, if any.
    pub attachments: Vec<String>,
    /// Free-form metadata (e.g. `chat_channel`, `rate_limited`).
    pub metadata: HashMap<String, Value>,
}

impl AgentResponse {
    /// Builds a response with no attachments or metadata.
    #[must_use]
    pub fn new(recipient: impl Into<String>, channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            channel: channel.into(),
            message: message.into(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Sets a metadata key if it is not already present.
    pub fn set_metadata_if_absent(&mut self, key: &str, value: Value) {
        self.metadata.entry(key.to_string()).or_insert(value);
    }
}

/// What an agent returns after processing exactly one event.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// The diary as mutated by the agent; always present, possibly unchanged.
    pub updated_diary: crate::diary::PatientDiary,
    /// Hand-off events to be looped back through the router.
    pub emitted_events: Vec<EventEnvelope>,
    /// Outbound responses to dispatch.
    pub responses: Vec<AgentResponse>,
}

impl AgentResult {
    /// An unchanged diary with no emitted events or responses.
    #[must_use]
    pub fn unchanged(diary: crate::diary::PatientDiary) -> Self {
        Self {
            updated_diary: diary,
            emitted_events: Vec::new(),
            responses: Vec::new(),
        }
    }
}
