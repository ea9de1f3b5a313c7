//! GP identifying info and the ordered log of queries sent to the GP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain_types::GpQueryId;

/// Lifecycle state of a query sent to a GP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpQueryStatus {
    /// Sent, awaiting a response.
    Pending,
    /// The GP responded.
    Responded,
    /// Given up on; the GP never responded.
    NonResponsive,
}

/// A single question or information request sent to the patient's GP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpQuery {
    /// Unique identifier for this query.
    pub id: GpQueryId,
    /// Category of query (free text, e.g. "medication_history").
    pub query_type: String,
    /// The text sent to the GP.
    pub text: String,
    /// When the query was sent.
    pub sent: DateTime<Utc>,
    /// When a reminder was last sent for this query, if any.
    pub reminder_sent: Option<DateTime<Utc>>,
    /// Current status.
    pub status: GpQueryStatus,
    /// When the GP's response was received, if any.
    pub received: Option<DateTime<Utc>>,
    /// Attachment references included with the response.
    pub attachments: Vec<String>,
}

impl GpQuery {
    /// Creates a freshly sent, pending query.
    #[must_use]
    pub fn new(query_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: GpQueryId::generate(),
            query_type: query_type.into(),
            text: text.into(),
            sent: Utc::now(),
            reminder_sent: None,
            status: GpQueryStatus::Pending,
            received: None,
            attachments: Vec::new(),
        }
    }
}

/// GP identity and the ordered log of queries raised with them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpChannel {
    /// GP's registered name, if known.
    pub gp_name: Option<String>,
    /// GP practice identifying info (free text).
    pub practice_info: Option<String>,
    /// Ordered log of queries, oldest first.
    pub queries: Vec<GpQuery>,
}

impl GpChannel {
    /// `true` iff any query currently has status [`GpQueryStatus::Pending`].
    #[must_use]
    pub fn has_pending_queries(&self) -> bool {
        self.queries.iter().any(|q| q.status == GpQueryStatus::Pending)
    }

    /// Appends a new query, returning its id.
    pub fn raise_query(&mut self, query: GpQuery) -> GpQueryId {
        let id = query.id;
        self.queries.push(query);
        id
    }

    /// Finds a query by id, mutably.
    pub fn find_mut(&mut self, id: GpQueryId) -> Option<&mut GpQuery> {
        self.queries.iter_mut().find(|q| q.id == id)
    }
}
