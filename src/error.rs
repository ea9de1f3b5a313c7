//! Crate-wide error taxonomy.
//!
//! Mirrors the per-subsystem split in a `message_router`-style crate: each
//! boundary gets its own error enum rather than one god-enum, so callers can
//! match on exactly the failure modes their subsystem can produce.

use thiserror::Error;

/// Errors raised by the diary store.
#[derive(Debug, Error)]
pub enum DiaryStoreError {
    /// No diary blob exists for the given patient.
    #[error("no diary found for patient {patient_id}")]
    NotFound {
        /// Patient the lookup was for.
        patient_id: String,
    },

    /// The caller's expected generation did not match the stored generation.
    #[error("concurrency conflict for patient {patient_id}: expected generation {expected:?}")]
    Concurrency {
        /// Patient whose write conflicted.
        patient_id: String,
        /// Generation the caller believed was current.
        expected: Option<i64>,
    },

    /// Underlying `sqlx` failure.
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),

    /// The stored blob could not be deserialized into a `PatientDiary`.
    #[error("corrupt diary blob for patient {patient_id}: {source}")]
    Corrupt {
        /// Patient whose blob failed to parse.
        patient_id: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while dispatching an outbound response.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No dispatcher is registered for the response's channel.
    #[error("no dispatcher for channel {channel}")]
    NoDispatcher {
        /// The channel name that had no registered dispatcher.
        channel: String,
    },

    /// The dispatcher itself failed while sending.
    #[error("dispatch failed: {message}")]
    SendFailed {
        /// Human-readable failure detail from the dispatcher.
        message: String,
    },
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed its validity check.
    #[error("invalid configuration: {field} - {reason}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// I/O failure while loading/saving a config file.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while an agent processes an event.
///
/// Agent implementations are expected to return this from their `process`
/// method; the router classifies every variant as a generic failure and
/// never propagates it to the caller of `process_event` — the envelope is
/// either dropped or answered with an apology response instead.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Catch-all for agent-internal failures (LLM call failed, validation
    /// rejected the payload, etc). The Gateway treats the message as opaque.
    #[error("agent processing failed: {0}")]
    Processing(String),
}
