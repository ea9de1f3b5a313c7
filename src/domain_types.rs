//! Domain primitives for the Gateway.
//!
//! Strongly-typed wrappers around the IDs and small bounded values that flow
//! through every subsystem, so a `PatientId` can never be confused with an
//! `EventId`, and a bounded numeric (chain depth, retry count, cache size)
//! can never hold an out-of-range value.

use nutype::nutype;
use uuid::Uuid;

/// Patient identifier, e.g. `"PT-1"`. Opaque to the Gateway; never empty.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct PatientId(String);

/// Unique identifier for an `EventEnvelope`.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random event id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Correlation identifier propagated across a hand-off chain.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Number of hand-off hops between the root enqueued event and this one.
#[nutype(
    validate(less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 0
)]
pub struct ChainDepth(u32);

impl ChainDepth {
    /// Returns the next depth in a hand-off chain.
    ///
    /// # Panics
    ///
    /// Panics only if chain depth has somehow already reached the validated
    /// maximum; the circuit breaker (tripping at depth 10) makes this
    /// unreachable in practice.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::try_new(self.into_inner() + 1).expect("chain depth overflowed validated maximum")
    }

    /// Returns the raw depth as `u32`.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.into_inner()
    }
}

/// Identifier for a registered helper (informal carer, family member, etc).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct HelperId(String);

/// Identifier for a GP query entry.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct GpQueryId(Uuid);

impl GpQueryId {
    /// Generates a fresh random GP query id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for a clinical question or document entry.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct ClinicalItemId(Uuid);

impl ClinicalItemId {
    /// Generates a fresh random item id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for a booking record.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct BookingId(Uuid);

impl BookingId {
    /// Generates a fresh random booking id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Name of a registered agent (`"intake"`, `"clinical"`, ...).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct AgentName(String);

/// Name of an outbound channel (`"websocket"`, `"email"`, ...).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct ChannelName(String);

/// Storage generation number for optimistic concurrency control.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Into
))]
pub struct Generation(i64);

impl Generation {
    /// The first generation assigned on create.
    #[must_use]
    pub fn first() -> Self {
        Self::new(1)
    }

    /// Returns the next generation after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// Raw `i64` value, as stored in the backing table.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_depth_increments() {
        let d = ChainDepth::default();
        assert_eq!(d.as_u32(), 0);
        assert_eq!(d.increment().as_u32(), 1);
    }

    #[test]
    fn generation_sequence() {
        let g = Generation::first();
        assert_eq!(g.as_i64(), 1);
        assert_eq!(g.next().as_i64(), 2);
    }

    #[test]
    fn patient_id_rejects_empty() {
        assert!(PatientId::try_new(String::new()).is_err());
        assert!(PatientId::try_new("  ".to_string()).is_err());
    }
}
