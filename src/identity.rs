//! Identity resolution: mapping a contact string (phone/email) back to a
//! known record, with the contact normalization rules spelled out exactly.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::diary::PatientDiary;
use crate::domain_types::PatientId;

/// A resolved identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// The patient this contact is associated with.
    pub patient_id: PatientId,
    /// The normalized contact string that resolved to this record.
    pub normalized_contact: String,
}

/// Result of an identity lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Exactly one record matched.
    Found(IdentityRecord),
    /// More than one record matched; the caller must disambiguate.
    Ambiguous(Vec<IdentityRecord>),
    /// No record matched.
    NotFound,
}

/// Normalizes a contact string: lowercases it, strips whitespace and dashes
/// from phone-like strings, and rewrites a UK mobile `0…` (11 digits) to
/// `+44…`.
#[must_use]
pub fn normalize_contact(contact: &str) -> String {
    let lower = contact.trim().to_lowercase();
    if lower.contains('@') {
        return lower;
    }
    let digits_only: String = lower.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    if digits_only.len() == 11 && digits_only.starts_with('0') {
        format!("+44{}", &digits_only[1..])
    } else {
        digits_only
    }
}

/// External collaborator resolving a contact string to a patient identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolves `contact` globally.
    async fn resolve(&self, contact: &str) -> ResolveOutcome;

    /// Resolves `contact` scoped to a known patient, disambiguating helper
    /// contacts shared across patients.
    async fn resolve_for_patient(&self, contact: &str, patient_id: &PatientId) -> Option<IdentityRecord>;

    /// Rebuilds the resolver's index from a full set of diaries (used on
    /// startup / recovery).
    async fn rebuild_from_diaries(&self, diaries: &[PatientDiary]);

    /// Incrementally updates the index for one patient's diary.
    async fn update_for_patient(&self, patient_id: &PatientId, diary: &PatientDiary);
}

/// In-memory reference implementation backed by a concurrent hash map.
/// Sufficient for tests and single-node deployment; a real identity service
/// is out of scope.
#[derive(Default)]
pub struct InMemoryIdentityResolver {
    by_contact: DashMap<String, Vec<IdentityRecord>>,
}

impl InMemoryIdentityResolver {
    /// Registers a contact for a patient, normalizing it first.
    pub fn register(&self, contact: &str, patient_id: PatientId) {
        let normalized = normalize_contact(contact);
        let record = IdentityRecord {
            patient_id,
            normalized_contact: normalized.clone(),
        };
        self.by_contact.entry(normalized).or_default().push(record);
    }
}

#[async_trait]
impl IdentityResolver for InMemoryIdentityResolver {
    async fn resolve(&self, contact: &str) -> ResolveOutcome {
        let normalized = normalize_contact(contact);
        match self.by_contact.get(&normalized) {
            None => ResolveOutcome::NotFound,
            Some(records) if records.len() == 1 => ResolveOutcome::Found(records[0].clone()),
            Some(records) => ResolveOutcome::Ambiguous(records.clone()),
        }
    }

    async fn resolve_for_patient(&self, contact: &str, patient_id: &PatientId) -> Option<IdentityRecord> {
        let normalized = normalize_contact(contact);
        self.by_contact
            .get(&normalized)
            .and_then(|records| records.iter().find(|r| &r.patient_id == patient_id).cloned())
    }

    async fn rebuild_from_diaries(&self, diaries: &[PatientDiary]) {
        self.by_contact.clear();
        for diary in diaries {
            for helper in diary.helper_registry.get_helpers_with_permission(
                crate::diary::helper_registry::Permission::SendMessages,
            ) {
                self.register(&helper.contact, diary.header.patient_id.clone());
            }
        }
    }

    async fn update_for_patient(&self, patient_id: &PatientId, diary: &PatientDiary) {
        for mut entries in self.by_contact.iter_mut() {
            entries.retain(|r| &r.patient_id != patient_id);
        }
        for helper in diary.helper_registry.get_helpers_with_permission(
            crate::diary::helper_registry::Permission::SendMessages,
        ) {
            self.register(&helper.contact, patient_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uk_mobile_number_is_normalized_to_e164() {
        assert_eq!(normalize_contact("07911 123456"), "+447911123456");
        assert_eq!(normalize_contact("0791-112-3456"), "+447911123456");
    }

    #[test]
    fn email_is_lowercased_but_otherwise_untouched() {
        assert_eq!(normalize_contact("  Jo.Smith@Example.com "), "jo.smith@example.com");
    }

    #[tokio::test]
    async fn registered_contact_resolves_to_patient() {
        let resolver = InMemoryIdentityResolver::default();
        let pid = PatientId::try_new("PT-1").unwrap();
        resolver.register("07911123456", pid.clone());

        match resolver.resolve("0791 112 3456").await {
            ResolveOutcome::Found(record) => assert_eq!(record.patient_id, pid),
            other => panic!("expected Found, got {other:?}"),
        }
    }
}
