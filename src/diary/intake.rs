//! Intake demographic and responder-identification section.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Minimum set of fields required before intake is considered complete.
pub const REQUIRED_FIELDS: &[&str] = &[
    "full_name",
    "date_of_birth",
    "nhs_number",
    "contact_number",
    "address",
];

/// Demographic and responder-identification data gathered during intake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeSection {
    /// Field name to collected value.
    pub collected_fields: HashMap<String, String>,
    /// Names of fields explicitly reported as not obtainable.
    pub missing_fields: HashSet<String>,
    /// Who is responding on the patient's behalf, if not the patient.
    pub responder_id: Option<String>,
}

impl IntakeSection {
    /// Records a field as collected with the given value, clearing it from
    /// the missing set if present there.
    pub fn mark_field_collected(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        self.missing_fields.remove(&field);
        self.collected_fields.insert(field, value.into());
    }

    /// Returns every required field not yet present in `collected_fields`.
    #[must_use]
    pub fn get_missing_required(&self) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| !self.collected_fields.contains_key(*f))
            .collect()
    }

    /// `true` once every [`REQUIRED_FIELDS`] has been collected.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.get_missing_required().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_until_all_required_fields_collected() {
        let mut intake = IntakeSection::default();
        assert!(!intake.is_complete());
        for field in REQUIRED_FIELDS {
            intake.mark_field_collected(*field, "x");
        }
        assert!(intake.is_complete());
        assert!(intake.get_missing_required().is_empty());
    }
}
