//! Registered informal helpers (carers, family members) and their grants.

use serde::{Deserialize, Serialize};

use crate::domain_types::HelperId;

/// A named capability a helper can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// May send chat messages on the patient's behalf.
    SendMessages,
    /// May upload documents on the patient's behalf.
    UploadDocuments,
    /// Unrestricted access, including internal/system events.
    FullAccess,
}

/// A helper registered against a patient, verified or pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Helper {
    /// Unique identifier for this helper.
    pub id: HelperId,
    /// Display name.
    pub name: String,
    /// Relationship to the patient (e.g. "daughter", "carer").
    pub relationship: String,
    /// Preferred outbound channel for this helper.
    pub channel: String,
    /// Contact string (phone/email), normalized by the identity resolver.
    pub contact: String,
    /// Granted permissions.
    pub permissions: Vec<Permission>,
    /// `true` once identity verification has completed.
    pub verified: bool,
}

/// The set of helpers registered for a patient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelperRegistry {
    helpers: Vec<Helper>,
}

impl HelperRegistry {
    /// Adds a new, unverified helper.
    pub fn add(&mut self, helper: Helper) {
        self.helpers.push(helper);
    }

    /// Marks a helper as verified by id. Returns `false` if not found.
    pub fn verify(&mut self, id: &HelperId) -> bool {
        if let Some(h) = self.helpers.iter_mut().find(|h| &h.id == id) {
            h.verified = true;
            true
        } else {
            false
        }
    }

    /// Looks up a helper by id, verified or not.
    #[must_use]
    pub fn lookup_by_id(&self, id: &HelperId) -> Option<&Helper> {
        self.helpers.iter().find(|h| &h.id == id)
    }

    /// Looks up a helper by their normalized contact string.
    #[must_use]
    pub fn lookup_by_contact(&self, contact: &str) -> Option<&Helper> {
        self.helpers.iter().find(|h| h.contact == contact)
    }

    /// Returns every *verified* helper holding `permission`.
    #[must_use]
    pub fn get_helpers_with_permission(&self, permission: Permission) -> Vec<&Helper> {
        self.helpers
            .iter()
            .filter(|h| h.verified && h.permissions.contains(&permission))
            .collect()
    }

    /// Removes a helper by id. Returns `true` if one was removed.
    pub fn remove(&mut self, id: &HelperId) -> bool {
        let before = self.helpers.len();
        self.helpers.retain(|h| &h.id != id);
        self.helpers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper(id: &str, verified: bool, perms: Vec<Permission>) -> Helper {
        Helper {
            id: HelperId::try_new(id.to_string()).unwrap(),
            name: "Jo".to_string(),
            relationship: "daughter".to_string(),
            channel: "sms".to_string(),
            contact: "+447000000000".to_string(),
            permissions: perms,
            verified,
        }
    }

    #[test]
    fn only_verified_helpers_are_reported_for_a_permission() {
        let mut reg = HelperRegistry::default();
        reg.add(helper("H-1", false, vec![Permission::SendMessages]));
        reg.add(helper("H-2", true, vec![Permission::SendMessages]));
        let found = reg.get_helpers_with_permission(Permission::SendMessages);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_ref(), "H-2");
    }
}
