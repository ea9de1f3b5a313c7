//! Permission checking: decides whether a sender may cause a given event to
//! be routed at all.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::diary::helper_registry::Permission;
use crate::diary::Phase;
use crate::event::{EventType, SenderRole};

/// Audit log entries are capped at this many; eviction drops back to 250.
pub const AUDIT_LOG_MAX: usize = 500;
const AUDIT_LOG_EVICT_TO: usize = 250;

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResult {
    /// `true` if the event may proceed to routing.
    pub allowed: bool,
    /// Human-readable reason, mainly useful when `allowed` is `false`.
    pub reason: String,
    /// The permission that was missing, if denial was permission-specific.
    pub required_permission: Option<Permission>,
}

impl PermissionResult {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            required_permission: None,
        }
    }

    fn deny(reason: impl Into<String>, required_permission: Option<Permission>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            required_permission,
        }
    }
}

/// One audited permission decision.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Who was being checked.
    pub sender_role: SenderRole,
    /// Which event type they attempted.
    pub event_type: EventType,
    /// The phase the diary was in at the time.
    pub diary_phase: Phase,
    /// The check's outcome.
    pub result: PermissionResult,
    /// When the check happened.
    pub timestamp: DateTime<Utc>,
}

/// Evaluates the permission rules in the fixed order the safety contract
/// requires, and appends every decision to a bounded audit log.
pub struct PermissionChecker {
    audit_log: Mutex<VecDeque<AuditEntry>>,
}

impl Default for PermissionChecker {
    fn default() -> Self {
        Self {
            audit_log: Mutex::new(VecDeque::new()),
        }
    }
}

impl PermissionChecker {
    /// Evaluates whether `sender_role` (holding `sender_permissions`) may
    /// cause `event_type` to be routed while the diary is in `diary_phase`.
    pub fn check(
        &self,
        sender_role: SenderRole,
        sender_permissions: &[Permission],
        event_type: EventType,
        diary_phase: Phase,
    ) -> PermissionResult {
        let result = self.evaluate(sender_role, sender_permissions, event_type);
        self.audit(sender_role, event_type, diary_phase, result.clone());
        result
    }

    fn evaluate(
        &self,
        sender_role: SenderRole,
        sender_permissions: &[Permission],
        event_type: EventType,
    ) -> PermissionResult {
        match sender_role {
            SenderRole::System | SenderRole::Agent => PermissionResult::allow("internal sender"),
            SenderRole::Patient => PermissionResult::allow("patient has full access to own diary"),
            SenderRole::Gp => match event_type {
                EventType::GpResponse | EventType::DocumentUploaded | EventType::Webhook => {
                    PermissionResult::allow("gp sender for a gp-eligible event type")
                }
                EventType::UserMessage => {
                    if sender_permissions.contains(&Permission::SendMessages)
                        || sender_permissions.contains(&Permission::FullAccess)
                    {
                        PermissionResult::allow("gp holds send_messages or full_access")
                    } else {
                        PermissionResult::deny("gp lacks send_messages", Some(Permission::SendMessages))
                    }
                }
                _ => PermissionResult::deny("gp_cannot_emit_event_type", None),
            },
            SenderRole::Helper => {
                if sender_permissions.contains(&Permission::FullAccess) {
                    return PermissionResult::allow("helper holds full_access");
                }
                let required = match event_type {
                    EventType::UserMessage => Some(Permission::SendMessages),
                    EventType::DocumentUploaded => Some(Permission::UploadDocuments),
                    EventType::DoctorCommand => Some(Permission::FullAccess),
                    _ => None,
                };
                match required {
                    None => PermissionResult::deny("helper_cannot_emit_internal_event", None),
                    Some(perm) => {
                        if sender_permissions.contains(&perm) {
                            PermissionResult::allow("helper holds required permission")
                        } else {
                            PermissionResult::deny("helper lacks required permission", Some(perm))
                        }
                    }
                }
            }
        }
    }

    fn audit(&self, sender_role: SenderRole, event_type: EventType, diary_phase: Phase, result: PermissionResult) {
        let mut log = self.audit_log.lock().expect("audit log mutex poisoned");
        log.push_back(AuditEntry {
            sender_role,
            event_type,
            diary_phase,
            result,
            timestamp: Utc::now(),
        });
        if log.len() > AUDIT_LOG_MAX {
            while log.len() > AUDIT_LOG_EVICT_TO {
                log.pop_front();
            }
        }
    }

    /// Snapshot of the audit log, oldest first.
    #[must_use]
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log.lock().expect("audit log mutex poisoned").iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unverified_helper_is_denied_without_permission() {
        let checker = PermissionChecker::default();
        let result = checker.check(SenderRole::Helper, &[], EventType::UserMessage, Phase::Intake);
        assert!(!result.allowed);
        assert_eq!(result.required_permission, Some(Permission::SendMessages));
    }

    #[test]
    fn helper_with_full_access_allowed_on_internal_events() {
        let checker = PermissionChecker::default();
        let result = checker.check(
            SenderRole::Helper,
            &[Permission::FullAccess],
            EventType::Heartbeat,
            Phase::Monitoring,
        );
        assert!(result.allowed);
    }

    #[test]
    fn patient_always_allowed() {
        let checker = PermissionChecker::default();
        let result = checker.check(SenderRole::Patient, &[], EventType::DoctorCommand, Phase::Clinical);
        assert!(result.allowed);
    }

    #[test]
    fn audit_log_evicts_down_to_250_once_over_500() {
        let checker = PermissionChecker::default();
        for _ in 0..(AUDIT_LOG_MAX + 1) {
            checker.check(SenderRole::Patient, &[], EventType::UserMessage, Phase::Intake);
        }
        assert_eq!(checker.audit_log().len(), AUDIT_LOG_EVICT_TO);
    }
}
