//! Security audit logging for HTTP events.
//!
//! Registry-level events (lock changes, action transitions) log from the
//! registry itself; this module covers the request-facing events.

use tracing::warn;

/// Security audit events that should be logged for monitoring and alerting.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// Failed authentication attempt
    AuthFailure { reason: String },
    /// Credential valid but scoped to a different project
    ProjectAccessDenied { user: String, project: String },
    /// Non-admin credential attempted a lock operation
    AdminAccessDenied { user: String },
}

/// Log a security audit event with structured fields.
pub fn log_audit_event(event: AuditEvent) {
    match event {
        AuditEvent::AuthFailure { reason } => {
            warn!(
                target: "audit",
                event_type = "auth_failure",
                %reason,
                "Authentication failed"
            );
        },
        AuditEvent::ProjectAccessDenied { user, project } => {
            warn!(
                target: "audit",
                event_type = "project_access_denied",
                %user,
                %project,
                "Credential not valid for project"
            );
        },
        AuditEvent::AdminAccessDenied { user } => {
            warn!(
                target: "audit",
                event_type = "admin_access_denied",
                %user,
                "Lock operation requires admin credentials"
            );
        },
    }
}
