//! Delegated basic-auth credential check.
//!
//! Credentials come from configuration: one optional admin plus
//! project-scoped entries. Comparison is constant-time, and every failure
//! collapses to the single `Authentication failed` category so the
//! response does not reveal which part was wrong.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;

use super::audit::{log_audit_event, AuditEvent};
use crate::config::AuthConfig;
use crate::error::{Result, ServiceError};

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: String,
    pub admin: bool,
    /// Project the credential is scoped to; `None` for admin.
    pub project: Option<String>,
}

impl Identity {
    /// Whether this identity may act on the given project.
    pub fn authorize_project(&self, project: &str) -> Result<()> {
        if self.admin || self.project.as_deref() == Some(project) {
            Ok(())
        } else {
            log_audit_event(AuditEvent::ProjectAccessDenied {
                user: self.user.clone(),
                project: project.to_string(),
            });
            Err(ServiceError::Authentication)
        }
    }

    /// Whether this identity may manage the service lock.
    pub fn authorize_admin(&self) -> Result<()> {
        if self.admin {
            Ok(())
        } else {
            log_audit_event(AuditEvent::AdminAccessDenied {
                user: self.user.clone(),
            });
            Err(ServiceError::Authentication)
        }
    }
}

/// Checks the `Authorization: Basic` header against configured credentials.
pub fn authenticate(config: &AuthConfig, headers: &HeaderMap) -> Result<Identity> {
    let Some((user, password)) = parse_basic(headers) else {
        log_audit_event(AuditEvent::AuthFailure {
            reason: "missing or malformed Authorization header".to_string(),
        });
        return Err(ServiceError::Authentication);
    };

    if let Some(admin) = &config.admin
        && ct_str_eq(&user, &admin.user)
        && ct_str_eq(&password, &admin.password)
    {
        return Ok(Identity {
            user,
            admin: true,
            project: None,
        });
    }

    for cred in &config.projects {
        if ct_str_eq(&user, &cred.user) && ct_str_eq(&password, &cred.password) {
            return Ok(Identity {
                user,
                admin: false,
                project: Some(cred.project.clone()),
            });
        }
    }

    log_audit_event(AuditEvent::AuthFailure {
        reason: format!("unknown credentials for user {user}"),
    });
    Err(ServiceError::Authentication)
}

fn parse_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
