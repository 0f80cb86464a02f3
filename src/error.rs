//! Categorical service errors with stable user-facing messages.
//!
//! Every error a client can observe falls into one of five categories.
//! The message text for each category is stable: client tooling matches on
//! it, so changes here are breaking changes to the service contract.

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced by the core service.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// Malformed request input: bad project name, bad pathname, oversized
    /// encoded pathname, missing parameter.
    #[error("{0}")]
    Validation(String),

    /// Bad credentials, unknown project, or unreachable credential check.
    /// Deliberately collapsed to one message so the failing factor is not
    /// leaked to the caller.
    #[error("Authentication failed")]
    Authentication,

    /// Target pathname does not exist in the requested area.
    #[error("{0}")]
    NotFound(String),

    /// Destination already exists, or the target scope overlaps a pending
    /// action or the global service lock.
    #[error("{0}")]
    Conflict(String),

    /// Backing filesystem or database I/O failure. Retried transparently
    /// up to a bounded count before being surfaced; the detail is logged,
    /// the caller sees only the generic message.
    #[error("Operation failed due to an internal storage error")]
    Storage(#[source] anyhow::Error),
}

impl ServiceError {
    /// Invalid characters in a project name.
    pub fn invalid_project() -> Self {
        Self::Validation("Invalid characters in project name".to_string())
    }

    /// Missing or malformed target pathname.
    pub fn invalid_pathname() -> Self {
        Self::Validation("Target pathname invalid or missing".to_string())
    }

    /// Percent-encoded pathname exceeds the configured ceiling.
    pub fn pathname_too_long(encoded_len: usize) -> Self {
        Self::Validation(format!(
            "URL encoded pathname exceeds maximum allowed length of {} characters: {encoded_len}",
            crate::constants::MAX_ENCODED_PATHNAME_LENGTH
        ))
    }

    /// Target not found in the requested area.
    pub fn target_not_found() -> Self {
        Self::NotFound("Specified target not found".to_string())
    }

    /// Destination of a copy/move/rename already exists.
    pub fn target_exists() -> Self {
        Self::Conflict("Specified new target already exists".to_string())
    }

    /// Requested scope overlaps a held scope or the global lock.
    pub fn scope_conflict() -> Self {
        Self::Conflict("Specified target conflicts with an ongoing action".to_string())
    }

    /// Whether this error is transient and worth retrying.
    ///
    /// Only storage I/O failures are retried; every categorical error is
    /// final on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}
