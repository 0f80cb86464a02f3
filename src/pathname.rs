//! Project name and pathname validation.
//!
//! Pathnames are project-relative, always carry a leading slash and never a
//! trailing one. Validation is pure: no filesystem access happens here.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::MAX_ENCODED_PATHNAME_LENGTH;
use crate::error::{Result, ServiceError};

/// Characters percent-encoded when measuring the encoded pathname length,
/// matching what the transport layer encodes in a URL path segment.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'|')
    .add(b'\\');

/// Validates a project name against the restricted charset.
///
/// Project names share a namespace with filesystem directories and
/// credential identifiers, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_project(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ServiceError::invalid_project());
    }
    Ok(())
}

/// A normalized project-relative pathname.
///
/// Invariants: non-empty, leading `/`, no trailing `/`, no empty or
/// `.`/`..` components, encoded length within the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pathname(String);

impl Pathname {
    /// Parses and normalizes a raw pathname.
    ///
    /// The area root (`/`) is rejected: it is administrative, never a valid
    /// operation target.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.starts_with('/') {
            return Err(ServiceError::invalid_pathname());
        }

        let normalized = trimmed.trim_end_matches('/');
        if normalized.is_empty() {
            // Bare "/" resolves to the area root.
            return Err(ServiceError::invalid_pathname());
        }

        for component in normalized[1..].split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(ServiceError::invalid_pathname());
            }
        }

        let encoded_len = utf8_percent_encode(normalized, PATH_ENCODE_SET).to_string().len();
        if encoded_len > MAX_ENCODED_PATHNAME_LENGTH {
            return Err(ServiceError::pathname_too_long(encoded_len));
        }

        Ok(Self(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative form without the leading slash, for joining onto an area
    /// root directory.
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    /// Parent pathname, or `None` for a top-level entry.
    pub fn parent(&self) -> Option<Pathname> {
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            None
        } else {
            Some(Pathname(self.0[..idx].to_string()))
        }
    }

    /// Final component of the pathname.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Whether `self` is a strict, directory-boundary-aligned ancestor of
    /// `other`. `/a/b` is an ancestor of `/a/b/c` but not of `/a/bc`.
    pub fn is_ancestor_of(&self, other: &Pathname) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for Pathname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Pathname {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Pathname::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<Pathname> for String {
    fn from(p: Pathname) -> Self {
        p.0
    }
}
