//! Operation scopes and collision detection.
//!
//! A scope is a (project, area, pathname) triple. Two scopes collide when
//! they belong to the same project and area and one pathname is equal to or
//! an ancestor of the other. Collision checks are area-aware: a staging
//! scope and a frozen scope at the same pathname never collide, even though
//! they name different physical locations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::STAGING_FOLDER_SUFFIX;
use crate::pathname::Pathname;

/// Storage area within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    /// Mutable per-project region: uploads, copies, moves, deletes.
    Staging,
    /// Immutable-once-written region; entry only via freeze.
    Frozen,
}

impl Area {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Frozen => "frozen",
        }
    }

    /// Directory name of this area for the given project.
    pub fn dir_name(self, project: &str) -> String {
        match self {
            Self::Staging => format!("{project}{STAGING_FOLDER_SUFFIX}"),
            Self::Frozen => project.to_string(),
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scope an operation occupies while in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub project: String,
    pub area: Area,
    pub pathname: Pathname,
}

impl Scope {
    pub fn new(project: impl Into<String>, area: Area, pathname: Pathname) -> Self {
        Self {
            project: project.into(),
            area,
            pathname,
        }
    }

    /// Whether this scope collides with another.
    pub fn collides_with(&self, other: &Scope) -> bool {
        self.project == other.project
            && self.area == other.area
            && (self.pathname == other.pathname
                || self.pathname.is_ancestor_of(&other.pathname)
                || other.pathname.is_ancestor_of(&self.pathname))
    }
}
