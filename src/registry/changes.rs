//! Immutable data-change log.
//!
//! One record per committed mutation, never mutated after creation.
//! Timestamps are strictly increasing per project: when the wall clock ties
//! with the stored maximum, the new record is bumped one microsecond past
//! it, so "last change of kind K" queries stay well-ordered even under
//! concurrent completions.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::locks::{parse_rfc3339, rfc3339_micros};
use super::Registry;
use crate::error::{Result, ServiceError};

/// Kind of a committed data mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Copy,
    Move,
    Rename,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Rename => "rename",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "copy" => Ok(Self::Copy),
            "move" => Ok(Self::Move),
            "rename" => Ok(Self::Rename),
            "delete" => Ok(Self::Delete),
            other => Err(ServiceError::Validation(format!("Invalid change kind: {other}"))),
        }
    }
}

/// Origin of a change: interactive CLI, programmatic API call, or the
/// service itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMode {
    Cli,
    Api,
    System,
}

impl ChangeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Api => "api",
            Self::System => "system",
        }
    }
}

impl FromStr for ChangeMode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cli" => Ok(Self::Cli),
            "api" => Ok(Self::Api),
            "system" => Ok(Self::System),
            other => Err(ServiceError::Validation(format!("Invalid change mode: {other}"))),
        }
    }
}

/// A committed data-change record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChange {
    pub project: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub change: ChangeKind,
    pub pathname: String,
    /// Target pathname for copy/move/rename; `None` for add/delete.
    pub target: Option<String>,
    pub mode: ChangeMode,
}

/// A change record awaiting its timestamp.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub project: String,
    pub user: String,
    pub change: ChangeKind,
    pub pathname: String,
    pub target: Option<String>,
    pub mode: ChangeMode,
}

impl Registry {
    /// Appends a change record for a committed staging-area mutation.
    ///
    /// Action completions append through `complete_action` instead, so the
    /// log entry and the status transition share one transaction.
    pub fn append_change(&self, change: NewChange) -> Result<DataChange> {
        let conn = self.lock_conn();
        append_change_on(&conn, change)
    }

    /// Returns the most recent change of the given kind for a project, or
    /// `None` when no such change has been committed.
    pub fn last_change(&self, project: &str, kind: ChangeKind) -> Result<Option<DataChange>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT project, user, timestamp, change, pathname, target, mode
             FROM data_changes
             WHERE project = ?1 AND change = ?2
             ORDER BY timestamp DESC LIMIT 1",
            params![project, kind.as_str()],
            row_to_change,
        )
        .optional()
        .context("Failed to query last data change")
        .map_err(ServiceError::Storage)?
        .map(|r| r.map_err(ServiceError::Storage))
        .transpose()
    }
}

/// Appends a change within the caller's connection or transaction,
/// assigning a per-project strictly-increasing timestamp.
pub(super) fn append_change_on(conn: &Connection, change: NewChange) -> Result<DataChange> {
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(timestamp) FROM data_changes WHERE project = ?1",
            params![change.project],
            |row| row.get(0),
        )
        .context("Failed to query last change timestamp")
        .map_err(ServiceError::Storage)?;

    // Truncate to the stored precision before comparing, otherwise two
    // wall-clock reads inside one microsecond could store a tie.
    let now = Utc::now();
    let mut timestamp = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
    if let Some(last) = last {
        let last = parse_rfc3339(&last)?;
        if timestamp <= last {
            timestamp = last + Duration::microseconds(1);
        }
    }

    conn.execute(
        "INSERT INTO data_changes (project, user, timestamp, change, pathname, target, mode)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            change.project,
            change.user,
            rfc3339_micros(timestamp),
            change.change.as_str(),
            change.pathname,
            change.target,
            change.mode.as_str()
        ],
    )
    .context("Failed to append data change")
    .map_err(ServiceError::Storage)?;

    tracing::debug!(
        project = %change.project,
        change = %change.change,
        pathname = %change.pathname,
        "Data change recorded"
    );

    Ok(DataChange {
        project: change.project,
        user: change.user,
        timestamp,
        change: change.change,
        pathname: change.pathname,
        target: change.target,
        mode: change.mode,
    })
}

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<DataChange>> {
    let timestamp: String = row.get(2)?;
    let change: String = row.get(3)?;
    let mode: String = row.get(6)?;

    Ok((|| {
        Ok(DataChange {
            project: row.get::<_, String>(0)?,
            user: row.get::<_, String>(1)?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Malformed timestamp: {timestamp}"))?,
            change: change
                .parse::<ChangeKind>()
                .map_err(|e| anyhow::anyhow!("{e}"))?,
            pathname: row.get::<_, String>(4)?,
            target: row.get::<_, Option<String>>(5)?,
            mode: mode.parse::<ChangeMode>().map_err(|e| anyhow::anyhow!("{e}"))?,
        })
    })())
}
