//! Global service lock and scope acquisition.
//!
//! The global lock is a singleton row: set by inserting it, cleared by
//! deleting it, and queried as presence/absence — an unset lock is absence,
//! never a false/empty success. Scope acquisition is a `BEGIN IMMEDIATE`
//! check-and-insert so that two concurrent requests for overlapping scopes
//! can never both succeed.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::Registry;
use crate::error::{Result, ServiceError};
use crate::scope::Scope;

impl Registry {
    /// Sets the global service lock. Idempotent.
    pub fn set_global_lock(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR IGNORE INTO service_lock (id, locked_at) VALUES (1, ?1)",
            params![rfc3339_micros(Utc::now())],
        )
        .context("Failed to set global lock")
        .map_err(ServiceError::Storage)?;
        tracing::info!(target: "audit", event_type = "service_locked", "Global service lock set");
        Ok(())
    }

    /// Clears the global service lock. Idempotent.
    pub fn clear_global_lock(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM service_lock", [])
            .context("Failed to clear global lock")
            .map_err(ServiceError::Storage)?;
        tracing::info!(target: "audit", event_type = "service_unlocked", "Global service lock cleared");
        Ok(())
    }

    /// Returns the lock timestamp when the global lock is set, `None`
    /// otherwise.
    pub fn global_lock(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn();
        let locked_at: Option<String> = conn
            .query_row("SELECT locked_at FROM service_lock WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to query global lock")
            .map_err(ServiceError::Storage)?;

        match locked_at {
            Some(ts) => Ok(Some(parse_rfc3339(&ts)?)),
            None => Ok(None),
        }
    }

    /// Read-only collision probe: succeeds when every requested scope is
    /// currently clear of the global lock and all held scopes.
    ///
    /// This is advisory — the authoritative check happens again inside
    /// `begin_action`'s transaction.
    pub fn check_scopes(&self, scopes: &[Scope]) -> Result<()> {
        let conn = self.lock_conn();
        check_scopes_on(&conn, scopes)
    }

    /// Releases every scope held under the given guard. Idempotent; always
    /// succeeds for unknown guards.
    pub fn release_scopes(&self, guard: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM scopes WHERE guard = ?1", params![guard])
            .context("Failed to release scopes")
            .map_err(ServiceError::Storage)?;
        Ok(())
    }
}

/// Collision check against an open connection (caller holds the lock or a
/// transaction).
pub(super) fn check_scopes_on(conn: &Connection, scopes: &[Scope]) -> Result<()> {
    let locked: Option<i64> = conn
        .query_row("SELECT id FROM service_lock WHERE id = 1", [], |row| row.get(0))
        .optional()
        .context("Failed to query global lock")
        .map_err(ServiceError::Storage)?;
    if locked.is_some() {
        return Err(ServiceError::scope_conflict());
    }

    for scope in scopes {
        let colliding: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM scopes
                 WHERE project = ?1 AND area = ?2 AND (
                     pathname = ?3
                     OR substr(?3, 1, length(pathname) + 1) = pathname || '/'
                     OR substr(pathname, 1, length(?3) + 1) = ?3 || '/'
                 )",
                params![scope.project, scope.area.as_str(), scope.pathname.as_str()],
                |row| row.get(0),
            )
            .context("Failed to query scope collisions")
            .map_err(ServiceError::Storage)?;
        if colliding > 0 {
            return Err(ServiceError::scope_conflict());
        }
    }

    Ok(())
}

/// Inserts scope rows under a guard within the caller's transaction.
pub(super) fn insert_scopes_on(
    conn: &Connection,
    guard: &str,
    scopes: &[Scope],
) -> Result<()> {
    let now = rfc3339_micros(Utc::now());
    for scope in scopes {
        conn.execute(
            "INSERT INTO scopes (guard, project, area, pathname, acquired_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                guard,
                scope.project,
                scope.area.as_str(),
                scope.pathname.as_str(),
                now
            ],
        )
        .context("Failed to insert scope")
        .map_err(ServiceError::Storage)?;
    }
    Ok(())
}

/// Acquires an immediate transaction on the shared connection.
pub(super) fn immediate_txn(conn: &mut Connection) -> Result<rusqlite::Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin registry transaction")
        .map_err(ServiceError::Storage)
}

/// Fixed-width RFC3339 with microseconds; lexicographic order matches
/// chronological order, so `MAX(timestamp)` works on the TEXT column.
pub(super) fn rfc3339_micros(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Malformed timestamp in registry: {s}"))
        .map_err(ServiceError::Storage)
}
