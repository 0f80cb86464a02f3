//! Long-running action records and their state machine.
//!
//! An action is created `pending` in the same transaction that acquires its
//! scopes, with the action id doubling as the scope guard. It finishes in
//! exactly one of two states: `completed` (data-change appended, scopes
//! released, all in one transaction) or `failed` (error recorded, scopes
//! released).

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::changes::{append_change_on, ChangeKind, NewChange};
use super::locks::{check_scopes_on, immediate_txn, insert_scopes_on, rfc3339_micros};
use super::Registry;
use crate::error::{Result, ServiceError};
use crate::pathname::Pathname;
use crate::scope::Scope;

/// Lifecycle state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ServiceError::Validation(format!(
                "Invalid action status: {other}"
            ))),
        }
    }
}

/// A recorded action, pending or finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub project: String,
    pub user: String,
    pub change: ChangeKind,
    pub pathname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Registry {
    /// Atomically acquires the given scopes and records a pending action.
    ///
    /// The scope check and inserts run inside one immediate transaction, so
    /// two overlapping requests cannot both succeed. The returned action's
    /// id is the guard under which the scopes are held.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Conflict` when the global lock is set or any
    /// requested scope overlaps a held one.
    pub fn begin_action(
        &self,
        project: &str,
        user: &str,
        change: ChangeKind,
        pathname: &Pathname,
        target: Option<&Pathname>,
        scopes: &[Scope],
    ) -> Result<Action> {
        let mut conn = self.lock_conn();
        let txn = immediate_txn(&mut conn)?;

        check_scopes_on(&txn, scopes)?;

        let id = Uuid::new_v4().to_string();
        insert_scopes_on(&txn, &id, scopes)?;

        let created_at = Utc::now();
        txn.execute(
            "INSERT INTO actions (id, project, user, change, pathname, target, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                id,
                project,
                user,
                change.as_str(),
                pathname.as_str(),
                target.map(Pathname::as_str),
                rfc3339_micros(created_at)
            ],
        )
        .context("Failed to record pending action")
        .map_err(ServiceError::Storage)?;

        txn.commit()
            .context("Failed to commit action start")
            .map_err(ServiceError::Storage)?;

        tracing::info!(
            target: "audit",
            event_type = "action_started",
            action_id = %id,
            project = %project,
            user = %user,
            change = %change,
            pathname = %pathname,
            "Action started"
        );

        Ok(Action {
            id,
            project: project.to_string(),
            user: user.to_string(),
            change,
            pathname: pathname.as_str().to_string(),
            target: target.map(|t| t.as_str().to_string()),
            status: ActionStatus::Pending,
            created_at,
            completed_at: None,
            error: None,
        })
    }

    /// Marks a pending action completed, appends its data-change record,
    /// and releases its scopes — all in one transaction.
    pub fn complete_action(&self, id: &str, change: NewChange) -> Result<Action> {
        let mut conn = self.lock_conn();
        let txn = immediate_txn(&mut conn)?;

        let updated = txn
            .execute(
                "UPDATE actions SET status = 'completed', completed_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, rfc3339_micros(Utc::now())],
            )
            .context("Failed to complete action")
            .map_err(ServiceError::Storage)?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!(
                "No pending action with id {id}"
            )));
        }

        append_change_on(&txn, change)?;

        txn.execute("DELETE FROM scopes WHERE guard = ?1", params![id])
            .context("Failed to release action scopes")
            .map_err(ServiceError::Storage)?;

        let action = get_action_on(&txn, id)?.ok_or_else(|| {
            ServiceError::Storage(anyhow::anyhow!("Action row vanished during completion: {id}"))
        })?;

        txn.commit()
            .context("Failed to commit action completion")
            .map_err(ServiceError::Storage)?;

        tracing::info!(
            target: "audit",
            event_type = "action_completed",
            action_id = %id,
            project = %action.project,
            change = %action.change,
            "Action completed"
        );

        Ok(action)
    }

    /// Marks a pending action failed with the given error and releases its
    /// scopes.
    pub fn fail_action(&self, id: &str, error: &str) -> Result<Action> {
        let mut conn = self.lock_conn();
        let txn = immediate_txn(&mut conn)?;

        let updated = txn
            .execute(
                "UPDATE actions SET status = 'failed', error = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, error],
            )
            .context("Failed to mark action failed")
            .map_err(ServiceError::Storage)?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!(
                "No pending action with id {id}"
            )));
        }

        txn.execute("DELETE FROM scopes WHERE guard = ?1", params![id])
            .context("Failed to release action scopes")
            .map_err(ServiceError::Storage)?;

        let action = get_action_on(&txn, id)?.ok_or_else(|| {
            ServiceError::Storage(anyhow::anyhow!("Action row vanished during failure: {id}"))
        })?;

        txn.commit()
            .context("Failed to commit action failure")
            .map_err(ServiceError::Storage)?;

        tracing::warn!(
            target: "audit",
            event_type = "action_failed",
            action_id = %id,
            project = %action.project,
            error = %error,
            "Action failed"
        );

        Ok(action)
    }

    /// Looks up an action by id.
    pub fn get_action(&self, id: &str) -> Result<Option<Action>> {
        let conn = self.lock_conn();
        get_action_on(&conn, id)
    }

    /// Lists a project's actions, newest first, optionally filtered by
    /// status.
    pub fn list_actions(
        &self,
        project: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<Action>> {
        let conn = self.lock_conn();

        let mut stmt = match status {
            Some(_) => conn.prepare(
                "SELECT id, project, user, change, pathname, target, status,
                        created_at, completed_at, error
                 FROM actions WHERE project = ?1 AND status = ?2
                 ORDER BY created_at DESC",
            ),
            None => conn.prepare(
                "SELECT id, project, user, change, pathname, target, status,
                        created_at, completed_at, error
                 FROM actions WHERE project = ?1
                 ORDER BY created_at DESC",
            ),
        }
        .context("Failed to prepare action listing")
        .map_err(ServiceError::Storage)?;

        let rows = match status {
            Some(status) => stmt.query_map(params![project, status.as_str()], row_to_action),
            None => stmt.query_map(params![project], row_to_action),
        }
        .context("Failed to list actions")
        .map_err(ServiceError::Storage)?;

        let mut actions = Vec::new();
        for row in rows {
            let action = row
                .context("Failed to read action row")
                .map_err(ServiceError::Storage)?;
            actions.push(action.map_err(ServiceError::Storage)?);
        }
        Ok(actions)
    }
}

fn get_action_on(conn: &rusqlite::Connection, id: &str) -> Result<Option<Action>> {
    conn.query_row(
        "SELECT id, project, user, change, pathname, target, status,
                created_at, completed_at, error
         FROM actions WHERE id = ?1",
        params![id],
        row_to_action,
    )
    .optional()
    .context("Failed to query action")
    .map_err(ServiceError::Storage)?
    .map(|r| r.map_err(ServiceError::Storage))
    .transpose()
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<Action>> {
    let change: String = row.get(3)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;

    let id: String = row.get(0)?;
    let project: String = row.get(1)?;
    let user: String = row.get(2)?;
    let pathname: String = row.get(4)?;
    let target: Option<String> = row.get(5)?;
    let error: Option<String> = row.get(9)?;

    Ok((move || {
        Ok(Action {
            id,
            project,
            user,
            change: change.parse::<ChangeKind>().map_err(|e| anyhow::anyhow!("{e}"))?,
            pathname,
            target,
            status: status
                .parse::<ActionStatus>()
                .map_err(|e| anyhow::anyhow!("{e}"))?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Malformed timestamp: {created_at}"))?,
            completed_at: completed_at
                .map(|ts| {
                    DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .with_context(|| format!("Malformed timestamp: {ts}"))
                })
                .transpose()?,
            error,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChangeMode;
    use crate::scope::Area;

    fn staging_scope(path: &str) -> Scope {
        Scope::new("demo", Area::Staging, Pathname::parse(path).unwrap())
    }

    fn begin(registry: &Registry, change: ChangeKind, path: &str) -> Action {
        registry
            .begin_action(
                "demo",
                "alice",
                change,
                &Pathname::parse(path).unwrap(),
                None,
                &[staging_scope(path)],
            )
            .unwrap()
    }

    fn new_change(kind: ChangeKind, pathname: &str) -> NewChange {
        NewChange {
            project: "demo".to_string(),
            user: "alice".to_string(),
            change: kind,
            pathname: pathname.to_string(),
            target: None,
            mode: ChangeMode::System,
        }
    }

    #[test]
    fn begin_rejects_overlapping_scopes() {
        let registry = Registry::in_memory().unwrap();
        begin(&registry, ChangeKind::Delete, "/data");

        let err = registry
            .begin_action(
                "demo",
                "bob",
                ChangeKind::Delete,
                &Pathname::parse("/data/sub").unwrap(),
                None,
                &[staging_scope("/data/sub")],
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Specified target conflicts with an ongoing action"
        );
    }

    #[test]
    fn completion_releases_scopes_and_logs_change() {
        let registry = Registry::in_memory().unwrap();
        let action = begin(&registry, ChangeKind::Delete, "/data");

        let completed = registry
            .complete_action(&action.id, new_change(ChangeKind::Delete, "/data"))
            .unwrap();
        assert_eq!(completed.status, ActionStatus::Completed);
        assert!(completed.completed_at.is_some());

        registry.check_scopes(&[staging_scope("/data")]).unwrap();

        let last = registry
            .last_change("demo", ChangeKind::Delete)
            .unwrap()
            .unwrap();
        assert_eq!(last.pathname, "/data");
        assert_eq!(last.mode, ChangeMode::System);
    }

    #[test]
    fn failure_releases_scopes_without_logging() {
        let registry = Registry::in_memory().unwrap();
        let action = begin(&registry, ChangeKind::Delete, "/data");

        let failed = registry.fail_action(&action.id, "disk on fire").unwrap();
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk on fire"));
        assert!(failed.completed_at.is_none());

        registry.check_scopes(&[staging_scope("/data")]).unwrap();
        assert!(registry
            .last_change("demo", ChangeKind::Delete)
            .unwrap()
            .is_none());
    }

    #[test]
    fn finished_actions_cannot_transition_again() {
        let registry = Registry::in_memory().unwrap();
        let action = begin(&registry, ChangeKind::Delete, "/data");
        registry
            .complete_action(&action.id, new_change(ChangeKind::Delete, "/data"))
            .unwrap();

        assert!(registry.fail_action(&action.id, "late").is_err());
        assert!(registry
            .complete_action(&action.id, new_change(ChangeKind::Delete, "/data"))
            .is_err());
    }

    #[test]
    fn list_filters_by_status() {
        let registry = Registry::in_memory().unwrap();
        let a = begin(&registry, ChangeKind::Delete, "/a");
        let b = begin(&registry, ChangeKind::Delete, "/b");
        registry
            .complete_action(&a.id, new_change(ChangeKind::Delete, "/a"))
            .unwrap();

        let pending = registry.list_actions("demo", Some(ActionStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);

        let all = registry.list_actions("demo", None).unwrap();
        assert_eq!(all.len(), 2);

        assert!(registry
            .list_actions("other", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn get_action_by_id() {
        let registry = Registry::in_memory().unwrap();
        let action = begin(&registry, ChangeKind::Move, "/m");

        let found = registry.get_action(&action.id).unwrap().unwrap();
        assert_eq!(found.change, ChangeKind::Move);
        assert_eq!(found.status, ActionStatus::Pending);

        assert!(registry.get_action("nope").unwrap().is_none());
    }
}
