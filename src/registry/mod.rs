//! Durable registry for scopes, actions, data changes, and the service lock.
//!
//! A single SQLite database is the one point of serialization for all
//! process-wide mutable state: scope acquisition is a transactional
//! check-and-insert, and action completion appends its data-change record
//! in the same transaction, so there is no window in which a completed
//! action exists without a log entry.
//!
//! All methods are blocking; async callers wrap them in `spawn_blocking`.

mod actions;
mod changes;
mod locks;

pub use actions::{Action, ActionStatus};
pub use changes::{ChangeKind, ChangeMode, DataChange, NewChange};

use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS service_lock (
    id        INTEGER PRIMARY KEY CHECK (id = 1),
    locked_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scopes (
    guard       TEXT NOT NULL,
    project     TEXT NOT NULL,
    area        TEXT NOT NULL,
    pathname    TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scopes_lookup ON scopes (project, area, pathname);
CREATE INDEX IF NOT EXISTS idx_scopes_guard ON scopes (guard);

CREATE TABLE IF NOT EXISTS actions (
    id           TEXT PRIMARY KEY,
    project      TEXT NOT NULL,
    user         TEXT NOT NULL,
    change       TEXT NOT NULL,
    pathname     TEXT NOT NULL,
    target       TEXT,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    completed_at TEXT,
    error        TEXT
);
CREATE INDEX IF NOT EXISTS idx_actions_project_status ON actions (project, status);

CREATE TABLE IF NOT EXISTS data_changes (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    project   TEXT NOT NULL,
    user      TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    change    TEXT NOT NULL,
    pathname  TEXT NOT NULL,
    target    TEXT,
    mode      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_changes_lookup ON data_changes (project, change, timestamp);
";

/// Registry service over the shared SQLite database.
///
/// `Registry` is `Clone`; all clones share one connection behind a mutex,
/// which is the serialization point required for atomic scope acquisition.
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
}

impl Registry {
    /// Creates or opens the registry database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be initialized.
    pub fn open<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("Failed to open registry database: {}", path.as_ref().display())
        })?;
        Self::init(conn)
    }

    /// Creates an in-memory registry. Testing and embedded use only; all
    /// state is lost when the process exits.
    pub fn in_memory() -> AnyResult<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory registry")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AnyResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize registry schema")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        // Scopes held by a previous process are stale by definition.
        registry.clear_stale_scopes()?;

        Ok(registry)
    }

    /// Removes scope rows left behind by a crashed process and marks their
    /// pending actions failed, so no scope stays occupied forever.
    fn clear_stale_scopes(&self) -> AnyResult<()> {
        let conn = self.conn.lock();
        let stale: usize = conn
            .execute(
                "UPDATE actions SET status = 'failed',
                        completed_at = NULL,
                        error = 'Interrupted by service restart'
                 WHERE status = 'pending'",
                [],
            )
            .context("Failed to fail interrupted actions")?;
        conn.execute("DELETE FROM scopes", [])
            .context("Failed to clear stale scopes")?;
        if stale > 0 {
            tracing::warn!(count = stale, "Marked interrupted pending actions as failed");
        }
        Ok(())
    }

    pub(crate) fn lock_conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
