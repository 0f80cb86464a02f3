//! Node metadata database operations.
//!
//! Handles saving, loading, and removing node metadata from the redb
//! database, plus reconciliation between the filesystem and the metadata
//! database on startup. Keys are area-qualified pathnames relative to the
//! data root (`demo+/test/Contact.txt`), so one table covers every project
//! and both areas.

use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::types::{NodeMeta, NODES_TABLE};
use crate::constants::{NODES_DB_FILENAME, REGISTRY_DB_FILENAME};

/// Saves node metadata under the given area-qualified key.
pub(crate) fn save_meta(db: &Database, key: &str, meta: &NodeMeta) -> Result<()> {
    let write_txn = db
        .begin_write()
        .context("Failed to begin write transaction")?;

    {
        let mut table = write_txn
            .open_table(NODES_TABLE)
            .context("Failed to open nodes table")?;

        let json = serde_json::to_vec(meta).context("Failed to serialize node metadata")?;

        table
            .insert(key, json.as_slice())
            .with_context(|| format!("Failed to insert node metadata: {key}"))?;
    }

    write_txn
        .commit()
        .context("Failed to commit metadata save transaction")?;

    Ok(())
}

/// Loads node metadata for the given key.
pub(crate) fn load_meta(db: &Database, key: &str) -> Result<Option<NodeMeta>> {
    let read_txn = db
        .begin_read()
        .context("Failed to begin read transaction")?;

    let table = read_txn
        .open_table(NODES_TABLE)
        .context("Failed to open nodes table")?;

    let result = table
        .get(key)
        .with_context(|| format!("Failed to read node metadata: {key}"))?;

    match result {
        Some(guard) => {
            let meta = serde_json::from_slice(guard.value())
                .with_context(|| format!("Failed to deserialize node metadata: {key}"))?;
            Ok(Some(meta))
        },
        None => Ok(None),
    }
}

/// Removes node metadata for the given key.
pub(crate) fn remove_meta(db: &Database, key: &str) -> Result<()> {
    let write_txn = db
        .begin_write()
        .context("Failed to begin write transaction")?;

    {
        let mut table = write_txn
            .open_table(NODES_TABLE)
            .context("Failed to open nodes table")?;

        table
            .remove(key)
            .with_context(|| format!("Failed to remove node metadata: {key}"))?;
    }

    write_txn
        .commit()
        .context("Failed to commit metadata removal transaction")?;

    Ok(())
}

/// Lists all `(key, meta)` pairs whose key starts with `prefix`.
pub(crate) fn list_prefix(db: &Database, prefix: &str) -> Result<Vec<(String, NodeMeta)>> {
    let read_txn = db
        .begin_read()
        .context("Failed to begin read transaction")?;

    let table = read_txn
        .open_table(NODES_TABLE)
        .context("Failed to open nodes table")?;

    let mut nodes = Vec::new();

    for item in table.iter().context("Failed to iterate nodes table")? {
        let (key, value) = item.context("Failed to read node entry")?;

        if !key.value().starts_with(prefix) {
            continue;
        }

        if let Ok(meta) = serde_json::from_slice::<NodeMeta>(value.value()) {
            nodes.push((key.value().to_string(), meta));
        }
    }

    nodes.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(nodes)
}

/// Reconciles the metadata database with actual filesystem state.
///
/// Called on startup to handle:
/// - Files deleted outside the service (removes orphaned metadata)
/// - Files added outside the service (creates missing metadata, no checksum)
/// - Files modified outside the service (updates stale sizes)
///
/// # Errors
///
/// Returns an error if directory scanning or database operations fail.
pub(crate) fn reconcile(db: &Database, data_root: &Path) -> Result<()> {
    tracing::debug!(data_root = %data_root.display(), "Reconciling node metadata");

    let mut fs_files: HashSet<String> = HashSet::new();
    scan_directory(data_root, data_root, &mut fs_files)?;

    let mut orphaned: Vec<String> = Vec::new();
    let mut stale: Vec<(String, u64)> = Vec::new();

    {
        let read_txn = db
            .begin_read()
            .context("Failed to begin read transaction for reconciliation")?;
        let table = read_txn
            .open_table(NODES_TABLE)
            .context("Failed to open nodes table for reconciliation")?;

        for item in table.iter().context("Failed to iterate nodes table")? {
            let (key, value) = item.context("Failed to read node entry")?;
            let key = key.value().to_string();

            if fs_files.contains(&key) {
                fs_files.remove(&key);

                if let Ok(meta) = serde_json::from_slice::<NodeMeta>(value.value())
                    && let Ok(file_meta) = fs::metadata(data_root.join(&key))
                    && file_meta.len() != meta.size
                {
                    stale.push((key, file_meta.len()));
                }
            } else {
                orphaned.push(key);
            }
        }
    }

    if !orphaned.is_empty() {
        tracing::info!(count = orphaned.len(), "Removing orphaned metadata entries");
        for key in &orphaned {
            remove_meta(db, key)?;
        }
    }

    if !fs_files.is_empty() {
        tracing::info!(count = fs_files.len(), "Creating metadata for untracked files");
        for key in &fs_files {
            let file_path = data_root.join(key);
            let Some(pathname) = key.find('/').map(|idx| key[idx..].to_string()) else {
                continue;
            };
            if let Ok(file_meta) = fs::metadata(&file_path) {
                let content_type = mime_guess::from_path(&file_path)
                    .first()
                    .map_or_else(|| "application/octet-stream".to_string(), |m| m.to_string());

                let now = Utc::now();
                let meta = NodeMeta {
                    pathname,
                    size: file_meta.len(),
                    checksum: None,
                    content_type,
                    uploaded_at: now,
                    modified_at: now,
                    pid: None,
                    frozen_at: None,
                };
                save_meta(db, key, &meta)?;
            }
        }
    }

    if !stale.is_empty() {
        tracing::info!(count = stale.len(), "Updating stale metadata entries");
        for (key, actual_size) in &stale {
            if let Some(mut meta) = load_meta(db, key)? {
                meta.size = *actual_size;
                meta.modified_at = Utc::now();
                // Stored digest no longer describes the bytes on disk.
                meta.checksum = None;
                save_meta(db, key, &meta)?;
            }
        }
    }

    let total = orphaned.len() + fs_files.len() + stale.len();
    if total > 0 {
        tracing::info!(
            orphaned = orphaned.len(),
            untracked = fs_files.len(),
            stale = stale.len(),
            "Node metadata reconciliation complete"
        );
    } else {
        tracing::debug!("Node metadata is consistent with filesystem");
    }

    Ok(())
}

/// Recursively scans a directory and collects relative paths to files.
fn scan_directory(data_root: &Path, dir: &Path, files: &mut HashSet<String>) -> Result<()> {
    if !dir.exists() || !dir.is_dir() {
        return Ok(());
    }

    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();

        // Skip the service's own databases, including sqlite journals.
        if path.file_name().is_some_and(|n| {
            let name = n.to_string_lossy();
            name == NODES_DB_FILENAME || name.starts_with(REGISTRY_DB_FILENAME)
        }) {
            continue;
        }
        if path.extension().is_some_and(|e| e == "lock") {
            continue;
        }

        if path.is_dir() {
            scan_directory(data_root, &path, files)?;
        } else if path.is_file() {
            if let Ok(relative) = path.strip_prefix(data_root) {
                let relative_str = relative.to_string_lossy().replace('\\', "/");
                files.insert(relative_str);
            }
        }
    }

    Ok(())
}
