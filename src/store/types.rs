//! Types and constants for the object store.

use chrono::{DateTime, Utc};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};

/// Table for node metadata storage. Keys are area-qualified pathnames
/// (`<area-dir><pathname>`, e.g. `demo+/test/Contact.txt`).
pub(crate) const NODES_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("nodes");

/// Persisted metadata for a single file node.
///
/// Folder nodes are derived views over their descendants and are never
/// persisted; only files carry metadata records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMeta {
    /// Project-relative pathname, leading slash (e.g. "/test/Contact.txt").
    pub pathname: String,
    /// Size in bytes.
    pub size: u64,
    /// `sha256:<hex>` digest, absent when the uploader opted out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// MIME content type.
    pub content_type: String,
    /// Timestamp of the original upload.
    pub uploaded_at: DateTime<Utc>,
    /// Timestamp of the last modification.
    pub modified_at: DateTime<Utc>,
    /// Persistent identifier, assigned at freeze time. Frozen files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    /// Freeze timestamp. Frozen files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<DateTime<Utc>>,
}

/// Whether a node is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// Query view of a node in an area, as returned by `stat`.
///
/// For folders, `size` is the sum of descendant file sizes and `contents`
/// lists descendant file pathnames; file-only fields are `None`.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub pathname: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<String>,
}

impl Node {
    pub(crate) fn file(meta: NodeMeta) -> Self {
        Self {
            pathname: meta.pathname,
            kind: NodeKind::File,
            size: meta.size,
            checksum: meta.checksum,
            content_type: Some(meta.content_type),
            pid: meta.pid,
            uploaded_at: Some(meta.uploaded_at),
            modified_at: Some(meta.modified_at),
            frozen_at: meta.frozen_at,
            contents: Vec::new(),
        }
    }

    pub(crate) fn folder(pathname: String, size: u64, contents: Vec<String>) -> Self {
        Self {
            pathname,
            kind: NodeKind::Folder,
            size,
            checksum: None,
            content_type: None,
            pid: None,
            uploaded_at: None,
            modified_at: None,
            frozen_at: None,
            contents,
        }
    }
}
