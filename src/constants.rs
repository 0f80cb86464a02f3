//! Service-wide policy constants.

use std::time::Duration;

/// Suffix appended to a project's staging area directory name.
///
/// Project `demo` stores mutable data under `demo+/` and frozen data
/// under `demo/`.
pub const STAGING_FOLDER_SUFFIX: &str = "+";

/// Maximum allowed length of a percent-encoded pathname.
///
/// This is the binding constraint of the underlying storage and transport
/// layers; longer pathnames are rejected before any other processing.
pub const MAX_ENCODED_PATHNAME_LENGTH: usize = 200;

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 4827;

/// Maximum retry attempts for transient storage errors (not counting the
/// initial attempt).
pub const STORAGE_RETRY_ATTEMPTS: u32 = 3;

/// Initial backoff delay for storage retries.
pub const STORAGE_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff delay for storage retries.
pub const STORAGE_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Default interval between polls when waiting for pending actions.
pub const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout when waiting for pending actions to complete.
pub const PENDING_WAIT_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// Filename of the node metadata database inside the data root.
pub const NODES_DB_FILENAME: &str = "nodes.redb";

/// Filename of the registry database inside the data root.
pub const REGISTRY_DB_FILENAME: &str = "registry.sqlite";
