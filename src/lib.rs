//! icebox: research-data storage service core.
//!
//! Projects own two areas under one data root: a mutable staging area
//! (`<root>/<project>+/`) and an immutable frozen area
//! (`<root>/<project>/`). Staging files are uploaded, copied, moved, and
//! deleted freely; freezing relocates a subtree into the frozen area,
//! assigns persistent identifiers, and publishes a notification for
//! downstream agents. Every mutation is recorded in an append-only data
//! change log, and long-running area transitions run as actions guarded by
//! pathname scopes so concurrent operations can never overlap.

pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod notify;
pub mod pathname;
pub mod registry;
pub mod reliability;
pub mod scope;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use notify::{FreezeNotice, FreezeNotifier};
pub use pathname::{validate_project, Pathname};
pub use registry::{Action, ActionStatus, ChangeKind, ChangeMode, DataChange, Registry};
pub use scope::{Area, Scope};
pub use service::{CoreService, UploadOutcome, UploadRequest};
pub use store::{Node, NodeKind, NodeMeta, ObjectStore};
