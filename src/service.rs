//! Core service facade.
//!
//! Orchestrates every mutation: validate, check or acquire scopes, mutate
//! the object store (with retry for transient failures), record the data
//! change, and finish the action. Staging-area file operations run inline;
//! area-crossing operations (freeze, unfreeze, frozen delete) run as
//! pending actions completed by a background task.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::{sleep, Instant};

use crate::error::{Result, ServiceError};
use crate::notify::{FreezeNotice, FreezeNotifier};
use crate::pathname::{validate_project, Pathname};
use crate::registry::{Action, ActionStatus, ChangeKind, ChangeMode, NewChange, Registry};
use crate::reliability::{retry_blocking, RetryConfig};
use crate::scope::{Area, Scope};
use crate::store::{Node, NodeMeta, ObjectStore};

/// Upload parameters.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub project: String,
    pub user: String,
    pub pathname: Pathname,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    /// When false the node is stored without a digest.
    pub with_checksum: bool,
    /// Overwrite an existing node instead of skipping.
    pub force: bool,
    pub dry_run: bool,
    pub mode: ChangeMode,
}

/// Outcome of an upload request.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Stored(NodeMeta),
    /// The pathname already holds a node and `force` was not set. No
    /// mutation happened and no change was recorded.
    SkippedExisting,
    /// Dry run: validation and collision checks passed, nothing written.
    DryRunOk,
}

/// Which background operation a pending action performs.
#[derive(Debug, Clone, Copy)]
enum ActionOp {
    Freeze,
    Unfreeze,
    DeleteFrozen,
}

/// The service core shared by the HTTP layer and embedding callers.
///
/// Cloning is cheap; clones share the store, registry, and notifier.
#[derive(Clone)]
pub struct CoreService {
    store: ObjectStore,
    registry: Registry,
    notifier: FreezeNotifier,
    retry: RetryConfig,
}

impl CoreService {
    pub fn new(store: ObjectStore, registry: Registry, notifier: FreezeNotifier) -> Self {
        Self {
            store,
            registry,
            notifier,
            retry: RetryConfig::default(),
        }
    }

    async fn run_blocking<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        spawn_blocking(task)
            .await
            .map_err(|e| ServiceError::Storage(anyhow::anyhow!("Blocking task panicked: {e}")))?
    }

    /// Stores a file in the project's staging area.
    ///
    /// Re-upload of an existing pathname without `force` is a skip: no
    /// mutation, no change record. With `force` the node is overwritten and
    /// a fresh `add` change recorded.
    pub async fn upload(&self, req: UploadRequest) -> Result<UploadOutcome> {
        validate_project(&req.project)?;

        let store = self.store.clone();
        let registry = self.registry.clone();
        let retry = self.retry.clone();

        self.run_blocking(move || {
            registry.check_scopes(&[Scope::new(
                &req.project,
                Area::Staging,
                req.pathname.clone(),
            )])?;

            if store.exists(&req.project, Area::Staging, &req.pathname) && !req.force {
                tracing::info!(
                    project = %req.project,
                    pathname = %req.pathname,
                    "Skipping existing file"
                );
                return Ok(UploadOutcome::SkippedExisting);
            }

            if req.dry_run {
                return Ok(UploadOutcome::DryRunOk);
            }

            store.ensure_project(&req.project)?;
            let meta = retry_blocking(&retry, "upload", || {
                store.put(
                    &req.project,
                    &req.pathname,
                    &req.data,
                    req.content_type.as_deref(),
                    req.with_checksum,
                )
            })?;

            registry.append_change(NewChange {
                project: req.project.clone(),
                user: req.user.clone(),
                change: ChangeKind::Add,
                pathname: qualified(&req.project, Area::Staging, &req.pathname),
                target: None,
                mode: req.mode,
            })?;

            Ok(UploadOutcome::Stored(meta))
        })
        .await
    }

    /// Copies a file or folder subtree to a new staging pathname.
    ///
    /// The source may sit in either area; copying out of the frozen area is
    /// how frozen data is brought back for further work without an
    /// unfreeze. The destination is always staging.
    pub async fn copy(
        &self,
        project: &str,
        user: &str,
        src_area: Area,
        src: &Pathname,
        dst: &Pathname,
        dry_run: bool,
        mode: ChangeMode,
    ) -> Result<()> {
        validate_project(project)?;
        let (project, user) = (project.to_string(), user.to_string());
        let (src, dst) = (src.clone(), dst.clone());
        let store = self.store.clone();
        let registry = self.registry.clone();
        let retry = self.retry.clone();

        self.run_blocking(move || {
            registry.check_scopes(&[
                Scope::new(&project, src_area, src.clone()),
                Scope::new(&project, Area::Staging, dst.clone()),
            ])?;

            if !store.exists(&project, src_area, &src) {
                return Err(ServiceError::target_not_found());
            }
            if store.exists(&project, Area::Staging, &dst) {
                return Err(ServiceError::target_exists());
            }
            if dry_run {
                return Ok(());
            }

            retry_blocking(&retry, "copy", || store.copy(&project, src_area, &src, &dst))?;

            registry.append_change(NewChange {
                project: project.clone(),
                user,
                change: ChangeKind::Copy,
                pathname: qualified(&project, src_area, &src),
                target: Some(qualified(&project, Area::Staging, &dst)),
                mode,
            })?;
            Ok(())
        })
        .await
    }

    /// Moves or renames a staging file or folder subtree.
    ///
    /// A destination sharing the source's parent directory is a rename;
    /// anything else is a move. Returns the kind recorded.
    pub async fn move_node(
        &self,
        project: &str,
        user: &str,
        src: &Pathname,
        dst: &Pathname,
        dry_run: bool,
        mode: ChangeMode,
    ) -> Result<ChangeKind> {
        validate_project(project)?;
        let kind = if src.parent() == dst.parent() {
            ChangeKind::Rename
        } else {
            ChangeKind::Move
        };

        let (project, user) = (project.to_string(), user.to_string());
        let (src, dst) = (src.clone(), dst.clone());
        let store = self.store.clone();
        let registry = self.registry.clone();
        let retry = self.retry.clone();

        self.run_blocking(move || {
            registry.check_scopes(&[
                Scope::new(&project, Area::Staging, src.clone()),
                Scope::new(&project, Area::Staging, dst.clone()),
            ])?;

            if !store.exists(&project, Area::Staging, &src) {
                return Err(ServiceError::target_not_found());
            }
            if store.exists(&project, Area::Staging, &dst) {
                return Err(ServiceError::target_exists());
            }
            if dry_run {
                return Ok(kind);
            }

            retry_blocking(&retry, "move", || store.move_staging(&project, &src, &dst))?;

            registry.append_change(NewChange {
                project: project.clone(),
                user,
                change: kind,
                pathname: qualified(&project, Area::Staging, &src),
                target: Some(qualified(&project, Area::Staging, &dst)),
                mode,
            })?;
            Ok(kind)
        })
        .await
    }

    /// Deletes a staging file or folder subtree.
    pub async fn delete_staging(
        &self,
        project: &str,
        user: &str,
        pathname: &Pathname,
        dry_run: bool,
        mode: ChangeMode,
    ) -> Result<()> {
        validate_project(project)?;
        let (project, user) = (project.to_string(), user.to_string());
        let pathname = pathname.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let retry = self.retry.clone();

        self.run_blocking(move || {
            registry.check_scopes(&[Scope::new(&project, Area::Staging, pathname.clone())])?;

            if !store.exists(&project, Area::Staging, &pathname) {
                return Err(ServiceError::target_not_found());
            }
            if dry_run {
                return Ok(());
            }

            retry_blocking(&retry, "delete", || {
                store.delete(&project, Area::Staging, &pathname)
            })?;

            registry.append_change(NewChange {
                project: project.clone(),
                user,
                change: ChangeKind::Delete,
                pathname: qualified(&project, Area::Staging, &pathname),
                target: None,
                mode,
            })?;
            Ok(())
        })
        .await
    }

    /// Initiates a freeze of a staging subtree.
    ///
    /// Acquires scopes over the pathname in both areas, records a pending
    /// action, and returns it. A background task relocates the data,
    /// completes the action, and publishes a freeze notice.
    pub async fn freeze(
        &self,
        project: &str,
        user: &str,
        pathname: &Pathname,
        mode: ChangeMode,
    ) -> Result<Action> {
        self.begin_area_action(project, user, pathname, ActionOp::Freeze, mode)
            .await
    }

    /// Initiates an unfreeze of a frozen subtree back into staging.
    pub async fn unfreeze(
        &self,
        project: &str,
        user: &str,
        pathname: &Pathname,
        mode: ChangeMode,
    ) -> Result<Action> {
        self.begin_area_action(project, user, pathname, ActionOp::Unfreeze, mode)
            .await
    }

    /// Initiates removal of a frozen subtree.
    pub async fn delete_frozen(
        &self,
        project: &str,
        user: &str,
        pathname: &Pathname,
        mode: ChangeMode,
    ) -> Result<Action> {
        self.begin_area_action(project, user, pathname, ActionOp::DeleteFrozen, mode)
            .await
    }

    async fn begin_area_action(
        &self,
        project: &str,
        user: &str,
        pathname: &Pathname,
        op: ActionOp,
        mode: ChangeMode,
    ) -> Result<Action> {
        validate_project(project)?;

        let (src_area, change) = match op {
            ActionOp::Freeze => (Area::Staging, ChangeKind::Move),
            ActionOp::Unfreeze => (Area::Frozen, ChangeKind::Move),
            ActionOp::DeleteFrozen => (Area::Frozen, ChangeKind::Delete),
        };

        let action = {
            let (project, user) = (project.to_string(), user.to_string());
            let pathname = pathname.clone();
            let store = self.store.clone();
            let registry = self.registry.clone();

            self.run_blocking(move || {
                if !store.exists(&project, src_area, &pathname) {
                    return Err(ServiceError::target_not_found());
                }
                let scopes = match op {
                    // Relocations occupy the pathname in both areas.
                    ActionOp::Freeze | ActionOp::Unfreeze => {
                        let dst_area = match src_area {
                            Area::Staging => Area::Frozen,
                            Area::Frozen => Area::Staging,
                        };
                        if store.exists(&project, dst_area, &pathname) {
                            return Err(ServiceError::target_exists());
                        }
                        vec![
                            Scope::new(&project, Area::Staging, pathname.clone()),
                            Scope::new(&project, Area::Frozen, pathname.clone()),
                        ]
                    },
                    ActionOp::DeleteFrozen => {
                        vec![Scope::new(&project, Area::Frozen, pathname.clone())]
                    },
                };
                registry.begin_action(&project, &user, change, &pathname, None, &scopes)
            })
            .await?
        };

        self.spawn_action_task(action.clone(), op, mode);
        Ok(action)
    }

    /// Runs the store mutation for a pending action and finishes it.
    fn spawn_action_task(&self, action: Action, op: ActionOp, mode: ChangeMode) {
        let service = self.clone();
        tokio::spawn(async move {
            let store = service.store.clone();
            let retry = service.retry.clone();
            let project = action.project.clone();
            let pathname = match Pathname::parse(&action.pathname) {
                Ok(p) => p,
                Err(err) => {
                    // Cannot happen for an action we just created; fail it
                    // rather than leave it pending.
                    service.fail(&action.id, &err.to_string()).await;
                    return;
                },
            };

            let outcome = service
                .run_blocking({
                    let project = project.clone();
                    let pathname = pathname.clone();
                    move || {
                        retry_blocking(&retry, op_name(op), || match op {
                            ActionOp::Freeze => store.freeze(&project, &pathname).map(|_| ()),
                            ActionOp::Unfreeze => store.unfreeze(&project, &pathname).map(|_| ()),
                            ActionOp::DeleteFrozen => {
                                store.delete(&project, Area::Frozen, &pathname)
                            },
                        })
                    }
                })
                .await;

            match outcome {
                Ok(()) => {
                    let (change_pathname, change_target) = match op {
                        ActionOp::Freeze => (
                            qualified(&project, Area::Staging, &pathname),
                            Some(qualified(&project, Area::Frozen, &pathname)),
                        ),
                        ActionOp::Unfreeze => (
                            qualified(&project, Area::Frozen, &pathname),
                            Some(qualified(&project, Area::Staging, &pathname)),
                        ),
                        ActionOp::DeleteFrozen => {
                            (qualified(&project, Area::Frozen, &pathname), None)
                        },
                    };
                    let change = NewChange {
                        project: project.clone(),
                        user: action.user.clone(),
                        change: action.change,
                        pathname: change_pathname,
                        target: change_target,
                        mode,
                    };
                    let registry = service.registry.clone();
                    let id = action.id.clone();
                    let completed = service
                        .run_blocking(move || registry.complete_action(&id, change))
                        .await;
                    match completed {
                        Ok(_) => {
                            if matches!(op, ActionOp::Freeze) {
                                service.notifier.publish(FreezeNotice {
                                    project,
                                    pathname: pathname.as_str().to_string(),
                                    action_id: action.id,
                                });
                            }
                        },
                        Err(err) => {
                            // The store mutation committed but the registry
                            // step did not; fail the action so its scopes do
                            // not stay held until a restart.
                            tracing::error!(
                                action_id = %action.id,
                                error = %err,
                                "Failed to record action completion"
                            );
                            service.fail(&action.id, &err.to_string()).await;
                        },
                    }
                },
                Err(err) => {
                    service.fail(&action.id, &err.to_string()).await;
                },
            }
        });
    }

    async fn fail(&self, id: &str, error: &str) {
        let registry = self.registry.clone();
        let (id_owned, error) = (id.to_string(), error.to_string());
        let result = self
            .run_blocking(move || registry.fail_action(&id_owned, &error))
            .await;
        if let Err(err) = result {
            tracing::error!(action_id = %id, error = %err, "Failed to mark action failed");
        }
    }

    /// Polls until the project has no pending actions, using the default
    /// interval and timeout. Returns `false` when the timeout elapses first.
    pub async fn wait_for_pending(&self, project: &str) -> Result<bool> {
        self.wait_for_pending_with(
            project,
            crate::constants::PENDING_POLL_INTERVAL,
            crate::constants::PENDING_WAIT_TIMEOUT,
        )
        .await
    }

    /// Polls until the project has no pending actions. Returns `false` when
    /// the timeout elapses first.
    pub async fn wait_for_pending_with(
        &self,
        project: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let registry = self.registry.clone();
            let project_owned = project.to_string();
            let pending = self
                .run_blocking(move || {
                    registry.list_actions(&project_owned, Some(ActionStatus::Pending))
                })
                .await?;
            if pending.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(poll_interval).await;
        }
    }

    /// Advisory probe: succeeds when no ongoing action or lock covers the
    /// pathname in either area.
    pub async fn check_scope(&self, project: &str, pathname: &Pathname) -> Result<()> {
        validate_project(project)?;
        let registry = self.registry.clone();
        let scopes = vec![
            Scope::new(project, Area::Staging, pathname.clone()),
            Scope::new(project, Area::Frozen, pathname.clone()),
        ];
        self.run_blocking(move || registry.check_scopes(&scopes))
            .await
    }

    pub async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        let registry = self.registry.clone();
        let id = id.to_string();
        self.run_blocking(move || registry.get_action(&id)).await
    }

    pub async fn list_actions(
        &self,
        project: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<Action>> {
        validate_project(project)?;
        let registry = self.registry.clone();
        let project = project.to_string();
        self.run_blocking(move || registry.list_actions(&project, status))
            .await
    }

    pub async fn last_change(
        &self,
        project: &str,
        kind: ChangeKind,
    ) -> Result<Option<crate::registry::DataChange>> {
        validate_project(project)?;
        let registry = self.registry.clone();
        let project = project.to_string();
        self.run_blocking(move || registry.last_change(&project, kind))
            .await
    }

    pub async fn stat(
        &self,
        project: &str,
        area: Area,
        pathname: &Pathname,
    ) -> Result<Option<Node>> {
        validate_project(project)?;
        let store = self.store.clone();
        let (project, pathname) = (project.to_string(), pathname.clone());
        self.run_blocking(move || store.stat(&project, area, &pathname))
            .await
    }

    /// Reads a file's bytes and metadata from either area. Replication
    /// agents pull committed frozen content through this.
    pub async fn download(
        &self,
        project: &str,
        area: Area,
        pathname: &Pathname,
    ) -> Result<Option<(NodeMeta, Vec<u8>)>> {
        validate_project(project)?;
        let store = self.store.clone();
        let (project, pathname) = (project.to_string(), pathname.clone());
        self.run_blocking(move || store.read(&project, area, &pathname))
            .await
    }

    /// Frozen-area file listing, the replication pull interface.
    pub async fn inventory(&self, project: &str) -> Result<Vec<NodeMeta>> {
        validate_project(project)?;
        let store = self.store.clone();
        let project = project.to_string();
        self.run_blocking(move || store.list(&project, Area::Frozen, None))
            .await
    }

    pub async fn set_lock(&self) -> Result<()> {
        let registry = self.registry.clone();
        self.run_blocking(move || registry.set_global_lock()).await
    }

    pub async fn clear_lock(&self) -> Result<()> {
        let registry = self.registry.clone();
        self.run_blocking(move || registry.clear_global_lock())
            .await
    }

    pub async fn lock_status(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let registry = self.registry.clone();
        self.run_blocking(move || registry.global_lock()).await
    }
}

fn op_name(op: ActionOp) -> &'static str {
    match op {
        ActionOp::Freeze => "freeze",
        ActionOp::Unfreeze => "unfreeze",
        ActionOp::DeleteFrozen => "delete_frozen",
    }
}

/// Area-qualified pathname as recorded in the change log, e.g.
/// `/demo+/dir/file.txt` for a staging node of project `demo`.
fn qualified(project: &str, area: Area, pathname: &Pathname) -> String {
    format!("/{}{}", area.dir_name(project), pathname.as_str())
}
