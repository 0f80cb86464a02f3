//! Request handlers.
//!
//! Every handler authenticates, authorizes the target project, parses
//! pathnames through the validator, and delegates to the core service.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::authenticate;
use super::{AppError, AppState};
use crate::error::ServiceError;
use crate::pathname::Pathname;
use crate::registry::{Action, ActionStatus, ChangeKind, ChangeMode, DataChange};
use crate::scope::Area;
use crate::service::{UploadOutcome, UploadRequest};
use crate::store::{bare_digest, Node, NodeMeta};

type HandlerResult<T> = Result<T, AppError>;

/// GET /health - Liveness probe, unauthenticated.
pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub(super) struct TargetRequest {
    project: String,
    pathname: String,
}

/// POST /freeze - Initiate a freeze action for a staging subtree.
pub(super) async fn freeze(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TargetRequest>,
) -> HandlerResult<Json<Action>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&req.project)?;
    let pathname = parse_pathname(&req.pathname)?;
    let action = state
        .service
        .freeze(&req.project, &identity.user, &pathname, ChangeMode::Api)
        .await?;
    Ok(Json(action))
}

/// POST /unfreeze - Initiate an unfreeze action for a frozen subtree.
pub(super) async fn unfreeze(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TargetRequest>,
) -> HandlerResult<Json<Action>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&req.project)?;
    let pathname = parse_pathname(&req.pathname)?;
    let action = state
        .service
        .unfreeze(&req.project, &identity.user, &pathname, ChangeMode::Api)
        .await?;
    Ok(Json(action))
}

/// POST /delete - Initiate removal of a frozen subtree.
pub(super) async fn delete_frozen(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TargetRequest>,
) -> HandlerResult<Json<Action>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&req.project)?;
    let pathname = parse_pathname(&req.pathname)?;
    let action = state
        .service
        .delete_frozen(&req.project, &identity.user, &pathname, ChangeMode::Api)
        .await?;
    Ok(Json(action))
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionsQuery {
    project: String,
    status: Option<ActionStatus>,
}

/// GET /actions?project=P&status=S - List a project's actions.
pub(super) async fn list_actions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActionsQuery>,
) -> HandlerResult<Json<Vec<Action>>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&query.project)?;
    let actions = state
        .service
        .list_actions(&query.project, query.status)
        .await?;
    Ok(Json(actions))
}

/// GET /actions/{id} - Look up one action.
pub(super) async fn get_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HandlerResult<Json<Action>> {
    let identity = authenticate(&state.auth, &headers)?;
    let action = state
        .service
        .get_action(&id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("No action with id {id}")))?;
    identity.authorize_project(&action.project)?;
    Ok(Json(action))
}

/// GET /lock/all - 200 with the lock timestamp when locked, 404 otherwise.
pub(super) async fn lock_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    authenticate(&state.auth, &headers)?;
    match state.service.lock_status().await? {
        Some(locked_at) => Ok(Json(json!({ "locked_at": locked_at }))),
        None => Err(ServiceError::NotFound("Service is not locked".to_string()).into()),
    }
}

/// POST /lock/all - Set the global service lock (admin only).
pub(super) async fn set_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> HandlerResult<StatusCode> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_admin()?;
    state.service.set_lock().await?;
    Ok(StatusCode::OK)
}

/// DELETE /lock/all - Clear the global service lock (admin only).
pub(super) async fn clear_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> HandlerResult<StatusCode> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_admin()?;
    state.service.clear_lock().await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct ScopeQuery {
    project: String,
    pathname: String,
}

/// GET /scopeOK?project=P&pathname=X - 200 when clear, 409 on conflict.
pub(super) async fn scope_ok(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ScopeQuery>,
) -> HandlerResult<Json<Value>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&query.project)?;
    let pathname = parse_pathname(&query.pathname)?;
    state.service.check_scope(&query.project, &pathname).await?;
    Ok(Json(json!({ "message": "OK" })))
}

#[derive(Debug, Deserialize)]
pub(super) struct ChangeQuery {
    change: ChangeKind,
}

/// GET /dataChanges/{project}/last?change=K - Most recent change of a kind.
pub(super) async fn last_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project): Path<String>,
    Query(query): Query<ChangeQuery>,
) -> HandlerResult<Json<DataChange>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let change = state
        .service
        .last_change(&project, query.change)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "No {} change recorded for project {project}",
                query.change
            ))
        })?;
    Ok(Json(change))
}

/// GET /inventory/{project} - Frozen-area file listing for replication.
pub(super) async fn inventory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> HandlerResult<Json<Value>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let nodes: Vec<NodeMeta> = state.service.inventory(&project).await?;
    Ok(Json(json!({ "project": project, "files": nodes })))
}

#[derive(Debug, Deserialize, Default)]
pub(super) struct UploadQuery {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    dry_run: bool,
    /// Set false to store the node without a digest.
    #[serde(default = "default_true")]
    checksum: bool,
}

fn default_true() -> bool {
    true
}

/// PUT /files/{project}/{pathname} - Upload a file into staging.
pub(super) async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project, pathname)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> HandlerResult<(StatusCode, Json<Value>)> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let pathname = parse_wild_pathname(&pathname)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let outcome = state
        .service
        .upload(UploadRequest {
            project,
            user: identity.user,
            pathname,
            data: body.to_vec(),
            content_type,
            with_checksum: query.checksum,
            force: query.force,
            dry_run: query.dry_run,
            mode: ChangeMode::Api,
        })
        .await?;

    Ok(match outcome {
        UploadOutcome::Stored(meta) => (StatusCode::CREATED, Json(json!(meta))),
        UploadOutcome::SkippedExisting => (StatusCode::OK, Json(json!({ "skipped": true }))),
        UploadOutcome::DryRunOk => (StatusCode::OK, Json(json!({ "dry_run": true }))),
    })
}

#[derive(Debug, Deserialize)]
pub(super) struct StatQuery {
    #[serde(default)]
    area: Option<String>,
}

/// GET /files/{project}/{pathname}?area=staging|frozen - Node details.
pub(super) async fn stat_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project, pathname)): Path<(String, String)>,
    Query(query): Query<StatQuery>,
) -> HandlerResult<Json<Node>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let pathname = parse_wild_pathname(&pathname)?;
    let area = parse_area(query.area.as_deref())?;
    let node = state
        .service
        .stat(&project, area, &pathname)
        .await?
        .ok_or_else(ServiceError::target_not_found)?;
    Ok(Json(node))
}

/// GET /download/{project}/{pathname}?area=staging|frozen - File bytes.
pub(super) async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project, pathname)): Path<(String, String)>,
    Query(query): Query<StatQuery>,
) -> HandlerResult<Response> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let pathname = parse_wild_pathname(&pathname)?;
    let area = parse_area(query.area.as_deref())?;
    let (meta, data) = state
        .service
        .download(&project, area, &pathname)
        .await?
        .ok_or_else(ServiceError::target_not_found)?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &meta.content_type);
    if let Some(checksum) = &meta.checksum {
        builder = builder.header(header::ETAG, format!("\"{}\"", bare_digest(checksum)));
    }
    builder
        .body(Body::from(data))
        .map_err(|err| ServiceError::Storage(anyhow::anyhow!("Failed to build response: {err}")).into())
}

/// DELETE /files/{project}/{pathname} - Delete a staging file or folder.
pub(super) async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project, pathname)): Path<(String, String)>,
) -> HandlerResult<StatusCode> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let pathname = parse_wild_pathname(&pathname)?;
    state
        .service
        .delete_staging(&project, &identity.user, &pathname, false, ChangeMode::Api)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub(super) struct TransferRequest {
    pathname: String,
    target: String,
    /// Source area for copies: `staging` (default) or `frozen`.
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

/// POST /copy/{project} - Copy a subtree into staging, from either area.
pub(super) async fn copy_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project): Path<String>,
    Json(req): Json<TransferRequest>,
) -> HandlerResult<StatusCode> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let src_area = parse_area(req.area.as_deref())?;
    let src = parse_pathname(&req.pathname)?;
    let dst = parse_pathname(&req.target)?;
    state
        .service
        .copy(&project, &identity.user, src_area, &src, &dst, req.dry_run, ChangeMode::Api)
        .await?;
    Ok(StatusCode::OK)
}

/// POST /move/{project} - Move or rename a staging subtree.
pub(super) async fn move_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project): Path<String>,
    Json(req): Json<TransferRequest>,
) -> HandlerResult<Json<Value>> {
    let identity = authenticate(&state.auth, &headers)?;
    identity.authorize_project(&project)?;
    let src = parse_pathname(&req.pathname)?;
    let dst = parse_pathname(&req.target)?;
    let kind = state
        .service
        .move_node(&project, &identity.user, &src, &dst, req.dry_run, ChangeMode::Api)
        .await?;
    Ok(Json(json!({ "change": kind })))
}

fn parse_pathname(raw: &str) -> Result<Pathname, ServiceError> {
    Pathname::parse(raw)
}

/// Wildcard captures arrive without their leading slash.
fn parse_wild_pathname(raw: &str) -> Result<Pathname, ServiceError> {
    Pathname::parse(&format!("/{raw}"))
}

fn parse_area(raw: Option<&str>) -> Result<Area, ServiceError> {
    match raw {
        None | Some("staging") => Ok(Area::Staging),
        Some("frozen") => Ok(Area::Frozen),
        Some(other) => Err(ServiceError::Validation(format!("Invalid area: {other}"))),
    }
}
