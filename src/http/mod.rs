//! HTTP API for the storage service.
//!
//! Thin axum layer over [`CoreService`]: handlers authenticate, parse, and
//! delegate; all semantics live in the service. Error categories map to
//! status codes here and nowhere else.

mod audit;
mod auth;
mod handlers;

pub use auth::Identity;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::config::AuthConfig;
use crate::error::ServiceError;
use crate::service::CoreService;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: CoreService,
    pub auth: AuthConfig,
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/freeze", post(handlers::freeze))
        .route("/unfreeze", post(handlers::unfreeze))
        .route("/delete", post(handlers::delete_frozen))
        .route("/actions", get(handlers::list_actions))
        .route("/actions/{id}", get(handlers::get_action))
        .route(
            "/lock/all",
            get(handlers::lock_status)
                .post(handlers::set_lock)
                .delete(handlers::clear_lock),
        )
        .route("/scopeOK", get(handlers::scope_ok))
        .route("/dataChanges/{project}/last", get(handlers::last_change))
        .route("/inventory/{project}", get(handlers::inventory))
        .route(
            "/files/{project}/{*pathname}",
            put(handlers::upload_file)
                .get(handlers::stat_file)
                .delete(handlers::delete_file),
        )
        .route(
            "/download/{project}/{*pathname}",
            get(handlers::download_file),
        )
        .route("/copy/{project}", post(handlers::copy_file))
        .route("/move/{project}", post(handlers::move_file))
        .with_state(state)
}

/// HTTP-facing error: a service error category plus its stable message.
#[derive(Debug)]
pub struct AppError(pub ServiceError);

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Authentication => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Storage(err) => {
                tracing::error!(error = %err, "Internal storage error");
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };
        // Category messages are stable; Storage's own Display is already
        // generic, so internal details stay in the log.
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}
