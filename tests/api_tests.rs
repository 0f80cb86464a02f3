//! HTTP API integration tests.
//!
//! Drives the axum router directly with `tower::ServiceExt::oneshot`, with
//! a real object store in a temp directory and an in-memory registry.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use icebox::config::{AuthConfig, Credential, ProjectCredential};
use icebox::http::{router, AppState};
use icebox::notify::FreezeNotifier;
use icebox::registry::Registry;
use icebox::service::CoreService;
use icebox::store::ObjectStore;

struct TestApp {
    app: Router,
    service: CoreService,
    _tmp: TempDir,
}

fn auth_config() -> AuthConfig {
    AuthConfig {
        admin: Some(Credential {
            user: "admin".to_string(),
            password: "admin_pw".to_string(),
        }),
        projects: vec![
            ProjectCredential {
                project: "demo".to_string(),
                user: "alice".to_string(),
                password: "alice_pw".to_string(),
            },
            ProjectCredential {
                project: "other".to_string(),
                user: "bob".to_string(),
                password: "bob_pw".to_string(),
            },
        ],
    }
}

fn create_app() -> TestApp {
    let tmp = TempDir::new().unwrap();
    let store = ObjectStore::open(tmp.path()).unwrap();
    store.ensure_project("demo").unwrap();
    let registry = Registry::in_memory().unwrap();
    let (notifier, _rx) = FreezeNotifier::channel();
    let service = CoreService::new(store, registry, notifier);
    let app = router(AppState {
        service: service.clone(),
        auth: auth_config(),
    });
    TestApp {
        app,
        service,
        _tmp: tmp,
    }
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

fn alice() -> String {
    basic("alice", "alice_pw")
}

fn admin() -> String {
    basic("admin", "admin_pw")
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn send_raw(
    app: &Router,
    req: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes.to_vec())
}

fn get(uri: &str, auth: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::AUTHORIZATION, auth)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, auth: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, auth)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_bytes(uri: &str, auth: &str, data: &[u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::AUTHORIZATION, auth)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(data.to_vec()))
        .unwrap()
}

async fn upload(app: &Router, pathname: &str, data: &[u8]) {
    let (status, _) = send(
        app,
        put_bytes(&format!("/files/demo{pathname}"), &alice(), data),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn drain(service: &CoreService) {
    assert!(service
        .wait_for_pending_with("demo", Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap());
}

#[tokio::test]
async fn health_is_open() {
    let t = create_app();
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn everything_else_requires_auth() {
    let t = create_app();
    for uri in ["/actions?project=demo", "/lock/all", "/inventory/demo"] {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(&t.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(body["message"], "Authentication failed");
    }
}

#[tokio::test]
async fn project_credentials_cannot_cross_projects() {
    let t = create_app();
    let (status, body) = send(&t.app, get("/inventory/demo", &basic("bob", "bob_pw"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Authentication failed");
}

#[tokio::test]
async fn upload_stat_and_data_change() {
    let t = create_app();
    upload(&t.app, "/dir/hello.txt", b"Hello, World!").await;

    let (status, body) = send(&t.app, get("/files/demo/dir/hello.txt", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "file");
    assert_eq!(body["size"], 13);
    assert!(body["checksum"]
        .as_str()
        .unwrap()
        .starts_with("sha256:"));

    let (status, body) = send(&t.app, get("/dataChanges/demo/last?change=add", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["change"], "add");
    assert_eq!(body["pathname"], "/demo+/dir/hello.txt");
    assert_eq!(body["user"], "alice");
    assert_eq!(body["mode"], "api");
    assert!(body["target"].is_null());
}

#[tokio::test]
async fn last_change_of_unseen_kind_is_404() {
    let t = create_app();
    let (status, _) = send(&t.app, get("/dataChanges/demo/last?change=delete", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_pathname_is_rejected() {
    let t = create_app();
    let (status, body) = send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "relative/path" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Target pathname invalid or missing");
}

#[tokio::test]
async fn freeze_lifecycle_over_http() {
    let t = create_app();
    upload(&t.app, "/exp/data.dat", b"12345").await;

    let (status, action) = send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/exp" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(action["status"], "pending");
    let id = action["id"].as_str().unwrap().to_string();

    drain(&t.service).await;

    let (status, finished) = send(&t.app, get(&format!("/actions/{id}"), &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["status"], "completed");
    assert!(finished["completed_at"].is_string());

    // Data moved to the frozen area with a persistent identifier.
    let (status, node) = send(
        &t.app,
        get("/files/demo/exp/data.dat?area=frozen", &alice()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(node["pid"].is_string());
    assert!(node["frozen_at"].is_string());

    let (status, _) = send(&t.app, get("/files/demo/exp/data.dat", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Inventory exposes the frozen file.
    let (status, inventory) = send(&t.app, get("/inventory/demo", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inventory["files"].as_array().unwrap().len(), 1);
    assert_eq!(inventory["files"][0]["pathname"], "/exp/data.dat");
}

#[tokio::test]
async fn freeze_missing_target_is_404() {
    let t = create_app();
    let (status, body) = send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/ghost" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Specified target not found");
}

#[tokio::test]
async fn actions_listing_filters_by_status() {
    let t = create_app();
    upload(&t.app, "/a/f", b"x").await;

    let (_, action) = send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/a" }),
        ),
    )
    .await;
    drain(&t.service).await;

    let (status, completed) = send(
        &t.app,
        get("/actions?project=demo&status=completed", &alice()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let completed = completed.as_array().unwrap().clone();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["id"], action["id"]);

    let (status, pending) = send(&t.app, get("/actions?project=demo&status=pending", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(pending.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn lock_protocol_roundtrip() {
    let t = create_app();

    // Unlocked service reports absence, not false.
    let (status, _) = send(&t.app, get("/lock/all", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Project credentials may not set the lock.
    let (status, _) = send(&t.app, post_json("/lock/all", &alice(), json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&t.app, post_json("/lock/all", &admin(), json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&t.app, get("/lock/all", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["locked_at"].is_string());

    // Locked service rejects mutations.
    let (status, body) = send(
        &t.app,
        put_bytes("/files/demo/blocked.txt", &alice(), b"x"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        body["message"],
        "Specified target conflicts with an ongoing action"
    );

    let req = Request::builder()
        .method("DELETE")
        .uri("/lock/all")
        .header(header::AUTHORIZATION, admin())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&t.app, get("/lock/all", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scope_probe_reports_conflicts() {
    let t = create_app();
    upload(&t.app, "/busy/f", b"x").await;

    let (status, _) = send(&t.app, get("/scopeOK?project=demo&pathname=/busy", &alice())).await;
    assert_eq!(status, StatusCode::OK);

    t.service
        .freeze("demo", "alice", &icebox::Pathname::parse("/busy").unwrap(), icebox::ChangeMode::Api)
        .await
        .unwrap();

    // The scope is held at least until the background task completes; once
    // drained it must be clear again.
    drain(&t.service).await;
    let (status, _) = send(&t.app, get("/scopeOK?project=demo&pathname=/busy", &alice())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn copy_and_move_endpoints() {
    let t = create_app();
    upload(&t.app, "/dir/a.txt", b"abc").await;

    let (status, _) = send(
        &t.app,
        post_json(
            "/copy/demo",
            &alice(),
            json!({ "pathname": "/dir/a.txt", "target": "/dir/b.txt" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &t.app,
        post_json(
            "/move/demo",
            &alice(),
            json!({ "pathname": "/dir/b.txt", "target": "/dir/c.txt" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["change"], "rename");

    let (status, change) = send(&t.app, get("/dataChanges/demo/last?change=rename", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(change["pathname"], "/demo+/dir/b.txt");
    assert_eq!(change["target"], "/demo+/dir/c.txt");

    // Copy onto an existing node conflicts.
    let (status, body) = send(
        &t.app,
        post_json(
            "/copy/demo",
            &alice(),
            json!({ "pathname": "/dir/a.txt", "target": "/dir/c.txt" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "Specified new target already exists");
}

#[tokio::test]
async fn copy_from_frozen_over_http() {
    let t = create_app();
    upload(&t.app, "/fz/data.txt", b"12345").await;
    send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/fz" }),
        ),
    )
    .await;
    drain(&t.service).await;

    let (status, _) = send(
        &t.app,
        post_json(
            "/copy/demo",
            &alice(),
            json!({ "pathname": "/fz/data.txt", "target": "/restored.txt", "area": "frozen" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Restored copy is an ordinary staging node; the frozen source stays.
    let (status, node) = send(&t.app, get("/files/demo/restored.txt", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["size"], 5);
    assert!(node["pid"].is_null());
    let (status, _) = send(&t.app, get("/files/demo/fz/data.txt?area=frozen", &alice())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, change) = send(&t.app, get("/dataChanges/demo/last?change=copy", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(change["pathname"], "/demo/fz/data.txt");
    assert_eq!(change["target"], "/demo+/restored.txt");
}

#[tokio::test]
async fn download_serves_bytes_from_both_areas() {
    let t = create_app();
    upload(&t.app, "/dl/hello.txt", b"Hello, World!").await;

    let (status, headers, body) =
        send_raw(&t.app, get("/download/demo/dl/hello.txt", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"Hello, World!".to_vec());
    let etag = headers[header::ETAG].to_str().unwrap();
    assert!(etag.starts_with('"') && !etag.contains("sha256:"));

    send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/dl" }),
        ),
    )
    .await;
    drain(&t.service).await;

    let (status, _, body) = send_raw(
        &t.app,
        get("/download/demo/dl/hello.txt?area=frozen", &alice()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"Hello, World!".to_vec());

    // Gone from staging after the freeze.
    let (status, _, _) = send_raw(&t.app, get("/download/demo/dl/hello.txt", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reupload_skips_unless_forced() {
    let t = create_app();
    upload(&t.app, "/f.txt", b"one").await;

    let (status, body) = send(&t.app, put_bytes("/files/demo/f.txt", &alice(), b"two")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"], true);

    let (status, body) = send(
        &t.app,
        put_bytes("/files/demo/f.txt?force=true", &alice(), b"two"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["size"], 3);
}

#[tokio::test]
async fn delete_endpoint_removes_staging_subtree() {
    let t = create_app();
    upload(&t.app, "/del/a", b"a").await;
    upload(&t.app, "/del/b", b"b").await;

    let req = Request::builder()
        .method("DELETE")
        .uri("/files/demo/del")
        .header(header::AUTHORIZATION, alice())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&t.app, get("/files/demo/del", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, change) = send(&t.app, get("/dataChanges/demo/last?change=delete", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(change["pathname"], "/demo+/del");
}

#[tokio::test]
async fn frozen_delete_action_over_http() {
    let t = create_app();
    upload(&t.app, "/fd/x", b"x").await;
    send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/fd" }),
        ),
    )
    .await;
    drain(&t.service).await;

    let (status, action) = send(
        &t.app,
        post_json(
            "/delete",
            &alice(),
            json!({ "project": "demo", "pathname": "/fd" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(action["change"], "delete");
    drain(&t.service).await;

    let (status, _) = send(&t.app, get("/files/demo/fd?area=frozen", &alice())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unfreeze_action_over_http() {
    let t = create_app();
    upload(&t.app, "/uf/x", b"x").await;
    send(
        &t.app,
        post_json(
            "/freeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/uf" }),
        ),
    )
    .await;
    drain(&t.service).await;

    let (status, _) = send(
        &t.app,
        post_json(
            "/unfreeze",
            &alice(),
            json!({ "project": "demo", "pathname": "/uf" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    drain(&t.service).await;

    let (status, node) = send(&t.app, get("/files/demo/uf/x", &alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(node["pid"].is_null());
}
