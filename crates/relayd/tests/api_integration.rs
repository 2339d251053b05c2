//! Integration tests for the HTTP surface.
//!
//! These drive the real router in-process with `tower::ServiceExt`.
//! No tmux server is assumed: routes that would talk to tmux are
//! exercised on their validation and error paths, which is where the
//! wire contract lives.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use relay_core::SessionId;
use relayd::auth::AttachTokens;
use relayd::config::{Config, ProjectRoot};
use relayd::discovery::DiscoveryService;
use relayd::registry::SessionRegistry;
use relayd::server::{self, AppState, AttachRateLimiter};
use relayd::terminal::{BridgeSettings, TerminalBridge};
use relayd::tmux::{ConnectionWatch, TmuxManager, TmuxSettings};

const PSK: &str = "test-psk-for-integration";

struct TestEnv {
    app: Router,
    _log_root: tempfile::TempDir,
    _config_dir: tempfile::TempDir,
    project_root: tempfile::TempDir,
}

async fn test_env() -> TestEnv {
    let log_root = tempfile::TempDir::new().unwrap();
    let config_dir = tempfile::TempDir::new().unwrap();
    let project_root = tempfile::TempDir::new().unwrap();

    let mut config = Config::from_env();
    config.auth_token = PSK.to_string();
    config.log_root = log_root.path().to_path_buf();
    config.config_dir = config_dir.path().to_path_buf();
    config.project_roots = vec![ProjectRoot {
        label: "projects".to_string(),
        path: project_root.path().to_path_buf(),
    }];
    let config = Arc::new(config);

    let cancel = CancellationToken::new();
    let bridge = TerminalBridge::new(
        BridgeSettings {
            heartbeat_interval: config.heartbeat_interval,
            max_missed_pongs: config.max_missed_pongs,
            home_dir: std::env::temp_dir(),
        },
        cancel.clone(),
    );
    let tmux = Arc::new(TmuxManager::new(
        TmuxSettings {
            prefix: "relay-test".to_string(),
            cli_binary: "claude".to_string(),
            cols: 80,
            rows: 24,
            max_sessions: 10,
        },
        Arc::clone(&bridge) as Arc<dyn ConnectionWatch>,
    ));
    let discovery = DiscoveryService::new(
        config.log_root.clone(),
        config.session_cache_path(),
        cancel.clone(),
    );
    discovery.scan_all().await;

    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&discovery),
        Arc::clone(&tmux),
        Arc::clone(&bridge) as Arc<dyn ConnectionWatch>,
    ));

    let state = AppState {
        config,
        discovery,
        tmux,
        bridge,
        registry,
        tokens: Arc::new(AttachTokens::new()),
        rate_limiter: Arc::new(AttachRateLimiter::new()),
        started_at: Instant::now(),
    };

    TestEnv {
        app: server::router(state),
        _log_root: log_root,
        _config_dir: config_dir,
        project_root,
    }
}

fn get(path: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(path: &str, bearer: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Status probe
// ============================================================================

#[tokio::test]
async fn test_status_is_open_and_well_formed() {
    let env = test_env().await;

    let response = env.app.oneshot(get("/api/status", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["apiVersion"], 1);
    assert_eq!(body["activeSessions"], 0);
    assert!(body["tmuxSessions"].as_array().unwrap().is_empty());
    assert!(body["uptime"].as_u64().is_some());
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_sessions_requires_bearer() {
    let env = test_env().await;

    let response = env
        .app
        .clone()
        .oneshot(get("/api/sessions", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "UNAUTHORIZED");
    assert!(body["action"].as_str().is_some());
}

#[tokio::test]
async fn test_sessions_rejects_wrong_bearer() {
    let env = test_env().await;

    let response = env
        .app
        .oneshot(get("/api/sessions", Some("wrong-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_sessions_empty_with_valid_bearer() {
    let env = test_env().await;

    let response = env
        .app
        .oneshot(get("/api/sessions", Some(PSK)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body, serde_json::json!([]));
}

// ============================================================================
// Session id validation
// ============================================================================

#[tokio::test]
async fn test_get_session_rejects_invalid_id() {
    let env = test_env().await;

    let response = env
        .app
        .oneshot(get("/api/sessions/not-a-uuid", Some(PSK)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "INVALID_SESSION_ID");
}

#[tokio::test]
async fn test_attach_rejects_invalid_id() {
    let env = test_env().await;

    let response = env
        .app
        .oneshot(post(
            "/api/sessions/$(rm%20-rf)/attach",
            Some(PSK),
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_unknown_session_is_404() {
    let env = test_env().await;
    let id = SessionId::generate();

    let response = env
        .app
        .oneshot(get(&format!("/api/sessions/{id}"), Some(PSK)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"], "NOT_FOUND");
}

// ============================================================================
// Attach
// ============================================================================

#[tokio::test]
async fn test_attach_unknown_session_is_404() {
    let env = test_env().await;
    let id = SessionId::generate();

    let response = env
        .app
        .oneshot(post(&format!("/api/sessions/{id}/attach"), Some(PSK), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_attach_rate_limited_within_window() {
    let env = test_env().await;
    let id = SessionId::generate();
    let path = format!("/api/sessions/{id}/attach");

    let first = env
        .app
        .clone()
        .oneshot(post(&path, Some(PSK), "{}"))
        .await
        .unwrap();
    // Unknown session, but the attempt still claims the rate slot
    assert_eq!(first.status(), StatusCode::NOT_FOUND);

    let second = env
        .app
        .oneshot(post(&path, Some(PSK), "{}"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(second).await;
    assert_eq!(body["error"], "RATE_LIMITED");
}

// ============================================================================
// New session validation
// ============================================================================

#[tokio::test]
async fn test_new_session_rejects_relative_path() {
    let env = test_env().await;

    let response = env
        .app
        .oneshot(post(
            "/api/sessions/new",
            Some(PSK),
            r#"{"projectPath":"relative/path"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "INVALID_PATH");
}

#[tokio::test]
async fn test_new_session_rejects_path_outside_roots() {
    let env = test_env().await;

    let outside = tempfile::TempDir::new().unwrap();
    let body = format!(r#"{{"projectPath":"{}"}}"#, outside.path().display());

    let response = env
        .app
        .oneshot(post("/api/sessions/new", Some(PSK), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = json_body(response).await;
    assert_eq!(json["error"], "FORBIDDEN");
}

#[tokio::test]
async fn test_new_session_rejects_missing_directory() {
    let env = test_env().await;

    let missing = env.project_root.path().join("does-not-exist");
    let body = format!(r#"{{"projectPath":"{}"}}"#, missing.display());

    let response = env
        .app
        .oneshot(post("/api/sessions/new", Some(PSK), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "DIR_NOT_FOUND");
}

// ============================================================================
// Projects & directories
// ============================================================================

#[tokio::test]
async fn test_projects_empty() {
    let env = test_env().await;

    let response = env
        .app
        .oneshot(get("/api/projects", Some(PSK)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!([]));
}

#[tokio::test]
async fn test_directories_lists_subdirs_with_group() {
    let env = test_env().await;
    std::fs::create_dir(env.project_root.path().join("alpha")).unwrap();
    std::fs::create_dir(env.project_root.path().join("beta")).unwrap();
    std::fs::create_dir(env.project_root.path().join(".hidden")).unwrap();
    std::fs::write(env.project_root.path().join("file.txt"), "x").unwrap();

    let response = env
        .app
        .oneshot(get("/api/directories", Some(PSK)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"], "alpha");
    assert_eq!(entries[0]["group"], "projects");
    assert_eq!(entries[1]["name"], "beta");
}
