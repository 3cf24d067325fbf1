use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use hp_core::exec::CommandRunner;
use hp_core::fs::HostPaths;
use hp_core::security::credentials::hash_login_password_with_cost;
use hp_core::web::WebServerKind;
use hp_daemon::{build_router, AppState, JwtKeys};
use hp_db::models::{NewUser, Package, Role};
use hp_db::{queries, Database};
use hp_services::{AccountOrchestrator, HostContext, HostSettings};

const ADMIN_PASSWORD: &str = "Admin-Pass-42";

struct Harness {
    _dir: TempDir,
    app: Router,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db = Database::connect(&dir.path().join("panel.db")).await.unwrap();
    db.migrate().await.unwrap();
    queries::create_package(
        db.pool(),
        &Package {
            name: "Starter".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let hash = hash_login_password_with_cost(ADMIN_PASSWORD, 4).unwrap();
    queries::create_user(
        db.pool(),
        &NewUser {
            username: "panel_admin",
            email: "admin@panel.example",
            password_hash: &hash,
            role: Role::Admin,
            parent_id: None,
        },
    )
    .await
    .unwrap();

    let host = HostContext::new(
        CommandRunner::simulated(),
        HostPaths::rebased(dir.path().join("root")),
        HostSettings {
            web_server: WebServerKind::Apache,
            php_default_version: "8.2".to_string(),
            server_ip: "203.0.113.10".to_string(),
            nameservers: vec!["ns1.panel.example".to_string(), "ns2.panel.example".to_string()],
            acme_email: None,
        },
    );
    let accounts = AccountOrchestrator::new(db.clone(), host.clone())
        .with_hash_cost(4)
        .with_kill_grace(Duration::ZERO);
    let state = AppState::new(db, host, JwtKeys::new(b"test-secret".to_vec(), Duration::from_secs(600)))
        .with_accounts(accounts);
    Harness {
        _dir: dir,
        app: build_router(state),
    }
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/v1/auth/login",
        None,
        Some(json!({ "username": username, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["token"].as_str().unwrap().to_string()
}

async fn create_account(app: &Router, token: &str, username: &str, domain: &str) -> i64 {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/v1/accounts",
        Some(token),
        Some(json!({
            "username": username,
            "email": format!("{username}@owner.example"),
            "password": "Correct-Horse-9",
            "domain": domain,
            "package": "Starter",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["data"]["user"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let h = harness().await;
    let (status, body) = call(&h.app, Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn test_login_rejects_wrong_password() {
    let h = harness().await;
    let (status, body) = call(
        &h.app,
        Method::POST,
        "/api/v1/auth/login",
        None,
        Some(json!({ "username": "panel_admin", "password": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Invalid username or password");
}

#[tokio::test]
async fn test_protected_routes_need_a_token() {
    let h = harness().await;
    let (status, _) = call(&h.app, Method::GET, "/api/v1/accounts", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&h.app, Method::GET, "/api/v1/accounts", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_creates_and_lists_accounts() {
    let h = harness().await;
    let token = login(&h.app, "panel_admin", ADMIN_PASSWORD).await;
    let id = create_account(&h.app, &token, "alice", "alice.example").await;

    let (status, body) = call(&h.app, Method::GET, &format!("/api/v1/accounts/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["user"]["username"], "alice");
    assert!(body["data"]["user"].get("password_hash").is_none());

    let (status, body) = call(&h.app, Method::GET, "/api/v1/accounts", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["username"].as_str())
        .collect();
    assert!(names.contains(&"alice"));
}

#[tokio::test]
async fn test_tenants_cannot_see_each_other() {
    let h = harness().await;
    let admin = login(&h.app, "panel_admin", ADMIN_PASSWORD).await;
    create_account(&h.app, &admin, "alice", "alice.example").await;
    let bob_id = create_account(&h.app, &admin, "bob", "bob.example").await;

    let alice = login(&h.app, "alice", "Correct-Horse-9").await;
    let (status, body) = call(&h.app, Method::GET, &format!("/api/v1/accounts/{bob_id}"), Some(&alice), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    // Admin-only surface.
    let (status, _) = call(&h.app, Method::GET, "/api/v1/php/versions", Some(&alice), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_suspended_user_is_locked_out() {
    let h = harness().await;
    let admin = login(&h.app, "panel_admin", ADMIN_PASSWORD).await;
    let id = create_account(&h.app, &admin, "alice", "alice.example").await;
    let alice = login(&h.app, "alice", "Correct-Horse-9").await;

    let (status, _) = call(&h.app, Method::POST, &format!("/api/v1/accounts/{id}/suspend"), Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&h.app, Method::GET, "/api/v1/accounts", Some(&alice), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Account is suspended");
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = harness().await;
    let admin = login(&h.app, "panel_admin", ADMIN_PASSWORD).await;
    let (status, _) = call(&h.app, Method::GET, "/api/v1/tasks/does-not-exist", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_install_task_runs_to_completion() {
    let h = harness().await;
    let admin = login(&h.app, "panel_admin", ADMIN_PASSWORD).await;
    let (status, body) = call(
        &h.app,
        Method::POST,
        "/api/v1/install/start",
        Some(&admin),
        Some(json!({ "type": "php", "action": "install", "target": "8.2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let mut state = Value::Null;
    for _ in 0..50 {
        let (status, body) = call(&h.app, Method::GET, &format!("/api/v1/tasks/{task_id}"), Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        state = body["data"]["state"].clone();
        if state != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, "completed");
}
