use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::api::{ApiResponse, ApiResult};
use crate::auth;
use crate::handlers::{accounts, domains, install, mail, ssl};
use crate::state::AppState;
use crate::ws;

async fn health() -> ApiResult<Value> {
    Ok(ApiResponse::ok(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })))
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(auth::login))
        .route("/accounts", get(accounts::list).post(accounts::create))
        .route("/accounts/{id}", get(accounts::get).delete(accounts::delete))
        .route("/accounts/{id}/suspend", post(accounts::suspend))
        .route("/accounts/{id}/unsuspend", post(accounts::unsuspend))
        .route("/domains/{id}/php", put(domains::update_php))
        .route("/php/versions", get(install::php_versions).post(install::install_php))
        .route("/php/versions/{version}", delete(install::uninstall_php))
        .route("/install/start", post(install::start))
        .route("/tasks/{id}", get(install::task))
        .route("/mail/send", post(mail::send))
        .route("/ssl", get(ssl::list))
        .route("/ssl/issue", post(ssl::issue))
        .route("/ssl/renew", post(ssl::renew))
        .route("/ssl/revoke", post(ssl::revoke))
        .route("/ws/tasks/{task_id}", get(ws::tasks::upgrade))
        .route("/ws/shell", get(ws::shell::upgrade));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
