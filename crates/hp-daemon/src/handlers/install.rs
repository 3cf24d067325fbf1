use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use hp_actors::TaskSnapshot;
use hp_core::install::InstallRequest;
use hp_services::{PhpVersions, TaskStarted};

use crate::api::{ApiResponse, ApiResult};
use crate::auth::AdminUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PhpVersionRequest {
    pub version: String,
}

/// `POST /install/start`
pub async fn start(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    Json(body): Json<InstallRequest>,
) -> ApiResult<TaskStarted> {
    Ok(ApiResponse::ok(state.install.start(&actor, &body)?))
}

/// `GET /tasks/{id}`
pub async fn task(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<TaskSnapshot> {
    Ok(ApiResponse::ok(state.install.task(&actor, &id)?))
}

/// `GET /php/versions`
pub async fn php_versions(State(state): State<AppState>, AdminUser(_): AdminUser) -> ApiResult<PhpVersions> {
    Ok(ApiResponse::ok(state.install.php_versions()?))
}

/// `POST /php/versions`
pub async fn install_php(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    Json(body): Json<PhpVersionRequest>,
) -> ApiResult<TaskStarted> {
    Ok(ApiResponse::ok(state.install.install_php(&actor, &body.version)?))
}

/// `DELETE /php/versions/{version}`
pub async fn uninstall_php(
    State(state): State<AppState>,
    AdminUser(actor): AdminUser,
    Path(version): Path<String>,
) -> ApiResult<TaskStarted> {
    Ok(ApiResponse::ok(state.install.uninstall_php(&actor, &version)?))
}
