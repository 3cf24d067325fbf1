use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use hp_db::models::User;
use hp_services::accounts::{AccountDetails, CreatedAccount};
use hp_services::{CreateAccount, DeletionReport};

use crate::api::{ApiResponse, ApiResult};
use crate::auth::AuthUser;
use crate::state::AppState;

/// `GET /accounts`
pub async fn list(State(state): State<AppState>, AuthUser(actor): AuthUser) -> ApiResult<Vec<User>> {
    Ok(ApiResponse::ok(state.accounts.list(&actor).await?))
}

/// `POST /accounts`
pub async fn create(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(body): Json<CreateAccount>,
) -> Result<(StatusCode, Json<ApiResponse<CreatedAccount>>), crate::api::ApiError> {
    let created = state.accounts.create(&actor, body).await?;
    let message = format!("Account {} created", created.user.username);
    Ok((StatusCode::CREATED, ApiResponse::ok_with_message(created, message)))
}

/// `GET /accounts/{id}`
pub async fn get(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<AccountDetails> {
    Ok(ApiResponse::ok(state.accounts.get(&actor, id).await?))
}

/// `DELETE /accounts/{id}`
pub async fn delete(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<DeletionReport> {
    let report = state.accounts.delete(&actor, id).await?;
    let message = if report.warnings.is_empty() {
        format!("Account {} deleted", report.username)
    } else {
        format!(
            "Account {} deleted with {} warning(s)",
            report.username,
            report.warnings.len()
        )
    };
    Ok(ApiResponse::ok_with_message(report, message))
}

/// `POST /accounts/{id}/suspend`
pub async fn suspend(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<User> {
    Ok(ApiResponse::ok(state.accounts.suspend(&actor, id).await?))
}

/// `POST /accounts/{id}/unsuspend`
pub async fn unsuspend(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<User> {
    Ok(ApiResponse::ok(state.accounts.unsuspend(&actor, id).await?))
}
