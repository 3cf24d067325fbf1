use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use hp_core::ssl::CertificateStatus;

use crate::api::{ApiResponse, ApiResult};
use crate::auth::AuthUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct FqdnRequest {
    pub fqdn: String,
}

/// `GET /ssl`
pub async fn list(State(state): State<AppState>, AuthUser(actor): AuthUser) -> ApiResult<Vec<CertificateStatus>> {
    Ok(ApiResponse::ok(state.ssl.list(&actor).await?))
}

/// `POST /ssl/issue`
pub async fn issue(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(body): Json<FqdnRequest>,
) -> ApiResult<CertificateStatus> {
    Ok(ApiResponse::ok(state.ssl.issue(&actor, &body.fqdn).await?))
}

/// `POST /ssl/renew`
pub async fn renew(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(body): Json<FqdnRequest>,
) -> ApiResult<CertificateStatus> {
    Ok(ApiResponse::ok(state.ssl.renew(&actor, &body.fqdn).await?))
}

/// `POST /ssl/revoke`
pub async fn revoke(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(body): Json<FqdnRequest>,
) -> ApiResult<()> {
    state.ssl.revoke(&actor, &body.fqdn).await?;
    Ok(ApiResponse::ok_with_message((), format!("Certificate for {} revoked", body.fqdn)))
}
