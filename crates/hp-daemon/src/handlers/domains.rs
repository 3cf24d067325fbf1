use axum::extract::{Path, State};
use axum::Json;

use hp_core::php::IniOverrides;

use crate::api::{ApiResponse, ApiResult};
use crate::auth::AuthUser;
use crate::state::AppState;

/// `PUT /domains/{id}/php`. Returns the overrides actually written, which
/// may be lower than requested.
pub async fn update_php(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<IniOverrides>,
) -> ApiResult<IniOverrides> {
    let written = state.php.update_domain_ini(&actor, id, &body).await?;
    Ok(ApiResponse::ok(written))
}
