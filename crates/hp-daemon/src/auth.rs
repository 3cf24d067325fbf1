//! Bearer tokens: issuing on login, checking on every request.

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hp_core::security::credentials::verify_login_password;
use hp_db::models::{Role, User};
use hp_db::queries;
use hp_services::Actor;

use crate::api::{ApiError, ApiResponse, ApiResult};
use crate::state::{AppState, JwtKeys};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub username: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(keys: &JwtKeys, user: &User) -> Result<(String, DateTime<Utc>), jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(i64::try_from(keys.ttl.as_secs()).unwrap_or(i64::MAX));
    let claims = Claims {
        sub: user.id,
        username: user.username.clone(),
        role: user.role,
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(&keys.secret))?;
    Ok((token, expires_at))
}

pub fn decode_token(keys: &JwtKeys, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(&keys.secret), &validation).map(|data| data.claims)
}

/// Resolve a token to the current state of its user. The role comes from
/// the store, not the token, and suspended accounts are refused.
pub async fn authenticate(state: &AppState, token: &str) -> Result<Actor, ApiError> {
    let claims = decode_token(&state.jwt, token).map_err(|e| {
        warn!(error = %e, "Rejected token");
        ApiError::unauthorized()
    })?;
    let user = match queries::get_user(state.db.pool(), claims.sub).await {
        Ok(user) => user,
        Err(hp_db::DbError::NotFound(_)) => return Err(ApiError::unauthorized()),
        Err(e) => return Err(e.into()),
    };
    if !user.is_active {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "Account is suspended"));
    }
    Ok(Actor::from(&user))
}

/// Any signed-in, active user.
pub struct AuthUser(pub Actor);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(ApiError::unauthorized)?;
        authenticate(state, token).await.map(AuthUser)
    }
}

/// Signed-in admin.
pub struct AdminUser(pub Actor);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser(actor) = AuthUser::from_request_parts(parts, state).await?;
        if !actor.is_admin() {
            return Err(ApiError::forbidden());
        }
        Ok(AdminUser(actor))
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

const BAD_CREDENTIALS: &str = "Invalid username or password";

/// `POST /auth/login`
pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> ApiResult<LoginResponse> {
    let user = queries::find_user_by_username(state.db.pool(), &body.username).await?;
    let Some(user) = user else {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, BAD_CREDENTIALS));
    };

    let hash = user.password_hash.clone();
    let password = body.password;
    let verified = tokio::task::spawn_blocking(move || verify_login_password(&password, &hash))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if !verified {
        warn!(username = %user.username, "Failed login");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, BAD_CREDENTIALS));
    }
    if !user.is_active {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "Account is suspended"));
    }

    let (token, expires_at) = issue_token(&state.jwt, &user).map_err(|e| ApiError::internal(e.to_string()))?;
    info!(username = %user.username, role = %user.role, "Login");
    Ok(ApiResponse::ok(LoginResponse {
        token,
        expires_at,
        user,
    }))
}
