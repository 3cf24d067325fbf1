use axum::extract::State;
use axum::Json;

use hp_core::mail::OutboundMessage;
use hp_services::SendOutcome;

use crate::api::{ApiResponse, ApiResult};
use crate::auth::AuthUser;
use crate::state::AppState;

/// `POST /mail/send`. Sends now, or queues when the package quota is used up.
pub async fn send(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Json(body): Json<OutboundMessage>,
) -> ApiResult<SendOutcome> {
    let outcome = state.mail.send(&actor, body).await?;
    let message = match &outcome {
        SendOutcome::Sent => "Mail sent".to_string(),
        SendOutcome::Queued { scheduled_at, .. } => format!("Send quota reached, queued until {}", scheduled_at),
    };
    Ok(ApiResponse::ok_with_message(outcome, message))
}
