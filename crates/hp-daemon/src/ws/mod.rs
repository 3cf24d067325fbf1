//! WebSocket endpoints. Both authenticate with `?token=` since browsers
//! cannot set headers on an upgrade request.

pub mod shell;
pub mod tasks;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::api::ApiError;

const CLOSE_UNAUTHORIZED: u16 = 4001;
const CLOSE_FORBIDDEN: u16 = 4003;
const CLOSE_NOT_FOUND: u16 = 4004;
const CLOSE_ERROR: u16 = 4000;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

fn close_code(status: StatusCode) -> u16 {
    match status {
        StatusCode::UNAUTHORIZED => CLOSE_UNAUTHORIZED,
        StatusCode::FORBIDDEN => CLOSE_FORBIDDEN,
        StatusCode::NOT_FOUND => CLOSE_NOT_FOUND,
        _ => CLOSE_ERROR,
    }
}

/// Tell the client why, then close.
pub(crate) async fn reject(mut socket: WebSocket, error: ApiError) {
    let frame = json!({ "type": "error", "message": error.message }).to_string();
    let _ = socket.send(Message::Text(frame.into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code(error.status),
            reason: error.message.into(),
        })))
        .await;
}
