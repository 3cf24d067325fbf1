//! `GET /ws/tasks/{task_id}?token=`: replay a task's log, then follow it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::debug;

use hp_actors::tasks::parse_status_line;
use hp_actors::{TaskError, TaskRegistry, TaskState};

use super::{reject, TokenQuery};
use crate::api::ApiError;
use crate::auth::authenticate;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskFrame<'a> {
    Log { data: &'a str },
    Status { status: TaskState },
}

impl TaskFrame<'_> {
    fn message(&self) -> Message {
        Message::Text(serde_json::to_string(self).unwrap_or_default().into())
    }
}

pub async fn upgrade(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = match authenticate(&state, &query.token).await {
        Ok(actor) if actor.is_admin() => Ok(actor),
        Ok(_) => Err(ApiError::forbidden()),
        Err(e) => Err(e),
    };
    ws.on_upgrade(move |socket| async move {
        match auth {
            Ok(_) => follow(socket, state.tasks, task_id).await,
            Err(e) => reject(socket, e).await,
        }
    })
}

async fn follow(socket: WebSocket, registry: TaskRegistry, task_id: String) {
    let subscription = match registry.subscribe(&task_id) {
        Ok(subscription) => subscription,
        Err(TaskError::NotFound(_)) => {
            reject(socket, ApiError::new(axum::http::StatusCode::NOT_FOUND, "Task not found")).await;
            return;
        }
        Err(e) => {
            reject(socket, ApiError::internal(e.to_string())).await;
            return;
        }
    };
    let subscriber_id = subscription.subscriber_id;
    let mut lines = subscription.receiver;
    let (mut sink, mut inbound) = socket.split();

    let mut open = true;
    for line in &subscription.backlog {
        if sink.send(TaskFrame::Log { data: line }.message()).await.is_err() {
            open = false;
            break;
        }
    }
    if open && subscription.state.is_terminal() {
        let _ = sink
            .send(TaskFrame::Status { status: subscription.state }.message())
            .await;
        open = false;
    }

    while open {
        tokio::select! {
            line = lines.recv() => {
                let frame_state = match &line {
                    Some(line) => parse_status_line(line),
                    // Released without a sentinel reaching us; report what the table says.
                    None => Some(registry.get(&task_id).map(|t| t.state).unwrap_or(TaskState::Failed)),
                };
                let sent = match (&line, frame_state) {
                    (_, Some(status)) => {
                        let _ = sink.send(TaskFrame::Status { status }.message()).await;
                        open = false;
                        Ok(())
                    }
                    (Some(line), None) => sink.send(TaskFrame::Log { data: line }.message()).await,
                    (None, None) => Ok(()),
                };
                if sent.is_err() {
                    open = false;
                }
            }
            inbound_frame = inbound.next() => match inbound_frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => open = false,
                // Anything else only proves the client is alive.
                Some(Ok(_)) => {}
            }
        }
    }

    registry.unsubscribe(&task_id, subscriber_id);
    let _ = sink.send(Message::Close(None)).await;
    debug!(task_id = %task_id, "Task stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_tagged() {
        let log = serde_json::to_value(TaskFrame::Log { data: "[10:00:00] apt-get update" }).unwrap();
        assert_eq!(log, serde_json::json!({"type": "log", "data": "[10:00:00] apt-get update"}));
        let status = serde_json::to_value(TaskFrame::Status { status: TaskState::Completed }).unwrap();
        assert_eq!(status["type"], "status");
    }
}
