//! `GET /ws/shell?token=`: a PTY bridged to binary frames.

use std::io::Read;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hp_core::exec::pty::{is_control_frame, parse_resize};
use hp_services::{Actor, ShellService};

use super::reject;
use crate::api::ApiError;
use crate::auth::authenticate;
use crate::state::AppState;

const READ_CHUNK: usize = 4096;
const OUTPUT_BUFFER: usize = 64;

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

#[derive(Debug, Deserialize)]
pub struct ShellQuery {
    pub token: String,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

pub async fn upgrade(State(state): State<AppState>, Query(query): Query<ShellQuery>, ws: WebSocketUpgrade) -> Response {
    let auth = authenticate(&state, &query.token).await;
    ws.on_upgrade(move |socket| async move {
        match auth {
            Ok(actor) => bridge(socket, state.shell, actor, query.rows, query.cols).await,
            Err(e) => reject(socket, e).await,
        }
    })
}

async fn bridge(socket: WebSocket, service: ShellService, actor: Actor, rows: u16, cols: u16) {
    let shell = match service.open(&actor, rows, cols).await {
        Ok(shell) => shell,
        Err(e) => {
            reject(socket, ApiError::from(e)).await;
            return;
        }
    };
    let (reader, writer) = match (shell.pty().reader(), shell.pty().writer()) {
        (Ok(reader), Ok(writer)) => (reader, writer),
        (Err(e), _) | (_, Err(e)) => {
            reject(socket, ApiError::internal(e.to_string())).await;
            return;
        }
    };
    let mut writer = tokio::fs::File::from_std(writer);

    // The master fd only offers blocking reads; pump it from a blocking thread.
    let (output_tx, mut output) = mpsc::channel::<Vec<u8>>(OUTPUT_BUFFER);
    let pump = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (mut sink, mut inbound) = socket.split();
    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(bytes) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = inbound.next() => {
                let data: Vec<u8> = match frame {
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                };
                if is_control_frame(&data) {
                    if let Some((rows, cols)) = parse_resize(&data) {
                        if let Err(e) = shell.pty().resize(rows, cols) {
                            warn!(session = shell.id(), error = %e, "Resize failed");
                        }
                    }
                    continue;
                }
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    }

    let session = shell.id();
    // Kills the process group and deregisters; the pump then hits EOF.
    drop(shell);
    let _ = sink.send(Message::Close(None)).await;
    let _ = pump.await;
    debug!(session, "Shell bridge closed");
}
