use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use crate::instance::now_millis;
use crate::protocol::{Message, ProtocolError};

use super::AppState;

pub(super) async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

type WsSink = SplitSink<WebSocket, WsMessage>;

async fn send(ws_tx: &mut WsSink, msg: &Message) -> Result<(), axum::Error> {
    match msg.to_json() {
        Ok(json) => ws_tx.send(WsMessage::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, kind = msg.kind(), "failed to encode message");
            Ok(())
        }
    }
}

async fn close_for_shutdown(ws_tx: &mut WsSink) {
    let close_frame = CloseFrame {
        code: axum::extract::ws::close_code::AWAY,
        reason: "server shutting down".into(),
    };
    let _ = ws_tx.send(WsMessage::Close(Some(close_frame))).await;
    let _ = ws_tx.flush().await;
}

/// Serve one client socket.
///
/// Frames are read in arrival order. Host calls run as tasks so a slow
/// command does not hold up the frames behind it; their replies come back
/// through `reply_rx` and are written by this loop, which is the only
/// writer on the socket.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::info!(conn = conn_id, "websocket connection established");

    // Upgrades that race a shutdown would never see `changed()` fire.
    if *shutdown_rx.borrow_and_update() {
        close_for_shutdown(&mut ws_tx).await;
        return;
    }

    let hello = Message::InstanceInfo {
        data: state.dispatcher.instance(),
    };
    if send(&mut ws_tx, &hello).await.is_err() {
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(64);
    let mut in_flight = JoinSet::new();
    let mut devtools_rx = state.dispatcher.subscribe_devtools();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) =
                            handle_text(&state, conn_id, text.as_str(), &reply_tx, &mut in_flight)
                        {
                            if send(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(conn = conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }

            Some(reply) = reply_rx.recv() => {
                if send(&mut ws_tx, &reply).await.is_err() {
                    break;
                }
            }

            change = devtools_rx.recv() => {
                match change {
                    Ok(change) if change.origin != Some(conn_id) => {
                        let push = Message::DevtoolsState { id: None, open: change.open };
                        if send(&mut ws_tx, &push).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(conn = conn_id, skipped = n, "devtools updates lagged");
                        let push = Message::DevtoolsState {
                            id: None,
                            open: state.dispatcher.devtools_open(),
                        };
                        if send(&mut ws_tx, &push).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(conn = conn_id, "command task panicked");
                    }
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(conn = conn_id, "websocket received shutdown signal");
                    close_for_shutdown(&mut ws_tx).await;
                    break;
                }
            }
        }
    }

    in_flight.abort_all();
    tracing::info!(conn = conn_id, "websocket connection closed");
}

/// Handle one text frame. Returns an immediate reply, if any; replies to
/// host calls are delivered later through `reply_tx`.
fn handle_text(
    state: &AppState,
    conn_id: u64,
    text: &str,
    reply_tx: &mpsc::Sender<Message>,
    in_flight: &mut JoinSet<()>,
) -> Option<Message> {
    let msg = match Message::parse(text) {
        Ok(msg) => msg,
        Err(e @ ProtocolError::UnknownType(_)) => {
            tracing::debug!(conn = conn_id, error = %e, "unknown message type");
            return Some(Message::error(e.to_string()));
        }
        Err(e) => {
            tracing::debug!(conn = conn_id, error = %e, "malformed message");
            return Some(Message::error(e.to_string()));
        }
    };

    match msg {
        Message::Ping => Some(Message::Pong {
            timestamp: now_millis(),
        }),

        Message::GetInstanceInfo => Some(Message::InstanceInfo {
            data: state.dispatcher.instance(),
        }),

        Message::ExecuteCommand { id, data } => {
            let data = data.unwrap_or_default();
            let reply_id = data.id.or(id);
            let command = match data.command.filter(|c| !c.trim().is_empty()) {
                Some(command) => command,
                None => {
                    return Some(match reply_id {
                        Some(_) => Message::command_failure(reply_id, "command name is required"),
                        None => Message::error("execute_command requires data.command"),
                    });
                }
            };

            let dispatcher = state.dispatcher.clone();
            let tx = reply_tx.clone();
            in_flight.spawn(async move {
                let reply = match dispatcher.invoke(&command, data.args).await {
                    Ok(result) => Message::command_success(reply_id, result),
                    Err(e) => Message::command_failure(reply_id, e.to_string()),
                };
                let _ = tx.send(reply).await;
            });
            None
        }

        Message::ToggleDevtools { id } => {
            let dispatcher = state.dispatcher.clone();
            let tx = reply_tx.clone();
            in_flight.spawn(async move {
                let reply = match dispatcher.toggle_devtools(Some(conn_id)).await {
                    Ok(open) => Message::DevtoolsState { id, open },
                    Err(e) => Message::Error {
                        id,
                        message: format!("Failed to toggle DevTools: {}", e),
                    },
                };
                let _ = tx.send(reply).await;
            });
            None
        }

        other => Some(Message::error(format!(
            "Unsupported message type: {}",
            other.kind()
        ))),
    }
}
