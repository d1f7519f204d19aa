//! WebSocket session transport
//!
//! Clients connect with their session token in the query string; the token
//! is verified before the upgrade, so an unauthenticated connection never
//! touches routing state. After the upgrade the client drives room
//! membership with JSON commands and receives every event routed to the
//! conversations it has joined:
//!
//! - `{"action": "join-conversation", "conversation": "<raw id>"}`
//! - `{"action": "leave-conversation", "conversation": "<raw id>"}`
//!
//! Both are acknowledged with `{"event", "ok", "conversation"}` where
//! `conversation` is the canonical identifier. Routed events arrive as
//! `{"event": <data type>, "data": <envelope>}`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use convrelay_core::auth::Claims;
use convrelay_core::models::generate_id;

use crate::http::{AppError, AppState};

/// Query parameters for the WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session token obtained from `/register`
    pub token: Option<String>,
}

/// Commands a connected client may send
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum ClientCommand {
    JoinConversation { conversation: String },
    LeaveConversation { conversation: String },
}

/// Acknowledgment for a join/leave command
#[derive(Debug, Serialize)]
struct AckFrame<'a> {
    event: &'a str,
    ok: bool,
    conversation: &'a str,
}

/// WebSocket handler for conversation sessions
///
/// Clients should provide the session token via query parameter:
/// `ws://host/ws?token={session_token}`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::unauthorized("Missing token query parameter"))?;

    // Reject before upgrade; no registry state is touched for a bad token
    let claims = state
        .tokens
        .verify(&token)
        .map_err(|e| AppError::unauthorized(format!("Invalid token: {e}")))?;

    // Limit max message size to 64KB (commands are tiny)
    Ok(ws
        .max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state, claims)))
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let connection_id = generate_id();

    info!(
        connection_id = %connection_id,
        user = %claims.user,
        "WebSocket session established"
    );

    // Register with the room hub before any command can arrive
    let mut event_rx = state.hub.register(connection_id.clone());

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Acknowledgments ride the same outbound task as routed events so frame
    // order on the socket is deterministic
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let frame = serde_json::json!({
                        "event": event.data_type,
                        "data": event,
                    });
                    match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Failed to encode routed event frame");
                            continue;
                        }
                    }
                }
                ack = ack_rx.recv() => {
                    let Some(ack) = ack else { break };
                    ack
                }
            };

            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_command(&state, &connection_id, &text, &ack_tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Ignore binary, ping and pong frames
            }
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
        }
    }

    // Socket gone, whether gracefully or not: release everything the
    // connection owned
    if let Err(e) = state.ownership.disconnect(&connection_id).await {
        error!(
            connection_id = %connection_id,
            error = %e,
            "Disconnect cleanup failed"
        );
    }

    send_task.abort();

    info!(connection_id = %connection_id, "WebSocket session closed");
}

async fn handle_command(
    state: &AppState,
    connection_id: &str,
    text: &str,
    ack_tx: &mpsc::UnboundedSender<String>,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            warn!(
                connection_id = %connection_id,
                error = %e,
                "Unrecognized client command, ignoring"
            );
            return;
        }
    };

    match command {
        ClientCommand::JoinConversation { conversation } => {
            match state.ownership.join(connection_id, &conversation).await {
                Ok(canonical) => {
                    send_ack(ack_tx, "join-conversation", true, canonical.as_str());
                }
                Err(e) => {
                    error!(
                        connection_id = %connection_id,
                        conversation = %conversation,
                        error = %e,
                        "Join failed"
                    );
                    send_ack(ack_tx, "join-conversation", false, &conversation);
                }
            }
        }
        ClientCommand::LeaveConversation { conversation } => {
            match state.ownership.leave(connection_id, &conversation).await {
                Ok(canonical) => {
                    send_ack(ack_tx, "leave-conversation", true, canonical.as_str());
                }
                Err(e) => {
                    error!(
                        connection_id = %connection_id,
                        conversation = %conversation,
                        error = %e,
                        "Leave failed"
                    );
                    send_ack(ack_tx, "leave-conversation", false, &conversation);
                }
            }
        }
    }
}

fn send_ack(ack_tx: &mpsc::UnboundedSender<String>, event: &str, ok: bool, conversation: &str) {
    let frame = AckFrame {
        event,
        ok,
        conversation,
    };
    match serde_json::to_string(&frame) {
        Ok(text) => {
            // A send failure means the socket task already exited
            let _ = ack_tx.send(text);
        }
        Err(e) => error!(error = %e, "Failed to encode ack frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_command() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"action": "join-conversation", "conversation": "projects/p/locations/global/conversations/c1"}"#,
        )
        .unwrap();

        assert!(matches!(
            command,
            ClientCommand::JoinConversation { conversation }
                if conversation == "projects/p/locations/global/conversations/c1"
        ));
    }

    #[test]
    fn test_parse_leave_command() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"action": "leave-conversation", "conversation": "projects/p/conversations/c1"}"#,
        )
        .unwrap();

        assert!(matches!(command, ClientCommand::LeaveConversation { .. }));
    }

    #[test]
    fn test_unknown_action_fails_to_parse() {
        let result = serde_json::from_str::<ClientCommand>(
            r#"{"action": "self-destruct", "conversation": "c1"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ack_frame_shape() {
        let frame = AckFrame {
            event: "join-conversation",
            ok: true,
            conversation: "projects/p/conversations/c1",
        };

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "join-conversation");
        assert_eq!(json["ok"], true);
        assert_eq!(json["conversation"], "projects/p/conversations/c1");
    }
}
