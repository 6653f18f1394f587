// WebSocket transport for streaming sessions.
//
// One socket = one session. The client submits over the socket and receives
// the session's chunk/complete/error events as tagged JSON messages. Closing
// the socket closes the session, cancelling any in-flight generation.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::{SessionEvent, StreamCoordinator};

/// Client-to-server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Submit {
        prompt: String,
        #[serde(rename = "system_instruction", alias = "systemInstruction")]
        system_instruction: Option<String>,
    },
}

pub async fn handle_socket(socket: WebSocket, coordinator: StreamCoordinator) {
    let mut handle = coordinator.open_session();
    let session_id = handle.id.clone();
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            message = incoming.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&coordinator, &session_id, &text) {
                            let Ok(json) = serde_json::to_string(&reply) else { continue };
                            if sink.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                }
            }
        }
    }

    coordinator.close_session(&session_id);
    tracing::debug!(session = %session_id, "socket closed");
}

/// Parse and apply one client message. A rejected submission is answered
/// with an error event without disturbing any in-flight generation.
fn handle_client_message(
    coordinator: &StreamCoordinator,
    session_id: &str,
    text: &str,
) -> Option<SessionEvent> {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Some(SessionEvent::Error {
                message: format!("malformed message: {e}"),
            })
        }
    };

    match parsed {
        ClientMessage::Submit {
            prompt,
            system_instruction,
        } => match coordinator.submit(session_id, prompt, system_instruction) {
            Ok(()) => None,
            Err(e) => Some(SessionEvent::Error {
                message: e.to_string(),
            }),
        },
    }
}
