use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use warden_core::agents::{AgentRegistry, Frame, SessionHandle};
use warden_core::models::CoreErrorKind;

use crate::{auth::bearer_token, error::ApiError, state::AppState};

/// Upgrades an agent connection. The session token is checked before the
/// upgrade so a bad credential never gets a socket.
pub async fn open_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| {
        ApiError::Unauthorized("agent channel requires a bearer session token".to_string())
    })?;
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let handle = state.registry.connect(token)?;
    let registry = state.registry.clone();
    Ok(upgrade.on_upgrade(move |socket| serve_session(socket, registry, handle)))
}

async fn serve_session(socket: WebSocket, registry: AgentRegistry, handle: SessionHandle) {
    let SessionHandle {
        session_id,
        agent_identity,
        mut outbound,
        ..
    } = handle;
    let (mut sink, mut stream) = socket.split();

    let hello = Frame::server_hello(
        &session_id,
        registry.heartbeat_interval().as_millis() as u64,
    );
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut pending = Some(hello);
        loop {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => match outbound.recv().await {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(session_id = %writer_session, message = %error.message, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut reason = "channel closed by agent".to_string();
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                reason = "binary frames are not part of the protocol".to_string();
                break;
            }
            Ok(_) => continue,
            Err(error) => {
                reason = format!("transport error: {error}");
                break;
            }
        };

        let frame = match Frame::parse(text.as_str()) {
            Ok(frame) => frame,
            Err(error) => {
                reason = error.message;
                break;
            }
        };

        if let Err(error) = registry.receive(&session_id, frame) {
            match error.kind {
                CoreErrorKind::ProtocolViolation
                | CoreErrorKind::Unauthorized
                | CoreErrorKind::SessionLost
                | CoreErrorKind::NotFound => {
                    reason = error.message;
                    break;
                }
                _ => tracing::warn!(
                    session_id = %session_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "inbound frame rejected"
                ),
            }
        }
    }

    registry.disconnect(&session_id, &reason);
    let _ = writer.await;
    tracing::debug!(session_id = %session_id, agent = %agent_identity, "agent channel finished");
}
