use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{DeliveryState, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::warn;

use crate::{api, AppState};

/// Lifecycle of one live session: register with presence, replay the
/// offline backlog onto this session, then serve client requests until the
/// socket closes. Disconnect cancels only this session's future pushes.
pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (session_id, mut session_rx) = state.presence.connect(user_id).await;
    let mut presence_rx = state.presence.subscribe_presence();

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                targeted = session_rx.recv() => match targeted {
                    Some(event) => event,
                    None => break,
                },
                update = presence_rx.recv() => match update {
                    Ok(update) => ServerEvent::PresenceChanged {
                        user_id: update.user_id,
                        online: update.online,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    if let Err(error) = state.replay.replay_backlog(user_id, session_id).await {
        warn!(%error, user_id = user_id.0, "backlog replay failed");
    }

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let request = match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => request,
            Err(error) => {
                let reply = ServerEvent::Error(ApiError::validation(format!(
                    "malformed request: {error}"
                )));
                state
                    .presence
                    .push_to_session(user_id, session_id, &reply)
                    .await;
                continue;
            }
        };
        if let Err(error) = handle_request(&state, user_id, request).await {
            state
                .presence
                .push_to_session(user_id, session_id, &ServerEvent::Error(error))
                .await;
        }
    }

    state.presence.disconnect(user_id, session_id).await;
    send_task.abort();
}

async fn handle_request(
    state: &AppState,
    user_id: UserId,
    request: ClientRequest,
) -> Result<(), ApiError> {
    match request {
        ClientRequest::SendMessage {
            conversation_id,
            peer_user_id,
            content,
            visibility,
            reply_to,
            forwarded_from,
        } => {
            let message = api::send_message(
                &state.api,
                api::SendMessage {
                    sender: user_id,
                    conversation_id,
                    peer_user_id,
                    content,
                    visibility,
                    reply_to,
                    forwarded_from,
                },
            )
            .await?;
            state.dispatcher.dispatch(&message).await.map_err(|error| {
                ApiError::new(ErrorCode::Internal, error.to_string())
            })
        }
        ClientRequest::MarkDelivered { message_id } => {
            state
                .tracker
                .advance(message_id, user_id, DeliveryState::Delivered)
                .await?;
            Ok(())
        }
        ClientRequest::MarkRead { message_id } => {
            state
                .tracker
                .advance(message_id, user_id, DeliveryState::Read)
                .await?;
            Ok(())
        }
        ClientRequest::MarkConversationRead { conversation_id } => {
            api::ensure_conversation_member(&state.api, conversation_id, user_id).await?;
            state
                .tracker
                .mark_conversation_read(conversation_id, user_id)
                .await?;
            Ok(())
        }
    }
}
