//! Live sockets: per-chat viewers (widget or console) and the operator feed.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::admin::operator_allowed;
use crate::app::AppState;
use crate::error::AppError;
use crate::realtime::{ClientFrame, ServerEvent, ViewerKind, ViewerTx};
use crate::types::{ChatSession, SenderRole};
use crate::widget::visitor_session;

#[derive(Debug, Default, Deserialize)]
pub struct ChatSocketQuery {
    pub viewer_id: Option<String>,
    pub role: Option<ViewerKind>,
    pub token: Option<String>,
    pub visitor_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub viewer_id: Option<String>,
    pub token: Option<String>,
}

fn viewer_id(explicit: Option<String>) -> String {
    explicit
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(chat_id): Path<String>,
    Query(query): Query<ChatSocketQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let kind = query.role.unwrap_or(ViewerKind::Client);
    let session = match kind {
        ViewerKind::Client => {
            let visitor_id = query.visitor_id.as_deref().unwrap_or_default();
            visitor_session(&state, &chat_id, visitor_id).await?
        }
        ViewerKind::Operator => {
            if !operator_allowed(state.config.admin_token.as_deref(), query.token.as_deref()) {
                return Err(AppError::Unauthorized);
            }
            state
                .service
                .store()
                .get_session(&chat_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("chat {chat_id} not found")))?
        }
    };
    let viewer_id = viewer_id(query.viewer_id);
    Ok(ws
        .on_upgrade(move |socket| handle_chat_socket(socket, state, session, viewer_id, kind))
        .into_response())
}

/// Registers the viewer, then sends it the history as stored after registration. Anything
/// appended earlier is in the history; anything later arrives live.
async fn join_chat(
    state: &AppState,
    snapshot: ChatSession,
    viewer_id: &str,
    kind: ViewerKind,
    tx: ViewerTx,
) -> ChatSession {
    let chat_id = snapshot.chat_id.clone();
    let hub = state.service.hub();
    hub.connect(&chat_id, viewer_id, kind, tx);
    let session = match state.service.store().get_session(&chat_id).await {
        Ok(Some(fresh)) => fresh,
        Ok(None) => snapshot,
        Err(err) => {
            warn!("chat {chat_id}: history reload failed: {err}");
            snapshot
        }
    };
    hub.send_to(
        &chat_id,
        viewer_id,
        &ServerEvent::History {
            chat_id: chat_id.clone(),
            manual_mode: session.manual_mode,
            messages: session.messages.clone(),
        },
    );
    session
}

async fn handle_chat_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session: ChatSession,
    viewer_id: String,
    kind: ViewerKind,
) {
    let hub = state.service.hub().clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = join_chat(&state, session, &viewer_id, kind, tx.clone()).await;
    let chat_id = session.chat_id.clone();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let sender_role = match kind {
        ViewerKind::Client => SenderRole::Client,
        ViewerKind::Operator => SenderRole::Consultant,
    };
    let mut typing = false;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            debug!("chat {chat_id}: ignoring unknown frame from {viewer_id}");
            continue;
        };

        match frame {
            ClientFrame::Typing { is_typing } => {
                typing = is_typing;
                hub.typing_indicator(&chat_id, sender_role, is_typing);
            }
            ClientFrame::NewMessage { text, message_id } => {
                if text.trim().is_empty() {
                    continue;
                }
                if typing {
                    typing = false;
                    hub.typing_indicator(&chat_id, sender_role, false);
                }
                let result = match kind {
                    ViewerKind::Client => state
                        .service
                        .submit_web_message(&session, &text, message_id)
                        .await
                        .map(|_| ()),
                    ViewerKind::Operator => state
                        .service
                        .send_consultant_message(&chat_id, &text)
                        .await
                        .map(|_| ()),
                };
                if let Err(err) = result {
                    warn!("chat {chat_id}: message from {viewer_id} not stored: {err}");
                }
            }
        }
    }

    if typing {
        hub.typing_indicator(&chat_id, sender_role, false);
    }
    hub.disconnect_socket(&chat_id, &viewer_id, &tx);
    send_task.abort();
}

pub async fn operator_feed(
    ws: WebSocketUpgrade,
    Query(query): Query<FeedQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    if !operator_allowed(state.config.admin_token.as_deref(), query.token.as_deref()) {
        return Err(AppError::Unauthorized);
    }
    let viewer_id = viewer_id(query.viewer_id);
    Ok(ws
        .on_upgrade(move |socket| handle_operator_feed(socket, state, viewer_id))
        .into_response())
}

async fn handle_operator_feed(socket: WebSocket, state: Arc<AppState>, viewer_id: String) {
    let hub = state.service.hub().clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    hub.connect_operator_feed(&viewer_id, tx.clone());

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // The feed is push-only; read until the console goes away.
    while let Some(Ok(message)) = ws_receiver.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }

    hub.disconnect_operator_feed(&viewer_id, &tx);
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::{ChatService, Collaborators};
    use crate::realtime::ConnectionHub;
    use crate::store::MemoryChatStore;
    use crate::types::{ChatMessage, Metadata};
    use serde_json::Value;

    #[tokio::test]
    async fn history_includes_messages_stored_before_the_join() {
        let service = ChatService::new(
            Arc::new(AppConfig::default()),
            Arc::new(MemoryChatStore::new()),
            Arc::new(ConnectionHub::new()),
            Collaborators::default(),
        );
        let state = AppState::new(service.clone());
        let snapshot = service
            .open_web_session("visitor-1", Metadata::new())
            .await
            .unwrap();
        // Arrives between the upgrade check and the socket joining.
        service
            .store()
            .append_message(
                &snapshot.chat_id,
                ChatMessage::new(SenderRole::Client, "hello", None, Metadata::new()),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = join_chat(&state, snapshot.clone(), "v1", ViewerKind::Client, tx).await;
        assert_eq!(session.messages.len(), 1);
        assert_eq!(service.hub().viewer_count(&snapshot.chat_id), 1);

        let history: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(history["event"], "history");
        assert_eq!(history["data"]["messages"][0]["message"], "hello");
    }
}
