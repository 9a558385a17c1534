//! Operator console API and its bearer-token gate.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::app::AppState;
use crate::error::AppError;
use crate::labels::{role_label, status_label, Lang};
use crate::signature::tokens_match;
use crate::status::{compute_status, ttl_remaining, SessionStatus};
use crate::store::SessionFilter;
use crate::types::{Channel, ChatMessage, ChatSession, Client};

const MAX_PAGE: usize = 200;

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

/// True when no admin token is configured or `provided` matches it.
pub fn operator_allowed(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => provided.is_some_and(|p| tokens_match(expected, p)),
    }
}

pub async fn require_operator(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = bearer_token(request.headers());
    if !operator_allowed(state.config.admin_token.as_deref(), provided.as_deref()) {
        warn!("rejected operator call to {}", request.uri().path());
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub sender_label: &'static str,
}

/// A session as the console shows it, with the derived status.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub chat_id: String,
    pub bot_id: String,
    pub company_name: String,
    pub channel: Channel,
    pub client: Client,
    pub manual_mode: bool,
    pub forced_closed: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub status_label: &'static str,
    pub ttl_remaining_secs: i64,
    pub message_count: usize,
    pub last_message: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<MessageView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_answers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constructor_chat_id: Option<String>,
}

impl SessionView {
    pub fn build(
        session: ChatSession,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
        lang: Lang,
        with_messages: bool,
    ) -> Self {
        let ttl = ttl_remaining(session.last_activity, now, timeout);
        let status = compute_status(&session, ttl);
        let last_message = session.last_message().cloned();
        let message_count = session.messages.len();
        let messages = with_messages.then(|| {
            session
                .messages
                .iter()
                .map(|m| MessageView {
                    sender_label: role_label(m.sender_role, lang),
                    message: m.clone(),
                })
                .collect()
        });
        Self {
            channel: session.channel(),
            chat_id: session.chat_id,
            bot_id: session.bot_id,
            company_name: session.company_name,
            client: session.client,
            manual_mode: session.manual_mode,
            forced_closed: session.forced_closed,
            created_at: session.created_at,
            last_activity: session.last_activity,
            status,
            status_label: status_label(status, lang),
            ttl_remaining_secs: ttl.num_seconds().max(0),
            message_count,
            last_message,
            messages,
            brief_answers: session.brief_answers,
            constructor_chat_id: session.constructor_chat_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub bot_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub lang: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LangQuery {
    pub lang: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualModeBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClosedBody {
    pub closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConsultantMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncedBody {
    pub message_ids: Vec<String>,
}

fn lang_of(code: Option<&str>) -> Lang {
    Lang::from_code(code.unwrap_or("en"))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = SessionFilter {
        bot_id: query.bot_id.filter(|b| !b.trim().is_empty()),
        limit: query.limit.unwrap_or(50).clamp(1, MAX_PAGE),
        offset: query.offset.unwrap_or(0),
    };
    let sessions = state.service.store().list_sessions(&filter).await?;
    let now = Utc::now();
    let lang = lang_of(query.lang.as_deref());
    let views = sessions
        .into_iter()
        .map(|s| SessionView::build(s, now, state.config.chat_timeout, lang, false))
        .collect::<Vec<_>>();
    Ok(Json(json!({
        "sessions": views,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

pub async fn get_session(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LangQuery>,
) -> Result<Json<SessionView>, AppError> {
    let session = state
        .service
        .store()
        .get_session(&chat_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("chat {chat_id} not found")))?;
    Ok(Json(SessionView::build(
        session,
        Utc::now(),
        state.config.chat_timeout,
        lang_of(query.lang.as_deref()),
        true,
    )))
}

pub async fn set_manual_mode(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ManualModeBody>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.service.set_manual_mode(&chat_id, body.enabled).await?;
    Ok(Json(SessionView::build(
        session,
        Utc::now(),
        state.config.chat_timeout,
        Lang::En,
        false,
    )))
}

pub async fn set_closed(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClosedBody>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.service.set_forced_closed(&chat_id, body.closed).await?;
    Ok(Json(SessionView::build(
        session,
        Utc::now(),
        state.config.chat_timeout,
        Lang::En,
        false,
    )))
}

pub async fn post_consultant_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConsultantMessageBody>,
) -> Result<Json<Value>, AppError> {
    if body.text.trim().is_empty() {
        return Err(AppError::BadRequest("text is required".into()));
    }
    let (session, message) = state
        .service
        .send_consultant_message(&chat_id, &body.text)
        .await?;
    Ok(Json(json!({
        "message": message,
        "manual_mode": session.manual_mode,
    })))
}

pub async fn mark_synced(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SyncedBody>,
) -> Result<Json<Value>, AppError> {
    let updated = state.service.store().mark_synced(&body.message_ids).await?;
    Ok(Json(json!({ "updated": updated })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, SenderRole};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn operator_gate() {
        assert!(operator_allowed(None, None));
        assert!(operator_allowed(Some("t0k"), Some("t0k")));
        assert!(!operator_allowed(Some("t0k"), Some("nope")));
        assert!(!operator_allowed(Some("t0k"), None));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer  abc ".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn session_view_carries_status_and_label() {
        let client = Client::new(Channel::Telegram, "55", Metadata::new());
        let mut session = ChatSession::new("4242", "acme", client);
        session.messages.push(ChatMessage::new(
            SenderRole::Client,
            "hello?",
            None,
            Metadata::new(),
        ));
        let now = Utc::now();
        session.last_activity = now - ChronoDuration::hours(25);

        let view = SessionView::build(
            session,
            now,
            std::time::Duration::from_secs(24 * 3600),
            Lang::Ru,
            true,
        );
        assert_eq!(view.status, SessionStatus::ClosedWithoutResponse);
        assert_eq!(view.status_label, "Закрыт без ответа");
        assert_eq!(view.ttl_remaining_secs, 0);
        let messages = view.messages.unwrap();
        assert_eq!(messages[0].sender_label, "Клиент");

        let json = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(json["sender_role"], "client");
        assert_eq!(json["message"], "hello?");
    }
}
