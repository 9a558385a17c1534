//! REST endpoints for the embedded web chat widget.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::AppError;
use crate::pipeline::IngestOutcome;
use crate::types::{anonymous_visitor_id, Channel, ChatSession, Metadata};

#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionBody {
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
pub struct WidgetMessageBody {
    pub visitor_id: String,
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Explicit visitor id if the widget has one, else a hash of IP and user agent.
pub fn visitor_id_for(headers: &HeaderMap, explicit: Option<&str>) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    anonymous_visitor_id(&client_ip(headers), user_agent)
}

/// Loads an internal-channel chat and checks that `visitor_id` owns it.
pub async fn visitor_session(
    state: &AppState,
    chat_id: &str,
    visitor_id: &str,
) -> Result<ChatSession, AppError> {
    let session = state
        .service
        .store()
        .get_session(chat_id)
        .await?
        .filter(|s| s.channel() == Channel::Internal)
        .ok_or_else(|| AppError::NotFound(format!("chat {chat_id} not found")))?;
    if session.client.external_id != visitor_id.trim() {
        return Err(AppError::Unauthorized);
    }
    Ok(session)
}

pub async fn open_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body = if body.is_empty() {
        OpenSessionBody::default()
    } else {
        serde_json::from_slice::<OpenSessionBody>(&body)
            .map_err(|err| AppError::BadRequest(format!("invalid body: {err}")))?
    };
    let visitor_id = visitor_id_for(&headers, body.visitor_id.as_deref());
    let session = state
        .service
        .open_web_session(&visitor_id, body.metadata)
        .await?;
    Ok(Json(json!({
        "chat_id": session.chat_id,
        "visitor_id": visitor_id,
        "manual_mode": session.manual_mode,
        "messages": session.messages,
    })))
}

pub async fn post_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<WidgetMessageBody>,
) -> Result<Json<Value>, AppError> {
    if body.text.trim().is_empty() {
        return Err(AppError::BadRequest("text is required".into()));
    }
    let session = visitor_session(&state, &chat_id, &body.visitor_id).await?;
    let outcome = state
        .service
        .submit_web_message(&session, &body.text, body.message_id)
        .await?;
    Ok(Json(match outcome {
        IngestOutcome::Accepted(dispatch) => json!({
            "received": true,
            "message": dispatch.session.message(&dispatch.message_id),
            "rate_limited": dispatch.rate_limited,
        }),
        IngestOutcome::Skipped(reason) => json!({
            "received": true,
            "skipped": format!("{reason:?}"),
        }),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_id_prefers_explicit_value() {
        let headers = HeaderMap::new();
        assert_eq!(visitor_id_for(&headers, Some(" v-1 ")), "v-1");
    }

    #[test]
    fn anonymous_visitor_id_uses_forwarded_ip_and_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 172.16.0.1".parse().unwrap());
        headers.insert("user-agent", "Mozilla/5.0".parse().unwrap());
        assert_eq!(
            visitor_id_for(&headers, None),
            anonymous_visitor_id("10.0.0.1", "Mozilla/5.0")
        );
        assert_eq!(visitor_id_for(&headers, Some("  ")), visitor_id_for(&headers, None));
    }
}
