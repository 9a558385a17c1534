//! Platform webhook endpoints: `GET` handshake and `POST` delivery.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{info, warn};

use crate::app::AppState;
use crate::channels;
use crate::config::ChannelSettings;
use crate::error::AppError;
use crate::signature::{tokens_match, TelegramSignatureParams, META_SIGNATURE_HEADER, TELEGRAM_TOKEN_HEADER};
use crate::types::Channel;

fn external_channel(
    state: &AppState,
    name: &str,
) -> Result<(Channel, ChannelSettings), AppError> {
    let channel = Channel::parse(name)
        .filter(|c| *c != Channel::Internal)
        .ok_or_else(|| AppError::NotFound(format!("unknown channel {name}")))?;
    let settings = state
        .config
        .channel(channel)
        .filter(|s| s.is_enabled())
        .cloned()
        .ok_or(AppError::ChannelDisabled(channel.as_str()))?;
    Ok((channel, settings))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `hub.mode=subscribe` + matching `hub.verify_token` echoes `hub.challenge`.
pub fn handshake_response(settings: &ChannelSettings, params: &HashMap<String, String>) -> Response {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or_default();
    let verify_token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or_default();
    let challenge = params
        .get("hub.challenge")
        .cloned()
        .unwrap_or_default();
    let expected = settings.verify_token.as_deref().unwrap_or_default();

    if mode == "subscribe" && !challenge.is_empty() && tokens_match(expected, verify_token) {
        return (StatusCode::OK, challenge).into_response();
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

pub async fn webhook_verify(
    Path(channel): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match external_channel(&state, &channel) {
        Ok((_, settings)) => handshake_response(&settings, &params),
        Err(err) => err.into_response(),
    }
}

pub async fn webhook_event(
    Path(channel): Path<String>,
    Query(params): Query<TelegramSignatureParams>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let (channel, settings) = external_channel(&state, &channel)?;

    let decoded = if channel == Channel::Telegram {
        channels::decode_telegram(
            &settings,
            header(&headers, TELEGRAM_TOKEN_HEADER),
            &params,
            &body,
        )
    } else {
        channels::decode_meta(
            channel,
            &settings,
            header(&headers, META_SIGNATURE_HEADER),
            &body,
        )
    };
    let messages = decoded.inspect_err(|err| warn!("{channel} webhook rejected: {err}"))?;

    let count = messages.len();
    let report = state.service.ingest_batch(channel, messages).await;
    info!(
        "{channel} webhook: {count} events, {} accepted, {} skipped, {} failed",
        report.accepted, report.skipped, report.failed
    );
    if report.failed > 0 {
        // Let the platform redeliver; stored events are deduplicated on the retry.
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to store some events" })),
        )
            .into_response());
    }
    Ok(Json(json!({ "received": true })).into_response())
}
