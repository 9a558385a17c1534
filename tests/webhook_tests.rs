mod common;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use serde_json::json;

use common::*;
use omnichat_server::app::AppState;
use omnichat_server::signature::{
    meta_signature_header, telegram_signature, TelegramSignatureParams, META_SIGNATURE_HEADER,
    TELEGRAM_TOKEN_HEADER,
};
use omnichat_server::store::SessionFilter;
use omnichat_server::types::SenderRole;
use omnichat_server::webhooks::{webhook_event, webhook_verify};

fn state(h: &Harness) -> Arc<AppState> {
    AppState::new(h.service.clone())
}

fn signed_meta(body: &str, secret: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        META_SIGNATURE_HEADER,
        meta_signature_header(secret, body.as_bytes())
            .unwrap()
            .parse()
            .unwrap(),
    );
    headers
}

async fn post(
    state: Arc<AppState>,
    channel: &str,
    params: TelegramSignatureParams,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    match webhook_event(
        Path(channel.to_string()),
        Query(params),
        State(state),
        headers,
        Bytes::from(body),
    )
    .await
    {
        Ok(response) => response.status(),
        Err(err) => err.status(),
    }
}

#[tokio::test]
async fn malformed_event_does_not_fail_the_batch() {
    let h = harness(test_config(), None);
    let body = json!({
        "object": "instagram",
        "entry": [{
            "id": INSTAGRAM_ACCOUNT,
            "messaging": [
                {
                    "recipient": { "id": INSTAGRAM_ACCOUNT },
                    "timestamp": 1_700_000_000_000i64,
                    "message": { "mid": "m-broken", "text": "who am I?" }
                },
                {
                    "sender": { "id": "999" },
                    "recipient": { "id": INSTAGRAM_ACCOUNT },
                    "timestamp": 1_700_000_000_500i64,
                    "message": { "mid": "m-ok", "text": "Hello" }
                }
            ]
        }]
    })
    .to_string();

    let status = post(
        state(&h),
        "instagram",
        TelegramSignatureParams::default(),
        signed_meta(&body, INSTAGRAM_SECRET),
        body,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let sessions = h
        .service
        .store()
        .list_sessions(&SessionFilter::default())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].client.external_id, "999");
    assert_eq!(sessions[0].messages.len(), 1);
    assert_eq!(sessions[0].messages[0].external_id.as_deref(), Some("m-ok"));
    assert_eq!(sessions[0].messages[0].sender_role, SenderRole::Client);
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let h = harness(test_config(), None);
    let body = json!({ "entry": [] }).to_string();

    let status = post(
        state(&h),
        "instagram",
        TelegramSignatureParams::default(),
        signed_meta(&body, "some-other-secret"),
        body.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let status = post(
        state(&h),
        "instagram",
        TelegramSignatureParams::default(),
        HeaderMap::new(),
        body,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_or_unconfigured_channels_are_not_found() {
    let h = harness(test_config(), None);
    let body = json!({ "entry": [] }).to_string();

    for channel in ["viber", "internal", "whatsapp"] {
        let status = post(
            state(&h),
            channel,
            TelegramSignatureParams::default(),
            HeaderMap::new(),
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{channel}");
    }
}

#[tokio::test]
async fn signed_telegram_update_is_stored() {
    let h = harness(test_config(), None);
    let body = telegram_update(55, 123, "Hi").to_string();
    let params = TelegramSignatureParams {
        user_id: Some("55".into()),
        timestamp: Some("1700000000".into()),
        signature: telegram_signature(TELEGRAM_TOKEN, "55", "1700000000"),
    };
    let mut headers = HeaderMap::new();
    headers.insert(TELEGRAM_TOKEN_HEADER, TELEGRAM_TOKEN.parse().unwrap());

    let status = post(state(&h), "telegram", params.clone(), headers.clone(), body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    // Redelivery is acknowledged and ignored.
    let status = post(state(&h), "telegram", params.clone(), headers.clone(), body.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let sessions = h
        .service
        .store()
        .list_sessions(&SessionFilter::default())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].messages.len(), 1);

    // A signature for someone else does not cover this update.
    let forged = TelegramSignatureParams {
        user_id: Some("66".into()),
        timestamp: Some("1700000000".into()),
        signature: telegram_signature(TELEGRAM_TOKEN, "66", "1700000000"),
    };
    let other = telegram_update(55, 124, "again").to_string();
    let status = post(state(&h), "telegram", forged, headers, other).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn handshake_echoes_the_challenge() {
    let h = harness(test_config(), None);
    let mut params = HashMap::new();
    params.insert("hub.mode".to_string(), "subscribe".to_string());
    params.insert("hub.verify_token".to_string(), "verify-me".to_string());
    params.insert("hub.challenge".to_string(), "1158201444".to_string());

    let response = webhook_verify(
        Path("instagram".to_string()),
        Query(params.clone()),
        State(state(&h)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    params.insert("hub.verify_token".to_string(), "wrong".to_string());
    let response = webhook_verify(Path("instagram".to_string()), Query(params), State(state(&h))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
