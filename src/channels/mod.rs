//! Channel adapters: authenticate a transport call and normalize it into `InboundMessage`s.
//! No persistence happens here.

pub mod meta;
pub mod telegram;
pub mod web;

use serde_json::Value;

use crate::config::ChannelSettings;
use crate::error::AdapterError;
use crate::signature::{verify_meta_signature, verify_telegram_call, TelegramSignatureParams};
use crate::types::{Channel, InboundMessage};

/// Verifies and decodes a Meta-family webhook body.
pub fn decode_meta(
    channel: Channel,
    settings: &ChannelSettings,
    signature_header: Option<&str>,
    body: &[u8],
) -> Result<Vec<InboundMessage>, AdapterError> {
    verify_meta_signature(&settings.app_secret, signature_header, body)?;
    let payload = serde_json::from_slice::<Value>(body)
        .map_err(|err| AdapterError::MalformedPayload(err.to_string()))?;
    Ok(match channel {
        Channel::Whatsapp => meta::parse_whatsapp(&payload, Some(settings.bot_id.as_str())),
        _ => meta::parse_messaging(&payload),
    })
}

/// Verifies and decodes a Telegram webhook body. The signed `user_id` must be the update's author.
pub fn decode_telegram(
    settings: &ChannelSettings,
    header_token: Option<&str>,
    params: &TelegramSignatureParams,
    body: &[u8],
) -> Result<Vec<InboundMessage>, AdapterError> {
    verify_telegram_call(&settings.app_secret, header_token, params)?;
    let update = serde_json::from_slice::<telegram::TelegramUpdate>(body)
        .map_err(|err| AdapterError::MalformedPayload(err.to_string()))?;
    let messages = telegram::parse_update(&update, &settings.bot_id);
    if let Some(signed_user) = params.user_id.as_deref() {
        if messages
            .iter()
            .any(|m| m.sender_id.as_deref().is_some_and(|s| s != signed_user))
        {
            return Err(AdapterError::BadSignature);
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{meta_signature_header, telegram_signature};
    use serde_json::json;

    fn settings(secret: &str, bot_id: &str) -> ChannelSettings {
        ChannelSettings {
            app_secret: secret.into(),
            bot_id: bot_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn decode_meta_rejects_unsigned_body() {
        let body = json!({ "entry": [] }).to_string();
        let err = decode_meta(
            Channel::Instagram,
            &settings("s", "ig-1"),
            None,
            body.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::MissingSignature));
    }

    #[test]
    fn decode_meta_signed_garbage_is_malformed() {
        let body = b"not json";
        let header = meta_signature_header("s", body).unwrap();
        let err = decode_meta(Channel::Facebook, &settings("s", "p"), Some(&header), body)
            .unwrap_err();
        assert!(matches!(err, AdapterError::MalformedPayload(_)));
    }

    #[test]
    fn decode_telegram_binds_signature_to_author() {
        let token = "4242:secret";
        let body = json!({
            "update_id": 1,
            "message": { "message_id": 5, "date": 0, "chat": { "id": 55 }, "from": { "id": 55, "first_name": "A" }, "text": "hi" }
        })
        .to_string();
        let signed_for = |user: &str| TelegramSignatureParams {
            user_id: Some(user.into()),
            timestamp: Some("1".into()),
            signature: telegram_signature(token, user, "1"),
        };

        let ok = decode_telegram(
            &settings(token, "4242"),
            Some(token),
            &signed_for("55"),
            body.as_bytes(),
        )
        .unwrap();
        assert_eq!(ok.len(), 1);

        let err = decode_telegram(
            &settings(token, "4242"),
            Some(token),
            &signed_for("56"),
            body.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::BadSignature));
    }
}
