//! Transport authenticity checks for inbound webhooks.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AdapterError;

type HmacSha256 = Hmac<Sha256>;

pub const META_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const TELEGRAM_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

const TOKEN_PROBE: &[u8] = b"omnichat-token-compare";

fn hmac_hex(key: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn verify_hex(key: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(signature_bytes) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Checks a Meta `X-Hub-Signature-256: sha256=<hex>` header against the raw body.
pub fn verify_meta_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> Result<(), AdapterError> {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return Err(AdapterError::MissingSignature);
    }
    if app_secret.is_empty() || !verify_hex(app_secret, body, signature) {
        return Err(AdapterError::BadSignature);
    }
    Ok(())
}

/// Constant-time equality for shared tokens: both sides are MAC'd under their own key
/// and the tags compared with `verify_slice`.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let Ok(mut expected_mac) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    expected_mac.update(TOKEN_PROBE);
    let expected_tag = expected_mac.finalize().into_bytes();

    let Ok(mut provided_mac) = HmacSha256::new_from_slice(provided.as_bytes()) else {
        return false;
    };
    provided_mac.update(TOKEN_PROBE);
    provided_mac.verify_slice(&expected_tag).is_ok()
}

/// Query parameters Telegram calls carry next to the secret header.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TelegramSignatureParams {
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

pub fn telegram_signature(bot_token: &str, user_id: &str, timestamp: &str) -> Option<String> {
    hmac_hex(bot_token, format!("{user_id}|{timestamp}").as_bytes())
}

/// Both the secret header and the `user_id|timestamp` signature must pass.
pub fn verify_telegram_call(
    bot_token: &str,
    header_token: Option<&str>,
    params: &TelegramSignatureParams,
) -> Result<(), AdapterError> {
    let header_token = header_token.map(str::trim).unwrap_or("");
    if header_token.is_empty() {
        return Err(AdapterError::MissingSignature);
    }
    if !tokens_match(bot_token, header_token) {
        return Err(AdapterError::BadToken);
    }

    let (Some(user_id), Some(timestamp), Some(signature)) = (
        params.user_id.as_deref(),
        params.timestamp.as_deref(),
        params.signature.as_deref(),
    ) else {
        return Err(AdapterError::MissingSignature);
    };
    let payload = format!("{user_id}|{timestamp}");
    if !verify_hex(bot_token, payload.as_bytes(), signature) {
        return Err(AdapterError::BadSignature);
    }
    Ok(())
}

/// Header value a Meta platform would send for `body`; used by tests and replay tooling.
pub fn meta_signature_header(app_secret: &str, body: &[u8]) -> Option<String> {
    hmac_hex(app_secret, body).map(|hex| format!("sha256={hex}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_signature_accepts_valid_digest() {
        let body = br#"{"object":"instagram"}"#;
        let header = meta_signature_header("app-secret", body).unwrap();
        assert!(verify_meta_signature("app-secret", Some(&header), body).is_ok());
    }

    #[test]
    fn meta_signature_fails_closed() {
        let body = br#"{"object":"page"}"#;
        assert!(matches!(
            verify_meta_signature("app-secret", None, body),
            Err(AdapterError::MissingSignature)
        ));
        assert!(matches!(
            verify_meta_signature("app-secret", Some("sha256=deadbeef"), body),
            Err(AdapterError::BadSignature)
        ));
        assert!(matches!(
            verify_meta_signature("app-secret", Some("sha256=not-hex"), body),
            Err(AdapterError::BadSignature)
        ));

        let header = meta_signature_header("other-secret", body).unwrap();
        assert!(matches!(
            verify_meta_signature("app-secret", Some(&header), body),
            Err(AdapterError::BadSignature)
        ));
    }

    #[test]
    fn meta_signature_rejects_tampered_body() {
        let header = meta_signature_header("app-secret", b"original").unwrap();
        assert!(verify_meta_signature("app-secret", Some(&header), b"tampered").is_err());
    }

    #[test]
    fn tokens_match_is_exact() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", ""));
        assert!(!tokens_match("", ""));
    }

    #[test]
    fn telegram_call_needs_header_and_signature() {
        let token = "123:secret";
        let sig = telegram_signature(token, "55", "1700000000").unwrap();
        let params = TelegramSignatureParams {
            user_id: Some("55".into()),
            timestamp: Some("1700000000".into()),
            signature: Some(sig.clone()),
        };
        assert!(verify_telegram_call(token, Some(token), &params).is_ok());

        assert!(matches!(
            verify_telegram_call(token, None, &params),
            Err(AdapterError::MissingSignature)
        ));
        assert!(matches!(
            verify_telegram_call(token, Some("123:wrong"), &params),
            Err(AdapterError::BadToken)
        ));

        let forged = TelegramSignatureParams {
            user_id: Some("56".into()),
            ..params.clone()
        };
        assert!(matches!(
            verify_telegram_call(token, Some(token), &forged),
            Err(AdapterError::BadSignature)
        ));

        let unsigned = TelegramSignatureParams {
            signature: None,
            ..params
        };
        assert!(matches!(
            verify_telegram_call(token, Some(token), &unsigned),
            Err(AdapterError::MissingSignature)
        ));
    }
}
