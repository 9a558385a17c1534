//! Pushing AI and consultant replies back to the originating platform.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::channels::telegram::external_message_id;
use crate::config::AppConfig;
use crate::error::DeliveryError;
use crate::types::Channel;

#[async_trait]
pub trait ChannelDelivery: Send + Sync {
    /// `recipient_id` is the client's platform id. Returns the platform's id for the sent
    /// message, in the form the inbound adapter for `channel` would report it.
    async fn deliver(
        &self,
        channel: Channel,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<String>, DeliveryError>;
}

/// Message id from a successful send response.
pub fn sent_message_id(channel: Channel, recipient_id: &str, response: &Value) -> Option<String> {
    let id = match channel {
        Channel::Internal => None,
        Channel::Telegram => {
            let result = response.get("result")?;
            let message_id = result.get("message_id")?.as_i64()?;
            let chat_id = result
                .get("chat")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_i64)
                .or_else(|| recipient_id.trim().parse().ok())?;
            Some(external_message_id(chat_id, message_id))
        }
        Channel::Instagram | Channel::Facebook => response
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        Channel::Whatsapp => response
            .get("messages")?
            .get(0)?
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    id.filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub bearer: Option<String>,
    pub body: Value,
}

/// Telegram Bot API, Meta Send API and WhatsApp Cloud API.
pub struct PlatformDelivery {
    http: reqwest::Client,
    telegram_api_base: String,
    graph_api_base: String,
    telegram_token: Option<String>,
    instagram_token: Option<String>,
    facebook_token: Option<String>,
    whatsapp_token: Option<String>,
    whatsapp_phone_number_id: String,
}

impl PlatformDelivery {
    pub fn from_config(http: reqwest::Client, config: &AppConfig) -> Self {
        Self {
            http,
            telegram_api_base: config.telegram_api_base.clone(),
            graph_api_base: config.graph_api_base.clone(),
            telegram_token: config.telegram.access_token.clone(),
            instagram_token: config.instagram.access_token.clone(),
            facebook_token: config.facebook.access_token.clone(),
            whatsapp_token: config.whatsapp.access_token.clone(),
            whatsapp_phone_number_id: config.whatsapp.bot_id.clone(),
        }
    }

    /// `None` for the internal web channel, which the fan-out already serves.
    pub fn request_for(
        &self,
        channel: Channel,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<OutboundRequest>, DeliveryError> {
        let request = match channel {
            Channel::Internal => return Ok(None),
            Channel::Telegram => {
                let token = self
                    .telegram_token
                    .as_deref()
                    .ok_or(DeliveryError::NotConfigured("telegram"))?;
                OutboundRequest {
                    url: format!("{}/bot{}/sendMessage", self.telegram_api_base, token),
                    bearer: None,
                    body: json!({ "chat_id": recipient_id, "text": text }),
                }
            }
            Channel::Instagram | Channel::Facebook => {
                let token = if channel == Channel::Instagram {
                    self.instagram_token.as_deref()
                } else {
                    self.facebook_token.as_deref()
                };
                let token = token.ok_or(DeliveryError::NotConfigured(channel.as_str()))?;
                OutboundRequest {
                    url: format!("{}/me/messages", self.graph_api_base),
                    bearer: Some(token.to_string()),
                    body: json!({
                        "recipient": { "id": recipient_id },
                        "messaging_type": "RESPONSE",
                        "message": { "text": text }
                    }),
                }
            }
            Channel::Whatsapp => {
                let token = self
                    .whatsapp_token
                    .as_deref()
                    .ok_or(DeliveryError::NotConfigured("whatsapp"))?;
                if self.whatsapp_phone_number_id.is_empty() {
                    return Err(DeliveryError::NotConfigured("whatsapp"));
                }
                OutboundRequest {
                    url: format!(
                        "{}/{}/messages",
                        self.graph_api_base, self.whatsapp_phone_number_id
                    ),
                    bearer: Some(token.to_string()),
                    body: json!({
                        "messaging_product": "whatsapp",
                        "recipient_type": "individual",
                        "to": recipient_id,
                        "type": "text",
                        "text": { "preview_url": false, "body": text }
                    }),
                }
            }
        };
        Ok(Some(request))
    }
}

#[async_trait]
impl ChannelDelivery for PlatformDelivery {
    async fn deliver(
        &self,
        channel: Channel,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<String>, DeliveryError> {
        let Some(request) = self.request_for(channel, recipient_id, text)? else {
            return Ok(None);
        };
        let mut builder = self.http.post(&request.url).json(&request.body);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected { status, body });
        }
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(sent_message_id(channel, recipient_id, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> PlatformDelivery {
        let mut config = AppConfig::default();
        config.telegram.access_token = Some("123:abc".into());
        config.instagram.access_token = Some("ig-token".into());
        config.whatsapp.access_token = Some("wa-token".into());
        config.whatsapp.bot_id = "PN1".into();
        PlatformDelivery::from_config(reqwest::Client::new(), &config)
    }

    #[test]
    fn telegram_uses_send_message_with_token_in_path() {
        let request = delivery()
            .request_for(Channel::Telegram, "55", "Hello")
            .unwrap()
            .unwrap();
        assert_eq!(
            request.url,
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
        assert_eq!(request.body["chat_id"], "55");
        assert!(request.bearer.is_none());
    }

    #[test]
    fn meta_and_whatsapp_targets() {
        let d = delivery();
        let ig = d.request_for(Channel::Instagram, "77", "Hi").unwrap().unwrap();
        assert!(ig.url.ends_with("/me/messages"));
        assert_eq!(ig.body["recipient"]["id"], "77");
        assert_eq!(ig.bearer.as_deref(), Some("ig-token"));

        let wa = d.request_for(Channel::Whatsapp, "1555", "Hi").unwrap().unwrap();
        assert!(wa.url.ends_with("/PN1/messages"));
        assert_eq!(wa.body["to"], "1555");
        assert_eq!(wa.body["text"]["body"], "Hi");
    }

    #[test]
    fn internal_is_a_no_op_and_missing_tokens_are_reported() {
        let d = delivery();
        assert!(d.request_for(Channel::Internal, "v", "x").unwrap().is_none());
        assert!(matches!(
            d.request_for(Channel::Facebook, "1", "x"),
            Err(DeliveryError::NotConfigured("facebook"))
        ));
    }

    #[test]
    fn sent_ids_match_what_the_webhooks_report() {
        let telegram = json!({ "ok": true, "result": { "message_id": 88, "chat": { "id": 55 } } });
        assert_eq!(
            sent_message_id(Channel::Telegram, "55", &telegram).as_deref(),
            Some("55:88")
        );

        let messenger = json!({ "recipient_id": "77", "message_id": "m_abc" });
        assert_eq!(
            sent_message_id(Channel::Instagram, "77", &messenger).as_deref(),
            Some("m_abc")
        );

        let whatsapp = json!({
            "messaging_product": "whatsapp",
            "contacts": [{ "input": "1555", "wa_id": "1555" }],
            "messages": [{ "id": "wamid.X1" }]
        });
        assert_eq!(
            sent_message_id(Channel::Whatsapp, "1555", &whatsapp).as_deref(),
            Some("wamid.X1")
        );

        assert!(sent_message_id(Channel::Facebook, "1", &json!({ "message_id": "" })).is_none());
        assert!(sent_message_id(Channel::Internal, "v", &messenger).is_none());
    }
}
