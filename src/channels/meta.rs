//! Instagram, Facebook Messenger and WhatsApp Cloud webhook envelopes.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::types::{InboundMessage, Metadata};

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn id_at(value: &Value, key: &str) -> Option<String> {
    let field = value.get(key)?;
    match field {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Messenger-style envelope shared by Instagram and Facebook pages:
/// `entry[].messaging[]` with `sender`, `recipient` and an optional `message`.
pub fn parse_messaging(payload: &Value) -> Vec<InboundMessage> {
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for entry in entries {
        let events = entry
            .get("messaging")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for event in events {
            // Reads, reactions, deliveries and postbacks carry no message body.
            let Some(message) = event.get("message") else {
                debug!("dropping non-message messaging event");
                continue;
            };
            if message
                .get("is_deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }

            let text = str_at(message, "text").unwrap_or("").to_string();
            let attachments = message
                .get("attachments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if text.is_empty() && attachments.is_empty() {
                continue;
            }

            let mut metadata = Metadata::new();
            if !attachments.is_empty() {
                metadata.insert("attachments".into(), Value::Array(attachments));
            }
            if let Some(payload) = message
                .get("quick_reply")
                .and_then(|q| q.get("payload"))
                .cloned()
            {
                metadata.insert("quick_reply".into(), payload);
            }
            if let Some(app_id) = id_at(message, "app_id") {
                metadata.insert("app_id".into(), Value::String(app_id));
            }
            if let Some(reply_to) = message.get("reply_to").cloned() {
                metadata.insert("reply_to".into(), reply_to);
            }

            out.push(InboundMessage {
                sender_id: event.get("sender").and_then(|s| id_at(s, "id")),
                recipient_id: event.get("recipient").and_then(|r| id_at(r, "id")),
                message_text: text,
                message_id: str_at(message, "mid").map(str::to_string),
                timestamp: event
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .and_then(millis_to_utc),
                metadata,
                is_echo: message
                    .get("is_echo")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                raw_metadata: str_at(message, "metadata").map(str::to_string),
            });
        }
    }
    out
}

fn whatsapp_contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let Some(wa_id) = str_at(&contact, "wa_id").or_else(|| str_at(&contact, "input")) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| str_at(p, "name"))
            .unwrap_or("")
            .to_string();
        map.insert(wa_id.to_string(), name);
    }
    map
}

/// Text plus attachment descriptors for one WhatsApp message; `None` when there is nothing to store.
fn whatsapp_inbound_content(message: &Value) -> Option<(String, Vec<Value>)> {
    let msg_type = str_at(message, "type").unwrap_or("").to_ascii_lowercase();

    match msg_type.as_str() {
        "text" => {
            let text = message.get("text").and_then(|v| str_at(v, "body"))?;
            Some((text.to_string(), Vec::new()))
        }
        "button" => {
            let text = message.get("button").and_then(|v| str_at(v, "text"))?;
            Some((text.to_string(), Vec::new()))
        }
        "interactive" => {
            let interactive = message.get("interactive")?;
            let text = interactive
                .get("button_reply")
                .and_then(|r| str_at(r, "title"))
                .or_else(|| interactive.get("list_reply").and_then(|r| str_at(r, "title")))?;
            Some((text.to_string(), Vec::new()))
        }
        "location" => {
            let location = message.get("location").cloned().unwrap_or_else(|| json!({}));
            let name = str_at(&location, "name").unwrap_or("");
            let address = str_at(&location, "address").unwrap_or("");
            let text = if !name.is_empty() {
                format!("Shared location: {name}")
            } else if !address.is_empty() {
                format!("Shared location: {address}")
            } else {
                "Shared a location".to_string()
            };
            Some((
                text,
                vec![json!({
                    "type": "location",
                    "latitude": location.get("latitude").cloned().unwrap_or(Value::Null),
                    "longitude": location.get("longitude").cloned().unwrap_or(Value::Null),
                    "title": name,
                    "address": address,
                })],
            ))
        }
        "image" | "audio" | "video" | "document" | "sticker" => {
            let body = message.get(&msg_type).cloned().unwrap_or_else(|| json!({}));
            let caption = str_at(&body, "caption").unwrap_or("").to_string();
            let Some(media_id) = str_at(&body, "id") else {
                return Some((format!("Sent a {msg_type} message"), Vec::new()));
            };
            let attachment = json!({
                "type": msg_type,
                "media_id": media_id,
                "mime_type": str_at(&body, "mime_type").unwrap_or(""),
                "filename": str_at(&body, "filename").unwrap_or(""),
                "voice": body.get("voice").and_then(Value::as_bool).unwrap_or(false),
            });
            Some((caption, vec![attachment]))
        }
        "" | "unsupported" | "reaction" => None,
        other => Some((format!("Sent a {other} message"), Vec::new())),
    }
}

/// WhatsApp Cloud API envelope: `entry[].changes[].value.messages[]`.
/// Delivery/read `statuses` are dropped. Changes addressed to another phone number id than
/// `phone_number_id` (when given) are ignored.
pub fn parse_whatsapp(payload: &Value, phone_number_id: Option<&str>) -> Vec<InboundMessage> {
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let metadata_phone_id = value
                .get("metadata")
                .and_then(|m| id_at(m, "phone_number_id"));
            if let (Some(expected), Some(actual)) = (phone_number_id, metadata_phone_id.as_deref())
            {
                if !expected.is_empty() && expected != actual {
                    debug!("skipping whatsapp change for phone number {actual}");
                    continue;
                }
            }
            let profile_names = whatsapp_contact_profile_names(&value);

            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for message in messages {
                let Some((text, attachments)) = whatsapp_inbound_content(&message) else {
                    continue;
                };
                let from = str_at(&message, "from").map(str::to_string);

                let mut metadata = Metadata::new();
                if !attachments.is_empty() {
                    metadata.insert("attachments".into(), Value::Array(attachments));
                }
                if let Some(name) = from
                    .as_deref()
                    .and_then(|f| profile_names.get(f))
                    .filter(|n| !n.is_empty())
                {
                    metadata.insert("name".into(), Value::String(name.clone()));
                }
                if let Some(context) = message.get("context").cloned() {
                    metadata.insert("reply_to".into(), context);
                }

                out.push(InboundMessage {
                    sender_id: from,
                    recipient_id: metadata_phone_id.clone(),
                    message_text: text,
                    message_id: str_at(&message, "id").map(str::to_string),
                    timestamp: str_at(&message, "timestamp")
                        .and_then(|ts| ts.parse::<i64>().ok())
                        .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                    metadata,
                    is_echo: false,
                    raw_metadata: None,
                });
            }
        }
    }
    out
}
