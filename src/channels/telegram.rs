//! Telegram Bot API updates.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::types::{InboundMessage, Metadata};

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    pub date: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Option<Vec<TelegramFile>>,
    pub document: Option<TelegramFile>,
    pub voice: Option<TelegramFile>,
    pub video: Option<TelegramFile>,
    pub audio: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub chat_type: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub language_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

/// Telegram message ids are only unique inside one chat, so the native id is qualified
/// with the chat id: message 123 in chat 55 is stored as `"55:123"`, not `"123"`. A bare id
/// would make the redelivery guard drop real messages from other chats that happen to share
/// it.
pub fn external_message_id(chat_id: i64, message_id: i64) -> String {
    format!("{chat_id}:{message_id}")
}

fn attachments(message: &TelegramMessage) -> Vec<Value> {
    let mut out = Vec::new();
    // Photos arrive as several sizes; the last one is the largest.
    if let Some(photo) = message.photo.as_ref().and_then(|sizes| sizes.last()) {
        out.push(json!({ "type": "image", "file_id": photo.file_id }));
    }
    for (kind, file) in [
        ("document", &message.document),
        ("voice", &message.voice),
        ("video", &message.video),
        ("audio", &message.audio),
    ] {
        if let Some(file) = file {
            out.push(json!({
                "type": kind,
                "file_id": file.file_id,
                "filename": file.file_name,
                "mime_type": file.mime_type,
            }));
        }
    }
    out
}

/// Normalizes one update. `bot_id` is the recipient: Telegram only delivers what users send
/// to the bot, so nothing here is ever an echo.
pub fn parse_update(update: &TelegramUpdate, bot_id: &str) -> Vec<InboundMessage> {
    let Some(message) = update.message.as_ref() else {
        return Vec::new();
    };

    let text = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .unwrap_or("")
        .trim()
        .to_string();
    let attachments = attachments(message);
    if text.is_empty() && attachments.is_empty() {
        return Vec::new();
    }

    let mut metadata = Metadata::new();
    if !attachments.is_empty() {
        metadata.insert("attachments".into(), Value::Array(attachments));
    }
    metadata.insert("update_id".into(), json!(update.update_id));
    metadata.insert("chat_type".into(), json!(message.chat.chat_type));
    if let Some(from) = &message.from {
        let name = match &from.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", from.first_name, last),
            _ => from.first_name.clone(),
        };
        if !name.trim().is_empty() {
            metadata.insert("name".into(), json!(name.trim()));
        }
        if let Some(username) = &from.username {
            metadata.insert("username".into(), json!(username));
        }
        if let Some(code) = &from.language_code {
            metadata.insert("language_code".into(), json!(code));
        }
    }

    vec![InboundMessage {
        sender_id: message.from.as_ref().map(|f| f.id.to_string()),
        recipient_id: Some(bot_id.to_string()).filter(|b| !b.is_empty()),
        message_text: text,
        message_id: Some(external_message_id(message.chat.id, message.message_id)),
        timestamp: Utc.timestamp_opt(message.date, 0).single(),
        metadata,
        is_echo: false,
        raw_metadata: None,
    }]
}
