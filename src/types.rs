use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Free-form key/value bag carried by clients and messages.
pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Internal,
    Telegram,
    Instagram,
    Facebook,
    Whatsapp,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Internal,
        Channel::Telegram,
        Channel::Instagram,
        Channel::Facebook,
        Channel::Whatsapp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Internal => "internal",
            Channel::Telegram => "telegram",
            Channel::Instagram => "instagram",
            Channel::Facebook => "facebook",
            Channel::Whatsapp => "whatsapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str() == value.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Client,
    AiAssistant,
    Consultant,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Client => "client",
            SenderRole::AiAssistant => "ai_assistant",
            SenderRole::Consultant => "consultant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "client" => Some(SenderRole::Client),
            "ai_assistant" => Some(SenderRole::AiAssistant),
            "consultant" => Some(SenderRole::Consultant),
            _ => None,
        }
    }
}

/// Stable client key: `<channel>:<platform user id>`.
pub fn client_key(channel: Channel, external_id: &str) -> String {
    format!("{}:{}", channel.as_str(), external_id.trim())
}

/// Identity for anonymous web visitors, derived from what the transport tells us about them.
pub fn anonymous_visitor_id(ip: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", ip.trim(), user_agent.trim()).as_bytes());
    hex::encode(&digest[..16])
}

/// Chat ids are UUIDv7, so lexical order follows creation time.
pub fn new_chat_id() -> String {
    Uuid::now_v7().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub source: Channel,
    pub external_id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Client {
    pub fn new(source: Channel, external_id: &str, metadata: Metadata) -> Self {
        Self {
            client_id: client_key(source, external_id),
            source,
            external_id: external_id.trim().to_string(),
            metadata,
        }
    }

    /// Adds fields from `incoming`; existing keys are refreshed, absent keys are kept.
    pub fn merge_metadata(&mut self, incoming: &Metadata) {
        for (key, value) in incoming {
            if !value.is_null() {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn language(&self) -> Option<&str> {
        self.metadata.get("language").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GptEvaluation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub out_of_scope: bool,
    #[serde(default)]
    pub consultant_call: bool,
}

impl GptEvaluation {
    pub fn wants_consultant(&self) -> bool {
        self.out_of_scope || self.consultant_call
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub message: String,
    pub sender_role: SenderRole,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub synced_to_constructor: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpt_evaluation: Option<GptEvaluation>,
}

impl ChatMessage {
    pub fn new(
        sender_role: SenderRole,
        text: &str,
        external_id: Option<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: text.trim().to_string(),
            sender_role,
            timestamp: Utc::now(),
            external_id: external_id.filter(|id| !id.trim().is_empty()),
            metadata,
            synced_to_constructor: false,
            gpt_evaluation: None,
        }
    }

    /// Text or an attachment; empty service entries do not count as a conversational turn.
    pub fn is_substantive(&self) -> bool {
        !self.message.trim().is_empty()
            || self
                .metadata
                .get("attachments")
                .and_then(Value::as_array)
                .map(|items| !items.is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub chat_id: String,
    pub client: Client,
    pub bot_id: String,
    pub company_name: String,
    pub messages: Vec<ChatMessage>,
    pub manual_mode: bool,
    #[serde(default)]
    pub forced_closed: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_answers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor_chat_id: Option<String>,
}

impl ChatSession {
    pub fn new(bot_id: &str, company_name: &str, client: Client) -> Self {
        let now = Utc::now();
        Self {
            chat_id: new_chat_id(),
            client,
            bot_id: bot_id.to_string(),
            company_name: company_name.to_string(),
            messages: Vec::new(),
            manual_mode: false,
            forced_closed: false,
            created_at: now,
            last_activity: now,
            brief_answers: None,
            constructor_chat_id: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.client.source
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn last_substantive_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.is_substantive())
    }

    pub fn message(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Messages strictly before `message_id`, in order. Whole history if the id is unknown.
    pub fn history_before(&self, message_id: &str) -> &[ChatMessage] {
        let end = self
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .unwrap_or(self.messages.len());
        &self.messages[..end]
    }

    /// Most recent consultant reply, used for releasing a stale manual takeover.
    pub fn last_consultant_activity(&self) -> Option<DateTime<Utc>> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.sender_role == SenderRole::Consultant)
            .map(|m| m.timestamp)
    }
}

/// Channel-neutral shape every adapter produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub message_text: String,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub raw_metadata: Option<String>,
}

/// Input for `ChatStore::find_or_create_session`.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub bot_id: String,
    pub company_name: String,
    pub channel: Channel,
    pub client_external_id: String,
    pub metadata: Metadata,
}

impl SessionRequest {
    pub fn client_id(&self) -> String {
        client_key(self.channel, &self.client_external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_parse_round_trips_names() {
        for channel in Channel::ALL {
            assert_eq!(Channel::parse(channel.as_str()), Some(channel));
        }
        assert_eq!(Channel::parse(" Telegram "), Some(Channel::Telegram));
        assert_eq!(Channel::parse("viber"), None);
    }

    #[test]
    fn merge_metadata_keeps_existing_fields() {
        let mut meta = Metadata::new();
        meta.insert("name".into(), json!("Ann"));
        meta.insert("avatar".into(), json!("a.png"));
        let mut client = Client::new(Channel::Telegram, "55", meta);

        let mut incoming = Metadata::new();
        incoming.insert("name".into(), json!("Anna"));
        incoming.insert("locale".into(), json!("ru_RU"));
        incoming.insert("avatar".into(), Value::Null);
        client.merge_metadata(&incoming);

        assert_eq!(client.metadata["name"], json!("Anna"));
        assert_eq!(client.metadata["avatar"], json!("a.png"));
        assert_eq!(client.metadata["locale"], json!("ru_RU"));
        assert_eq!(client.client_id, "telegram:55");
    }

    #[test]
    fn anonymous_visitor_id_is_stable() {
        let a = anonymous_visitor_id("10.0.0.1", "Mozilla/5.0");
        let b = anonymous_visitor_id("10.0.0.1", "Mozilla/5.0");
        let c = anonymous_visitor_id("10.0.0.2", "Mozilla/5.0");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn chat_ids_sort_by_creation() {
        let first = new_chat_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_chat_id();
        assert!(first < second);
    }

    #[test]
    fn history_before_excludes_the_trigger() {
        let client = Client::new(Channel::Internal, "v1", Metadata::new());
        let mut session = ChatSession::new("web", "acme", client);
        let first = ChatMessage::new(SenderRole::Client, "hi", None, Metadata::new());
        let second = ChatMessage::new(SenderRole::Client, "anyone?", None, Metadata::new());
        let trigger_id = second.id.clone();
        session.messages.push(first.clone());
        session.messages.push(second);

        let history = session.history_before(&trigger_id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, first.id);
    }
}
