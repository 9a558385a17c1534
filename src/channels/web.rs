//! Internal web chat widget. Callers are authenticated upstream, so there is nothing to verify.

use chrono::Utc;

use crate::types::{InboundMessage, Metadata};

pub fn inbound(
    visitor_id: &str,
    bot_id: &str,
    text: &str,
    message_id: Option<String>,
    metadata: Metadata,
) -> InboundMessage {
    InboundMessage {
        sender_id: Some(visitor_id.to_string()).filter(|v| !v.trim().is_empty()),
        recipient_id: Some(bot_id.to_string()).filter(|b| !b.trim().is_empty()),
        message_text: text.trim().to_string(),
        message_id: message_id.filter(|id| !id.trim().is_empty()),
        timestamp: Some(Utc::now()),
        metadata,
        is_echo: false,
        raw_metadata: None,
    }
}
