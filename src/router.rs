//! Turns canonical inbound messages into deduplicated, role-assigned messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::StoreResult;
use crate::profile::{Profile, ProfileFetcher};
use crate::store::ChatStore;
use crate::types::{Channel, InboundMessage, Metadata, SenderRole};

const BROADCAST_MARKER: &str = "broadcast";
const PROFILE_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata keys that describe the client rather than a single message.
const CLIENT_KEYS: [&str; 6] = ["name", "username", "avatar", "locale", "language_code", "language"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub sender_role: SenderRole,
    pub bot_id: String,
    pub client_external_id: String,
}

/// Pure role resolution.
///
/// Instagram echoes are the business account writing from its inbox: the sender is the
/// bot and the recipient is the client. Everywhere else a message sent by the configured
/// bot identity is the AI's own; the client is then the other party.
pub fn resolve_identity(
    channel: Channel,
    is_echo: bool,
    sender_id: &str,
    recipient_id: &str,
    configured_bot_id: &str,
) -> ResolvedIdentity {
    if channel == Channel::Instagram {
        return if is_echo {
            ResolvedIdentity {
                sender_role: SenderRole::Consultant,
                bot_id: sender_id.to_string(),
                client_external_id: recipient_id.to_string(),
            }
        } else {
            ResolvedIdentity {
                sender_role: SenderRole::Client,
                bot_id: configured_bot_id.to_string(),
                client_external_id: sender_id.to_string(),
            }
        };
    }

    if !configured_bot_id.is_empty() && sender_id == configured_bot_id {
        ResolvedIdentity {
            sender_role: SenderRole::AiAssistant,
            bot_id: configured_bot_id.to_string(),
            client_external_id: recipient_id.to_string(),
        }
    } else {
        ResolvedIdentity {
            sender_role: SenderRole::Client,
            bot_id: configured_bot_id.to_string(),
            client_external_id: sender_id.to_string(),
        }
    }
}

pub fn is_broadcast_echo(message: &InboundMessage) -> bool {
    message.is_echo && message.raw_metadata.as_deref() == Some(BROADCAST_MARKER)
}

/// An echo of our own Send API call.
pub fn is_self_echo(message: &InboundMessage, app_id: Option<&str>) -> bool {
    let Some(app_id) = app_id.filter(|id| !id.is_empty()) else {
        return false;
    };
    message.is_echo && message.metadata.get("app_id").and_then(Value::as_str) == Some(app_id)
}

fn two_letter(code: &str) -> Option<String> {
    let prefix = code.trim().get(..2)?.to_ascii_lowercase();
    let valid = prefix.chars().all(|c| c.is_ascii_lowercase());
    let rest_ok = code
        .trim()
        .chars()
        .nth(2)
        .map_or(true, |c| c == '_' || c == '-');
    (valid && rest_ok).then_some(prefix)
}

/// Profile locale first, then the platform's language code, then English.
pub fn resolve_language(profile_locale: Option<&str>, platform_code: Option<&str>) -> String {
    profile_locale
        .and_then(two_letter)
        .or_else(|| platform_code.and_then(two_letter))
        .unwrap_or_else(|| "en".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BroadcastEcho,
    SelfEcho,
    Duplicate,
    MissingSender,
    MissingRecipient,
}

#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub channel: Channel,
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub bot_id: String,
    pub client_external_id: String,
    pub message_text: String,
    pub external_id: Option<String>,
    pub user_language: String,
    pub client_metadata: Metadata,
    pub message_metadata: Metadata,
    pub platform_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Routed(RoutedMessage),
    Skipped(SkipReason),
}

pub struct MessageRouter {
    config: Arc<AppConfig>,
    store: Arc<dyn ChatStore>,
    profiles: Option<Arc<dyn ProfileFetcher>>,
    profile_cache: DashMap<(Channel, String), Profile>,
}

impl MessageRouter {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ChatStore>,
        profiles: Option<Arc<dyn ProfileFetcher>>,
    ) -> Self {
        Self {
            config,
            store,
            profiles,
            profile_cache: DashMap::new(),
        }
    }

    async fn profile(&self, channel: Channel, user_id: &str) -> Profile {
        let key = (channel, user_id.to_string());
        if let Some(cached) = self.profile_cache.get(&key) {
            return cached.clone();
        }
        let Some(fetcher) = &self.profiles else {
            return Profile::default();
        };
        let profile = tokio::time::timeout(PROFILE_FETCH_TIMEOUT, fetcher.fetch(channel, user_id))
            .await
            .unwrap_or_default();
        // Empty results are retried on the next message.
        if !profile.is_empty() {
            self.profile_cache.insert(key, profile.clone());
        }
        profile
    }

    pub async fn route(
        &self,
        channel: Channel,
        inbound: InboundMessage,
    ) -> StoreResult<RouteOutcome> {
        if is_broadcast_echo(&inbound) {
            debug!("{channel}: dropping broadcast echo");
            return Ok(RouteOutcome::Skipped(SkipReason::BroadcastEcho));
        }
        let app_id = self.config.channel(channel).and_then(|s| s.app_id.as_deref());
        if is_self_echo(&inbound, app_id) {
            debug!("{channel}: dropping echo of our own send");
            return Ok(RouteOutcome::Skipped(SkipReason::SelfEcho));
        }

        let Some(sender_id) = inbound.sender_id.clone().filter(|s| !s.is_empty()) else {
            info!("{channel}: skipping event without sender id");
            return Ok(RouteOutcome::Skipped(SkipReason::MissingSender));
        };
        let Some(recipient_id) = inbound.recipient_id.clone().filter(|r| !r.is_empty()) else {
            info!("{channel}: skipping event without recipient id");
            return Ok(RouteOutcome::Skipped(SkipReason::MissingRecipient));
        };

        if let Some(external_id) = inbound.message_id.as_deref() {
            if self.store.message_exists(channel, external_id).await? {
                info!("{channel}: duplicate delivery of message {external_id}");
                return Ok(RouteOutcome::Skipped(SkipReason::Duplicate));
            }
        }

        let identity = resolve_identity(
            channel,
            inbound.is_echo,
            &sender_id,
            &recipient_id,
            self.config.bot_id(channel),
        );

        let mut client_metadata = Metadata::new();
        let mut message_metadata = Metadata::new();
        for (key, value) in inbound.metadata {
            if CLIENT_KEYS.contains(&key.as_str()) {
                client_metadata.insert(key, value);
            } else {
                message_metadata.insert(key, value);
            }
        }

        let mut profile_locale = None;
        if identity.sender_role == SenderRole::Client {
            let profile = self.profile(channel, &identity.client_external_id).await;
            profile_locale = profile.locale.clone();
            for (key, value) in profile.into_metadata() {
                client_metadata.insert(key, value);
            }
        }

        let platform_code = client_metadata
            .get("language_code")
            .and_then(Value::as_str)
            .map(str::to_string);
        let user_language = resolve_language(profile_locale.as_deref(), platform_code.as_deref());
        if identity.sender_role == SenderRole::Client {
            client_metadata.insert("language".into(), json!(user_language));
        }
        if let Some(ts) = inbound.timestamp {
            message_metadata.insert("platform_timestamp".into(), json!(ts.to_rfc3339()));
        }

        Ok(RouteOutcome::Routed(RoutedMessage {
            channel,
            sender_id,
            sender_role: identity.sender_role,
            bot_id: identity.bot_id,
            client_external_id: identity.client_external_id,
            message_text: inbound.message_text,
            external_id: inbound.message_id,
            user_language,
            client_metadata,
            message_metadata,
            platform_timestamp: inbound.timestamp,
        }))
    }
}
