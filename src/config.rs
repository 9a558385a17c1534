//! Configuration management

use std::{env, time::Duration};

use crate::types::Channel;

/// Credentials and identity for one external platform.
#[derive(Debug, Clone, Default)]
pub struct ChannelSettings {
    /// Meta app secret, or the Telegram bot token.
    pub app_secret: String,
    /// Business-side account id: bot id, page id, IG account id or phone number id.
    pub bot_id: String,
    pub verify_token: Option<String>,
    /// Token for profile lookups and outbound delivery.
    pub access_token: Option<String>,
    /// Meta app id; echoes carrying it are our own Send API calls.
    pub app_id: Option<String>,
}

impl ChannelSettings {
    pub fn is_enabled(&self) -> bool {
        !self.app_secret.trim().is_empty() && !self.bot_id.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum StoreBackend {
    Postgres { database_url: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub company_name: String,
    pub store: StoreBackend,

    pub telegram: ChannelSettings,
    pub instagram: ChannelSettings,
    pub facebook: ChannelSettings,
    pub whatsapp: ChannelSettings,
    pub internal_bot_id: String,

    pub chat_timeout: Duration,
    pub answer_timeout: Duration,
    pub flood_interval_auto: Duration,
    pub flood_interval_manual: Duration,
    /// Consecutive answer failures before a chat is handed to humans; 0 disables.
    pub answer_failure_escalation: u32,
    pub manual_mode_release: Option<Duration>,

    pub admin_token: Option<String>,
    pub openai: Option<OpenAiSettings>,
    pub graph_api_base: String,
    pub telegram_api_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            company_name: "default".to_string(),
            store: StoreBackend::Memory,
            telegram: ChannelSettings::default(),
            instagram: ChannelSettings::default(),
            facebook: ChannelSettings::default(),
            whatsapp: ChannelSettings::default(),
            internal_bot_id: "web".to_string(),
            chat_timeout: Duration::from_secs(24 * 60 * 60),
            answer_timeout: Duration::from_secs(30),
            flood_interval_auto: Duration::from_millis(3000),
            flood_interval_manual: Duration::from_millis(1000),
            answer_failure_escalation: 3,
            manual_mode_release: None,
            admin_token: None,
            openai: None,
            graph_api_base: "https://graph.facebook.com/v21.0".to_string(),
            telegram_api_base: "https://api.telegram.org".to_string(),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn var_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    var(key).and_then(|value| value.parse().ok())
}

fn resolve_database_url() -> String {
    if let Some(url) = var("DATABASE_URL") {
        return url;
    }
    let host = var("POSTGRES_HOST")
        .or_else(|| var("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = var("POSTGRES_PORT")
        .or_else(|| var("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = var("POSTGRES_USER")
        .or_else(|| var("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = var("POSTGRES_PASSWORD")
        .or_else(|| var("PGPASSWORD"))
        .unwrap_or_default();
    let db = var("POSTGRES_DB")
        .or_else(|| var("PGDATABASE"))
        .unwrap_or_else(|| "omnichat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

/// Telegram bot tokens look like `<bot id>:<secret>`.
pub fn telegram_bot_id_from_token(token: &str) -> Option<String> {
    let (id, _) = token.split_once(':')?;
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

fn channel_from_env(prefix: &str) -> ChannelSettings {
    ChannelSettings {
        app_secret: var(&format!("{prefix}_APP_SECRET")).unwrap_or_default(),
        bot_id: var(&format!("{prefix}_BOT_ID")).unwrap_or_default(),
        verify_token: var(&format!("{prefix}_VERIFY_TOKEN")),
        access_token: var(&format!("{prefix}_ACCESS_TOKEN")),
        app_id: var(&format!("{prefix}_APP_ID")),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok(); // Load .env file if present
        let defaults = Self::default();

        let store = match var("STORE_BACKEND").as_deref() {
            Some("memory") => StoreBackend::Memory,
            _ => StoreBackend::Postgres {
                database_url: resolve_database_url(),
            },
        };

        let bot_token = var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let telegram = ChannelSettings {
            bot_id: var("TELEGRAM_BOT_ID")
                .or_else(|| telegram_bot_id_from_token(&bot_token))
                .unwrap_or_default(),
            verify_token: var("TELEGRAM_VERIFY_TOKEN"),
            access_token: Some(bot_token.clone()).filter(|t| !t.is_empty()),
            app_id: None,
            app_secret: bot_token,
        };

        let openai = var("OPENAI_API_KEY").map(|api_key| OpenAiSettings {
            api_key,
            model: var("OPENAI_CHAT_MODEL").unwrap_or_else(|| "gpt-4.1".to_string()),
            base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
        });

        Self {
            port: var_parsed("PORT").unwrap_or(defaults.port),
            company_name: var("COMPANY_NAME").unwrap_or(defaults.company_name),
            store,
            telegram,
            instagram: channel_from_env("INSTAGRAM"),
            facebook: channel_from_env("FACEBOOK"),
            whatsapp: channel_from_env("WHATSAPP"),
            internal_bot_id: var("INTERNAL_BOT_ID").unwrap_or(defaults.internal_bot_id),
            chat_timeout: var_parsed("CHAT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.chat_timeout),
            answer_timeout: var_parsed("ANSWER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.answer_timeout),
            flood_interval_auto: var_parsed("FLOOD_INTERVAL_AUTO_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flood_interval_auto),
            flood_interval_manual: var_parsed("FLOOD_INTERVAL_MANUAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flood_interval_manual),
            answer_failure_escalation: var_parsed("ANSWER_FAILURE_ESCALATION")
                .unwrap_or(defaults.answer_failure_escalation),
            manual_mode_release: var_parsed("MANUAL_MODE_RELEASE_SECS").map(Duration::from_secs),
            admin_token: var("ADMIN_API_TOKEN"),
            openai,
            graph_api_base: var("GRAPH_API_BASE")
                .unwrap_or(defaults.graph_api_base)
                .trim_end_matches('/')
                .to_string(),
            telegram_api_base: var("TELEGRAM_API_BASE")
                .unwrap_or(defaults.telegram_api_base)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// Settings for an external platform; the internal web channel has none.
    pub fn channel(&self, channel: Channel) -> Option<&ChannelSettings> {
        match channel {
            Channel::Internal => None,
            Channel::Telegram => Some(&self.telegram),
            Channel::Instagram => Some(&self.instagram),
            Channel::Facebook => Some(&self.facebook),
            Channel::Whatsapp => Some(&self.whatsapp),
        }
    }

    /// The configured business identity for a channel.
    pub fn bot_id(&self, channel: Channel) -> &str {
        match self.channel(channel) {
            Some(settings) => &settings.bot_id,
            None => &self.internal_bot_id,
        }
    }
}
