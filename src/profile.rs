//! Best-effort client profile enrichment.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::types::{Channel, Metadata};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub locale: Option<String>,
}

impl Profile {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.avatar_url.is_none() && self.locale.is_none()
    }

    pub fn into_metadata(self) -> Metadata {
        let mut metadata = Metadata::new();
        if let Some(name) = self.name {
            metadata.insert("name".into(), json!(name));
        }
        if let Some(avatar) = self.avatar_url {
            metadata.insert("avatar".into(), json!(avatar));
        }
        if let Some(locale) = self.locale {
            metadata.insert("locale".into(), json!(locale));
        }
        metadata
    }
}

/// Never fails: an unreachable or unknown profile is an empty one.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch(&self, channel: Channel, platform_user_id: &str) -> Profile;
}

/// Instagram and Facebook user profiles through the Graph API.
pub struct GraphProfileFetcher {
    http: reqwest::Client,
    graph_api_base: String,
    instagram_token: Option<String>,
    facebook_token: Option<String>,
}

impl GraphProfileFetcher {
    pub fn new(
        http: reqwest::Client,
        graph_api_base: String,
        instagram_token: Option<String>,
        facebook_token: Option<String>,
    ) -> Self {
        Self {
            http,
            graph_api_base,
            instagram_token,
            facebook_token,
        }
    }

    fn token(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Instagram => self.instagram_token.as_deref(),
            Channel::Facebook => self.facebook_token.as_deref(),
            _ => None,
        }
    }
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn profile_from_graph(value: &Value) -> Profile {
    let name = text_field(value, "name").or_else(|| {
        let first = text_field(value, "first_name")?;
        Some(match text_field(value, "last_name") {
            Some(last) => format!("{first} {last}"),
            None => first,
        })
    });
    Profile {
        name: name.or_else(|| text_field(value, "username")),
        avatar_url: text_field(value, "profile_pic"),
        locale: text_field(value, "locale"),
    }
}

#[async_trait]
impl ProfileFetcher for GraphProfileFetcher {
    async fn fetch(&self, channel: Channel, platform_user_id: &str) -> Profile {
        let Some(token) = self.token(channel).filter(|t| !t.is_empty()) else {
            return Profile::default();
        };
        let url = format!("{}/{}", self.graph_api_base, platform_user_id);
        let response = match self
            .http
            .get(url)
            .query(&[("fields", "name,profile_pic,locale"), ("access_token", token)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("{channel} profile fetch failed: {err}");
                return Profile::default();
            }
        };
        if !response.status().is_success() {
            warn!(
                "{channel} profile fetch for {platform_user_id} returned {}",
                response.status()
            );
            return Profile::default();
        }
        match response.json::<Value>().await {
            Ok(value) => profile_from_graph(&value),
            Err(err) => {
                warn!("{channel} profile payload unreadable: {err}");
                Profile::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_payload_maps_to_profile() {
        let profile = profile_from_graph(&json!({
            "id": "77",
            "name": "Maria Lopez",
            "profile_pic": "https://cdn/x.jpg",
            "locale": "es_ES"
        }));
        assert_eq!(profile.name.as_deref(), Some("Maria Lopez"));
        assert_eq!(profile.locale.as_deref(), Some("es_ES"));

        let metadata = profile.into_metadata();
        assert_eq!(metadata["avatar"], json!("https://cdn/x.jpg"));
    }

    #[test]
    fn first_and_last_name_are_joined() {
        let profile = profile_from_graph(&json!({ "first_name": "Ann", "last_name": "Lee" }));
        assert_eq!(profile.name.as_deref(), Some("Ann Lee"));
        assert!(profile_from_graph(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn channels_without_token_yield_empty_profiles() {
        let fetcher = GraphProfileFetcher::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9".into(),
            None,
            Some(String::new()),
        );
        assert!(fetcher.fetch(Channel::Instagram, "77").await.is_empty());
        assert!(fetcher.fetch(Channel::Facebook, "77").await.is_empty());
        assert!(fetcher.fetch(Channel::Telegram, "55").await.is_empty());
    }
}
