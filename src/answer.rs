//! Answer generator contract and the OpenAI-backed implementation.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::OpenAiSettings;
use crate::error::AnswerError;
use crate::prompting::{render_answer_system_prompt, AnswerPromptContext};
use crate::types::{Channel, ChatMessage, GptEvaluation, SenderRole};

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryTurn {
    pub role: SenderRole,
    pub text: String,
}

impl HistoryTurn {
    /// Substantive messages only, in order.
    pub fn from_messages(messages: &[ChatMessage]) -> Vec<HistoryTurn> {
        messages
            .iter()
            .filter(|m| !m.message.trim().is_empty())
            .map(|m| HistoryTurn {
                role: m.sender_role,
                text: m.message.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub chat_id: String,
    pub company_name: String,
    pub channel: Channel,
    pub client_name: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub new_message: String,
    pub user_language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    pub evaluation: GptEvaluation,
}

impl GeneratedAnswer {
    pub fn escalates(&self) -> bool {
        self.evaluation.wants_consultant()
    }
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: &AnswerRequest) -> Result<GeneratedAnswer, AnswerError>;
}

/// Clients asking for a person, in the languages we serve.
pub fn has_handover_intent(text: &str) -> bool {
    let lower = text.to_lowercase();
    let terms = [
        "human",
        "real person",
        "representative",
        "live agent",
        "consultant",
        "operator",
        "manager",
        "talk to agent",
        "speak to agent",
        "speak with agent",
        "оператор",
        "консультант",
        "менеджер",
        "живой человек",
        "позовите человека",
        "humano",
        "persona real",
        "asesor",
        "agente",
    ];
    terms.iter().any(|needle| lower.contains(needle))
}

fn bool_field(value: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .any(|v| v.as_bool().unwrap_or(false) || v.as_str() == Some("true"))
}

/// Reads the model's JSON decision, tolerating code fences and prose around the object.
pub fn parse_answer_decision(raw: &str) -> Option<GeneratedAnswer> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        if !parsed.is_object() {
            continue;
        }
        let reply = parsed
            .get("reply")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        let evaluation = GptEvaluation {
            confidence: parsed
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 1.0)),
            out_of_scope: bool_field(&parsed, &["outOfScope", "out_of_scope"]),
            consultant_call: bool_field(&parsed, &["consultantCall", "consultant_call"]),
        };
        if reply.is_empty() && !evaluation.wants_consultant() {
            continue;
        }
        return Some(GeneratedAnswer {
            text: reply,
            evaluation,
        });
    }
    None
}

pub struct OpenAiAnswerGenerator {
    http: reqwest::Client,
    settings: OpenAiSettings,
}

impl OpenAiAnswerGenerator {
    pub fn new(http: reqwest::Client, settings: OpenAiSettings) -> Self {
        Self { http, settings }
    }

    fn messages(&self, request: &AnswerRequest) -> Vec<Value> {
        let system = render_answer_system_prompt(&AnswerPromptContext {
            company_name: &request.company_name,
            channel: request.channel.as_str(),
            user_language: &request.user_language,
            client_name: request.client_name.as_deref().unwrap_or(""),
        });
        let mut messages = vec![json!({ "role": "system", "content": system })];
        for turn in &request.history {
            let (role, content) = match turn.role {
                SenderRole::Client => ("user", turn.text.clone()),
                SenderRole::AiAssistant => ("assistant", turn.text.clone()),
                SenderRole::Consultant => ("assistant", format!("[consultant] {}", turn.text)),
            };
            messages.push(json!({ "role": role, "content": content }));
        }
        messages.push(json!({ "role": "user", "content": request.new_message }));
        messages
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiAnswerGenerator {
    async fn generate(&self, request: &AnswerRequest) -> Result<GeneratedAnswer, AnswerError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(AnswerError::NotConfigured);
        }
        let response = self
            .http
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(&self.settings.api_key)
            .json(&json!({
                "model": self.settings.model,
                "messages": self.messages(request),
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(|err| AnswerError::Upstream(format!("openai request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AnswerError::Upstream(format!(
                "openai returned {status}: {body}"
            )));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| AnswerError::Malformed(format!("openai parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AnswerError::Malformed(
                "openai response had empty content".to_string(),
            ));
        }

        Ok(parse_answer_decision(&text).unwrap_or_else(|| GeneratedAnswer {
            evaluation: GptEvaluation {
                consultant_call: has_handover_intent(&request.new_message),
                ..Default::default()
            },
            text,
        }))
    }
}
