#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use omnichat_server::answer::{AnswerGenerator, AnswerRequest, GeneratedAnswer};
use omnichat_server::channels::telegram::{parse_update, TelegramUpdate};
use omnichat_server::config::{AppConfig, ChannelSettings};
use omnichat_server::delivery::ChannelDelivery;
use omnichat_server::error::{AnswerError, DeliveryError};
use omnichat_server::pipeline::{ChatService, Collaborators};
use omnichat_server::realtime::ConnectionHub;
use omnichat_server::store::MemoryChatStore;
use omnichat_server::types::{Channel, GptEvaluation, InboundMessage};

pub const TELEGRAM_BOT: &str = "4242";
pub const TELEGRAM_TOKEN: &str = "4242:telegram-secret";
pub const INSTAGRAM_ACCOUNT: &str = "17841";
pub const INSTAGRAM_SECRET: &str = "ig-app-secret";
pub const FACEBOOK_PAGE: &str = "page-1";
pub const FACEBOOK_APP_ID: &str = "555";

pub fn test_config() -> AppConfig {
    AppConfig {
        company_name: "acme".into(),
        telegram: ChannelSettings {
            app_secret: TELEGRAM_TOKEN.into(),
            bot_id: TELEGRAM_BOT.into(),
            access_token: Some(TELEGRAM_TOKEN.into()),
            ..Default::default()
        },
        instagram: ChannelSettings {
            app_secret: INSTAGRAM_SECRET.into(),
            bot_id: INSTAGRAM_ACCOUNT.into(),
            verify_token: Some("verify-me".into()),
            ..Default::default()
        },
        facebook: ChannelSettings {
            app_secret: "fb-app-secret".into(),
            bot_id: FACEBOOK_PAGE.into(),
            app_id: Some(FACEBOOK_APP_ID.into()),
            ..Default::default()
        },
        flood_interval_auto: Duration::ZERO,
        flood_interval_manual: Duration::ZERO,
        ..Default::default()
    }
}

/// Scripted answer generator. Replies are consumed in order; the last one repeats.
pub struct ScriptedAnswers {
    replies: Mutex<Vec<Result<GeneratedAnswer, String>>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Duration,
    pub requests: Mutex<Vec<AnswerRequest>>,
}

impl ScriptedAnswers {
    pub fn new(replies: Vec<Result<GeneratedAnswer, String>>) -> Self {
        Self {
            replies: Mutex::new(replies),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(answer(text, GptEvaluation::default()))])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnswerGenerator for ScriptedAnswers {
    async fn generate(&self, request: &AnswerRequest) -> Result<GeneratedAnswer, AnswerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply.map_err(AnswerError::Upstream)
    }
}

pub fn answer(text: &str, evaluation: GptEvaluation) -> GeneratedAnswer {
    GeneratedAnswer {
        text: text.into(),
        evaluation,
    }
}

/// Platform id `RecordingDelivery` hands out for its n-th send (1-based).
pub fn sent_id(n: usize) -> String {
    format!("sent-{n}")
}

#[derive(Default)]
pub struct RecordingDelivery {
    pub sent: Mutex<Vec<(Channel, String, String)>>,
}

impl RecordingDelivery {
    pub fn sent(&self) -> Vec<(Channel, String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliveries run detached; give them a moment to land.
    pub async fn wait_for(&self, count: usize) -> Vec<(Channel, String, String)> {
        for _ in 0..100 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl ChannelDelivery for RecordingDelivery {
    async fn deliver(
        &self,
        channel: Channel,
        recipient_id: &str,
        text: &str,
    ) -> Result<Option<String>, DeliveryError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((channel, recipient_id.to_string(), text.to_string()));
        Ok(Some(sent_id(sent.len())))
    }
}

pub struct Harness {
    pub service: Arc<ChatService>,
    pub answers: Option<Arc<ScriptedAnswers>>,
    pub delivery: Arc<RecordingDelivery>,
}

pub fn harness(config: AppConfig, answers: Option<ScriptedAnswers>) -> Harness {
    let answers = answers.map(Arc::new);
    let delivery = Arc::new(RecordingDelivery::default());
    let collaborators = Collaborators {
        answers: answers
            .clone()
            .map(|a| a as Arc<dyn AnswerGenerator>),
        profiles: None,
        delivery: Some(delivery.clone() as Arc<dyn ChannelDelivery>),
    };
    let service = ChatService::new(
        Arc::new(config),
        Arc::new(MemoryChatStore::new()),
        Arc::new(ConnectionHub::new()),
        collaborators,
    );
    Harness {
        service,
        answers,
        delivery,
    }
}

pub fn telegram_update(chat_id: i64, message_id: i64, text: &str) -> Value {
    json!({
        "update_id": 10_000 + message_id,
        "message": {
            "message_id": message_id,
            "date": 1_700_000_000,
            "chat": { "id": chat_id, "type": "private" },
            "from": { "id": chat_id, "is_bot": false, "first_name": "Ivan", "language_code": "ru" },
            "text": text
        }
    })
}

pub fn telegram_inbound(chat_id: i64, message_id: i64, text: &str) -> InboundMessage {
    let update: TelegramUpdate =
        serde_json::from_value(telegram_update(chat_id, message_id, text)).unwrap();
    parse_update(&update, TELEGRAM_BOT).remove(0)
}

/// Attaches a live viewer and returns its receiving end.
pub fn watch(service: &ChatService, chat_id: &str) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    service.hub().connect(
        chat_id,
        "viewer-1",
        omnichat_server::realtime::ViewerKind::Operator,
        tx,
    );
    rx
}

/// Drains whatever is queued for a viewer.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

pub fn events_named<'a>(events: &'a [Value], name: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["event"] == name).collect()
}
