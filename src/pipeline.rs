//! Receive, persist, broadcast and (maybe) answer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::answer::{AnswerGenerator, AnswerRequest, GeneratedAnswer, HistoryTurn};
use crate::config::AppConfig;
use crate::delivery::ChannelDelivery;
use crate::error::{AnswerError, StoreError, StoreResult};
use crate::flood::{FloodControl, FloodMode, FloodVerdict};
use crate::labels::{self, Lang, Notice};
use crate::locks::ChatLocks;
use crate::profile::ProfileFetcher;
use crate::realtime::{ConnectionHub, ModeChangeReason, ServerEvent};
use crate::router::{MessageRouter, RouteOutcome, RoutedMessage, SkipReason};
use crate::status::status_at;
use crate::store::ChatStore;
use crate::types::{Channel, ChatMessage, ChatSession, InboundMessage, Metadata, SenderRole, SessionRequest};

const SENT_NOTICE_TTL: Duration = Duration::from_secs(600);

/// Optional external services.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub answers: Option<Arc<dyn AnswerGenerator>>,
    pub profiles: Option<Arc<dyn ProfileFetcher>>,
    pub delivery: Option<Arc<dyn ChannelDelivery>>,
}

/// Result of accepting one message.
#[derive(Debug)]
pub struct Dispatch {
    pub session: ChatSession,
    pub message_id: String,
    pub rate_limited: bool,
    /// Background answer cycle, if one was started.
    pub answer_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Accepted(Dispatch),
    Skipped(SkipReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub accepted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ChatService {
    config: Arc<AppConfig>,
    store: Arc<dyn ChatStore>,
    hub: Arc<ConnectionHub>,
    router: MessageRouter,
    flood: FloodControl,
    locks: ChatLocks,
    answers: Option<Arc<dyn AnswerGenerator>>,
    delivery: Option<Arc<dyn ChannelDelivery>>,
    /// chat_id -> consecutive answer failures
    failures: DashMap<String, u32>,
    /// Platform ids of notices we sent without storing them.
    sent_notices: DashMap<(Channel, String), Instant>,
}

impl ChatService {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ChatStore>,
        hub: Arc<ConnectionHub>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        Arc::new(Self {
            router: MessageRouter::new(config.clone(), store.clone(), collaborators.profiles),
            flood: FloodControl::new(config.flood_interval_auto, config.flood_interval_manual),
            locks: ChatLocks::new(),
            answers: collaborators.answers,
            delivery: collaborators.delivery,
            failures: DashMap::new(),
            sent_notices: DashMap::new(),
            config,
            store,
            hub,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn locks(&self) -> &ChatLocks {
        &self.locks
    }

    /// Consecutive answer failures counted for a chat since its last good answer.
    pub fn answer_failures(&self, chat_id: &str) -> u32 {
        self.failures.get(chat_id).map(|count| *count).unwrap_or(0)
    }

    /// Processes every event of one webhook delivery. A failing event does not stop the
    /// others.
    pub async fn ingest_batch(
        self: &Arc<Self>,
        channel: Channel,
        messages: Vec<InboundMessage>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for inbound in messages {
            match self.ingest(channel, inbound).await {
                Ok(IngestOutcome::Accepted(_)) => report.accepted += 1,
                Ok(IngestOutcome::Skipped(_)) => report.skipped += 1,
                Err(err) => {
                    warn!("{channel}: failed to store inbound message: {err}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn ingest(
        self: &Arc<Self>,
        channel: Channel,
        inbound: InboundMessage,
    ) -> StoreResult<IngestOutcome> {
        if inbound.is_echo {
            if let Some(external_id) = inbound.message_id.clone() {
                if self.sent_notices.remove(&(channel, external_id)).is_some() {
                    debug!("{channel}: dropping echo of our own notice");
                    return Ok(IngestOutcome::Skipped(SkipReason::SelfEcho));
                }
            }
        }
        match self.router.route(channel, inbound).await? {
            RouteOutcome::Skipped(reason) => Ok(IngestOutcome::Skipped(reason)),
            RouteOutcome::Routed(routed) => self.accept(routed).await,
        }
    }

    async fn accept(self: &Arc<Self>, routed: RoutedMessage) -> StoreResult<IngestOutcome> {
        let mut session = self
            .store
            .find_or_create_session(&SessionRequest {
                bot_id: routed.bot_id.clone(),
                company_name: self.config.company_name.clone(),
                channel: routed.channel,
                client_external_id: routed.client_external_id.clone(),
                metadata: routed.client_metadata.clone(),
            })
            .await?;

        if routed.sender_role == SenderRole::Client {
            session = self.release_stale_takeover(session).await?;
        }

        let message = ChatMessage::new(
            routed.sender_role,
            &routed.message_text,
            routed.external_id.clone(),
            routed.message_metadata.clone(),
        );
        let message_id = message.id.clone();
        let chat_id = session.chat_id.clone();
        session = match self.store.append_message(&chat_id, message).await {
            Ok(session) => session,
            // Lost a race against a concurrent redelivery.
            Err(StoreError::DuplicateMessage(id)) => {
                info!("{}: duplicate delivery of message {id}", routed.channel);
                return Ok(IngestOutcome::Skipped(SkipReason::Duplicate));
            }
            Err(err) => return Err(err),
        };

        self.publish_message(&session, &message_id);

        if routed.sender_role == SenderRole::Consultant && !session.manual_mode {
            session = self
                .switch_mode(&chat_id, true, SenderRole::Consultant, ModeChangeReason::ConsultantReply)
                .await?;
        }

        let mut dispatch = Dispatch {
            session,
            message_id,
            rate_limited: false,
            answer_task: None,
        };
        if routed.sender_role != SenderRole::Client {
            return Ok(IngestOutcome::Accepted(dispatch));
        }

        let mode = FloodMode::for_manual_mode(dispatch.session.manual_mode);
        if let FloodVerdict::Limited { retry_after } =
            self.flood.check(&dispatch.session.client.client_id, mode)
        {
            dispatch.rate_limited = true;
            self.notify_rate_limited(&dispatch.session, &routed.user_language, retry_after);
            return Ok(IngestOutcome::Accepted(dispatch));
        }

        if !dispatch.session.manual_mode && self.answers.is_some() {
            let service = self.clone();
            let chat_id = dispatch.session.chat_id.clone();
            let trigger_id = dispatch.message_id.clone();
            dispatch.answer_task = Some(tokio::spawn(async move {
                service.answer_cycle(&chat_id, &trigger_id).await;
            }));
        }
        Ok(IngestOutcome::Accepted(dispatch))
    }

    /// A client writing after long consultant silence gets the bot back, if configured.
    async fn release_stale_takeover(&self, session: ChatSession) -> StoreResult<ChatSession> {
        let Some(release_after) = self.config.manual_mode_release else {
            return Ok(session);
        };
        if !session.manual_mode {
            return Ok(session);
        }
        let Ok(release_after) = chrono::Duration::from_std(release_after) else {
            return Ok(session);
        };
        let last_human = session
            .last_consultant_activity()
            .unwrap_or(session.last_activity);
        if Utc::now() - last_human < release_after {
            return Ok(session);
        }
        info!("chat {}: releasing manual mode after consultant silence", session.chat_id);
        self.switch_mode(
            &session.chat_id,
            false,
            SenderRole::AiAssistant,
            ModeChangeReason::ConsultantSilence,
        )
        .await
    }

    fn session_updated(&self, session: &ChatSession) -> ServerEvent {
        ServerEvent::SessionUpdated {
            chat_id: session.chat_id.clone(),
            bot_id: session.bot_id.clone(),
            channel: session.channel(),
            status: status_at(session, Utc::now(), self.config.chat_timeout),
            manual_mode: session.manual_mode,
            last_activity: session.last_activity,
            last_message: session.last_message().cloned(),
        }
    }

    fn publish_message(&self, session: &ChatSession, message_id: &str) {
        let Some(message) = session.message(message_id) else {
            return;
        };
        self.hub.broadcast(
            &session.chat_id,
            &ServerEvent::NewMessage {
                chat_id: session.chat_id.clone(),
                sender_role: message.sender_role,
                message: message.clone(),
            },
        );
        self.hub.notify_operators(&self.session_updated(session));
    }

    async fn switch_mode(
        &self,
        chat_id: &str,
        manual_mode: bool,
        sender_role: SenderRole,
        reason: ModeChangeReason,
    ) -> StoreResult<ChatSession> {
        let session = self.store.set_manual_mode(chat_id, manual_mode).await?;
        if !manual_mode {
            self.failures.remove(chat_id);
        }
        let event = ServerEvent::ModeChanged {
            chat_id: chat_id.to_string(),
            sender_role,
            manual_mode,
            reason,
        };
        self.hub.broadcast(chat_id, &event);
        self.hub.notify_operators(&event);
        self.hub.notify_operators(&self.session_updated(&session));
        Ok(session)
    }

    fn notify_rate_limited(
        self: &Arc<Self>,
        session: &ChatSession,
        language: &str,
        retry_after: Duration,
    ) {
        let notice = labels::notice(Notice::RateLimited, Lang::from_code(language));
        debug!("chat {}: rate limited for {retry_after:?}", session.chat_id);
        self.hub.broadcast(
            &session.chat_id,
            &ServerEvent::RateLimited {
                chat_id: session.chat_id.clone(),
                sender_role: SenderRole::Client,
                retry_after_ms: retry_after.as_millis() as u64,
                notice: notice.to_string(),
            },
        );
        self.deliver_detached(session, None, notice);
    }

    fn deliver_detached(
        self: &Arc<Self>,
        session: &ChatSession,
        message_id: Option<&str>,
        text: &str,
    ) {
        if session.channel() == Channel::Internal || self.delivery.is_none() {
            return;
        }
        let service = self.clone();
        let session = session.clone();
        let message_id = message_id.map(str::to_string);
        let text = text.to_string();
        tokio::spawn(async move {
            service.deliver(&session, message_id.as_deref(), &text).await;
        });
    }

    /// Pushes `text` to the client's platform. For a stored message the platform's id is
    /// recorded on it, so the echo the platform sends back is dropped as a duplicate. Ids of
    /// unstored notices are remembered for a while for the same reason.
    async fn deliver(&self, session: &ChatSession, message_id: Option<&str>, text: &str) {
        let channel = session.channel();
        if channel == Channel::Internal || text.trim().is_empty() {
            return;
        }
        let Some(delivery) = self.delivery.clone() else {
            return;
        };
        let recipient_id = &session.client.external_id;
        let sent_id = match delivery.deliver(channel, recipient_id, text).await {
            Ok(sent_id) => sent_id,
            Err(err) => {
                warn!("{channel}: delivery to {recipient_id} failed: {err}");
                return;
            }
        };
        let Some(sent_id) = sent_id else {
            return;
        };
        let Some(message_id) = message_id else {
            self.sent_notices.insert((channel, sent_id), Instant::now());
            return;
        };
        if let Err(err) = self
            .store
            .attach_external_id(&session.chat_id, message_id, &sent_id)
            .await
        {
            warn!("chat {}: could not record sent id {sent_id}: {err}", session.chat_id);
        }
    }

    /// Answer generation for one trigger message, serialized per chat.
    async fn answer_cycle(self: &Arc<Self>, chat_id: &str, trigger_id: &str) {
        let Some(generator) = self.answers.clone() else {
            return;
        };
        let guard = self.locks.acquire(chat_id).await;

        let session = match self.store.get_session(chat_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(err) => {
                warn!("chat {chat_id}: cannot load session for answering: {err}");
                return;
            }
        };
        // An operator may have taken over while we waited for the lock.
        if session.manual_mode {
            debug!("chat {chat_id}: manual mode, no automatic answer");
            return;
        }
        let Some(trigger) = session.message(trigger_id) else {
            return;
        };

        let request = AnswerRequest {
            chat_id: chat_id.to_string(),
            company_name: session.company_name.clone(),
            channel: session.channel(),
            client_name: session
                .client
                .metadata
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            history: HistoryTurn::from_messages(session.history_before(trigger_id)),
            new_message: trigger.message.clone(),
            user_language: session.client.language().unwrap_or("en").to_string(),
        };

        self.hub.start_typing(chat_id, SenderRole::AiAssistant);
        let result = match tokio::time::timeout(self.config.answer_timeout, generator.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AnswerError::Timeout),
        };
        self.hub.stop_typing(chat_id, SenderRole::AiAssistant);

        let outbound = match result {
            Ok(answer) => {
                self.failures.remove(chat_id);
                match self.apply_answer(&session, trigger_id, &request.user_language, answer).await {
                    Ok(outbound) => outbound,
                    Err(err) => {
                        warn!("chat {chat_id}: failed to store answer: {err}");
                        None
                    }
                }
            }
            Err(err) => {
                warn!("chat {chat_id}: answer generation failed: {err}");
                self.record_failure(chat_id).await;
                None
            }
        };
        drop(guard);

        if let Some((reply_id, text)) = outbound {
            self.deliver(&session, Some(&reply_id), &text).await;
        }
    }

    /// Persists and broadcasts the answer; returns the stored reply's id and the text to push
    /// to the platform.
    async fn apply_answer(
        &self,
        session: &ChatSession,
        trigger_id: &str,
        language: &str,
        answer: GeneratedAnswer,
    ) -> StoreResult<Option<(String, String)>> {
        let escalate = answer.escalates();
        let text = if answer.text.trim().is_empty() {
            if !escalate {
                return Ok(None);
            }
            // Generator gave up; tell the client someone will follow up.
            self.store
                .attach_evaluation(&session.chat_id, trigger_id, &answer.evaluation)
                .await?;
            labels::notice(Notice::HandedToConsultant, Lang::from_code(language)).to_string()
        } else {
            answer.text.clone()
        };

        let mut reply = ChatMessage::new(SenderRole::AiAssistant, &text, None, Metadata::new());
        reply.gpt_evaluation = Some(answer.evaluation.clone());
        if answer.text.trim().is_empty() {
            reply.metadata.insert("notice".into(), json!("handed_to_consultant"));
        }
        let reply_id = reply.id.clone();
        let updated = self.store.append_message(&session.chat_id, reply).await?;
        self.publish_message(&updated, &reply_id);

        if escalate {
            info!("chat {}: answer generator asked for a consultant", session.chat_id);
            self.switch_mode(
                &session.chat_id,
                true,
                SenderRole::AiAssistant,
                ModeChangeReason::Escalation,
            )
            .await?;
        }
        Ok(Some((reply_id, text)))
    }

    async fn record_failure(&self, chat_id: &str) {
        let threshold = self.config.answer_failure_escalation;
        if threshold == 0 {
            return;
        }
        let failures = {
            let mut count = self.failures.entry(chat_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if failures < threshold {
            return;
        }
        self.failures.remove(chat_id);
        warn!("chat {chat_id}: {failures} consecutive answer failures, handing to consultants");
        if let Err(err) = self
            .switch_mode(chat_id, true, SenderRole::AiAssistant, ModeChangeReason::AnswerFailures)
            .await
        {
            warn!("chat {chat_id}: could not switch to manual mode: {err}");
        }
    }

    /// Reply typed by an operator. Takes the chat over if the bot still had it.
    pub async fn send_consultant_message(
        self: &Arc<Self>,
        chat_id: &str,
        text: &str,
    ) -> StoreResult<(ChatSession, ChatMessage)> {
        let message = ChatMessage::new(SenderRole::Consultant, text, None, Metadata::new());
        let message_id = message.id.clone();
        let mut session = self.store.append_message(chat_id, message).await?;
        self.publish_message(&session, &message_id);
        if !session.manual_mode {
            session = self
                .switch_mode(chat_id, true, SenderRole::Consultant, ModeChangeReason::ConsultantReply)
                .await?;
        }
        let stored = session
            .message(&message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(message_id.clone()))?;
        self.deliver_detached(&session, Some(&stored.id), &stored.message);
        Ok((session, stored))
    }

    pub async fn set_manual_mode(
        self: &Arc<Self>,
        chat_id: &str,
        enabled: bool,
    ) -> StoreResult<ChatSession> {
        self.switch_mode(chat_id, enabled, SenderRole::Consultant, ModeChangeReason::Operator)
            .await
    }

    pub async fn set_forced_closed(
        self: &Arc<Self>,
        chat_id: &str,
        closed: bool,
    ) -> StoreResult<ChatSession> {
        let session = self.store.set_forced_closed(chat_id, closed).await?;
        self.hub.notify_operators(&self.session_updated(&session));
        Ok(session)
    }

    /// Widget bootstrap: the anonymous visitor's session on the internal channel.
    pub async fn open_web_session(
        &self,
        visitor_id: &str,
        metadata: Metadata,
    ) -> StoreResult<ChatSession> {
        self.store
            .find_or_create_session(&SessionRequest {
                bot_id: self.config.internal_bot_id.clone(),
                company_name: self.config.company_name.clone(),
                channel: Channel::Internal,
                client_external_id: visitor_id.to_string(),
                metadata,
            })
            .await
    }

    /// Message typed into the web widget of an existing internal chat.
    pub async fn submit_web_message(
        self: &Arc<Self>,
        session: &ChatSession,
        text: &str,
        message_id: Option<String>,
    ) -> StoreResult<IngestOutcome> {
        let inbound = crate::channels::web::inbound(
            &session.client.external_id,
            &session.bot_id,
            text,
            message_id,
            Metadata::new(),
        );
        self.ingest(Channel::Internal, inbound).await
    }

    /// Periodic cleanup of idle process-local state.
    pub fn prune(&self) {
        let locks = self.locks.prune();
        let windows = self.flood.prune();
        let registries = self.hub.prune();
        self.sent_notices
            .retain(|_, sent_at| sent_at.elapsed() < SENT_NOTICE_TTL);
        if locks + windows + registries > 0 {
            debug!("pruned {locks} locks, {windows} flood windows, {registries} registries");
        }
    }
}
