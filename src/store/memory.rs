use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ChatStore, SessionFilter};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Channel, ChatMessage, ChatSession, Client, GptEvaluation, SenderRole, SessionRequest,
};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, ChatSession>,
    /// (bot_id, client_id) -> chat_id
    by_participants: HashMap<(String, String), String>,
    external_ids: HashSet<(Channel, String)>,
    /// message id -> chat_id
    message_owner: HashMap<String, String>,
}

/// Process-local store. Every mutation takes the single write lock, so the uniqueness rules
/// hold under concurrent callers the same way the database constraints do.
#[derive(Default)]
pub struct MemoryChatStore {
    inner: RwLock<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn find_or_create_session(&self, request: &SessionRequest) -> StoreResult<ChatSession> {
        let client_id = request.client_id();
        let key = (request.bot_id.clone(), client_id);
        let mut inner = self.inner.write().await;

        if let Some(chat_id) = inner.by_participants.get(&key).cloned() {
            let session = inner
                .sessions
                .get_mut(&chat_id)
                .ok_or_else(|| StoreError::Corrupt(format!("dangling session key {chat_id}")))?;
            session.client.merge_metadata(&request.metadata);
            return Ok(session.clone());
        }

        let mut client = Client::new(
            request.channel,
            &request.client_external_id,
            Default::default(),
        );
        client.merge_metadata(&request.metadata);
        let session = ChatSession::new(&request.bot_id, &request.company_name, client);
        inner
            .by_participants
            .insert(key, session.chat_id.clone());
        inner
            .sessions
            .insert(session.chat_id.clone(), session.clone());
        Ok(session)
    }

    async fn append_message(
        &self,
        chat_id: &str,
        message: ChatMessage,
    ) -> StoreResult<ChatSession> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .sessions
            .get(chat_id)
            .map(ChatSession::channel)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;

        if inner.message_owner.contains_key(&message.id) {
            return Err(StoreError::DuplicateMessage(message.id));
        }
        if let Some(external_id) = &message.external_id {
            if !inner.external_ids.insert((channel, external_id.clone())) {
                return Err(StoreError::DuplicateMessage(external_id.clone()));
            }
        }
        inner
            .message_owner
            .insert(message.id.clone(), chat_id.to_string());

        let session = inner
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        session.last_activity = session.last_activity.max(message.timestamp);
        if message.sender_role == SenderRole::Client {
            session.forced_closed = false;
        }
        session.messages.push(message);
        Ok(session.clone())
    }

    async fn message_exists(&self, channel: Channel, external_id: &str) -> StoreResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .external_ids
            .contains(&(channel, external_id.to_string())))
    }

    async fn set_manual_mode(&self, chat_id: &str, enabled: bool) -> StoreResult<ChatSession> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        session.manual_mode = enabled;
        Ok(session.clone())
    }

    async fn set_forced_closed(&self, chat_id: &str, closed: bool) -> StoreResult<ChatSession> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        session.forced_closed = closed;
        Ok(session.clone())
    }

    async fn get_session(&self, chat_id: &str) -> StoreResult<Option<ChatSession>> {
        Ok(self.inner.read().await.sessions.get(chat_id).cloned())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<ChatSession>> {
        let inner = self.inner.read().await;
        let mut sessions = inner
            .sessions
            .values()
            .filter(|s| filter.bot_id.as_deref().map_or(true, |bot| s.bot_id == bot))
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| b.chat_id.cmp(&a.chat_id))
        });
        Ok(sessions
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn attach_evaluation(
        &self,
        chat_id: &str,
        message_id: &str,
        evaluation: &GptEvaluation,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        let message = session
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        message.gpt_evaluation = Some(evaluation.clone());
        Ok(())
    }

    async fn attach_external_id(
        &self,
        chat_id: &str,
        message_id: &str,
        external_id: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let (channel, already_set) = {
            let session = inner
                .sessions
                .get(chat_id)
                .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
            let message = session
                .message(message_id)
                .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
            (session.channel(), message.external_id.is_some())
        };
        if already_set {
            return Ok(());
        }
        if !inner
            .external_ids
            .insert((channel, external_id.to_string()))
        {
            return Err(StoreError::DuplicateMessage(external_id.to_string()));
        }
        if let Some(message) = inner
            .sessions
            .get_mut(chat_id)
            .and_then(|s| s.messages.iter_mut().find(|m| m.id == message_id))
        {
            message.external_id = Some(external_id.to_string());
        }
        Ok(())
    }

    async fn mark_synced(&self, message_ids: &[String]) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for message_id in message_ids {
            let Some(chat_id) = inner.message_owner.get(message_id).cloned() else {
                continue;
            };
            let Some(session) = inner.sessions.get_mut(&chat_id) else {
                continue;
            };
            if let Some(message) = session
                .messages
                .iter_mut()
                .find(|m| &m.id == message_id && !m.synced_to_constructor)
            {
                message.synced_to_constructor = true;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
