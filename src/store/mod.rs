//! Chat session persistence.

mod memory;
mod postgres;

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{Channel, ChatMessage, ChatSession, GptEvaluation, SessionRequest};

#[derive(Debug, Clone)]
pub struct SessionFilter {
    pub bot_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            bot_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Owner of sessions and their messages.
///
/// Implementations must make `find_or_create_session` atomic per `(bot_id, client_id)` and
/// must reject a second message with the same `(channel, external_id)` even when two
/// appends race.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Returns the session for the request's `(bot_id, client_id)`, creating it on first
    /// contact. Metadata on the request is merged into the stored client.
    async fn find_or_create_session(&self, request: &SessionRequest) -> StoreResult<ChatSession>;

    /// Appends in arrival order and bumps `last_activity`. A client message also lifts an
    /// operator close. Fails with `DuplicateMessage` if the external id is already stored.
    async fn append_message(&self, chat_id: &str, message: ChatMessage)
        -> StoreResult<ChatSession>;

    async fn message_exists(&self, channel: Channel, external_id: &str) -> StoreResult<bool>;

    async fn set_manual_mode(&self, chat_id: &str, enabled: bool) -> StoreResult<ChatSession>;

    async fn set_forced_closed(&self, chat_id: &str, closed: bool) -> StoreResult<ChatSession>;

    async fn get_session(&self, chat_id: &str) -> StoreResult<Option<ChatSession>>;

    /// Most recently active first.
    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<ChatSession>>;

    async fn attach_evaluation(
        &self,
        chat_id: &str,
        message_id: &str,
        evaluation: &GptEvaluation,
    ) -> StoreResult<()>;

    /// Records the platform id of a message we sent, so the platform's echo of it is caught
    /// by the duplicate guard. A message that already has an external id is left alone.
    async fn attach_external_id(
        &self,
        chat_id: &str,
        message_id: &str,
        external_id: &str,
    ) -> StoreResult<()>;

    /// Flags messages as delivered to the external sync integration; returns how many changed.
    async fn mark_synced(&self, message_ids: &[String]) -> StoreResult<u64>;
}
