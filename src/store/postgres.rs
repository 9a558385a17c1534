use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use super::{ChatStore, SessionFilter};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Channel, ChatMessage, ChatSession, Client, GptEvaluation, Metadata, SenderRole,
    SessionRequest,
};

const SESSION_COLUMNS: &str = "chat_id, bot_id, company_name, client_id, client_source, \
     client_external_id, client_metadata, manual_mode, forced_closed, created_at, \
     last_activity, brief_answers, constructor_chat_id";

const MESSAGE_COLUMNS: &str = "id, chat_id, message, sender_role, sent_at, external_id, \
     metadata, synced_to_constructor, gpt_evaluation";

pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_session(&self, chat_id: &str) -> StoreResult<Option<ChatSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE chat_id = $1"
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut session = parse_session_row(&row)?;

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = $1 ORDER BY seq ASC"
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        session.messages = rows
            .iter()
            .map(parse_message_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Some(session))
    }

    async fn require_session(&self, chat_id: &str) -> StoreResult<ChatSession> {
        self.load_session(chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))
    }
}

fn metadata_from(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

fn parse_session_row(row: &PgRow) -> StoreResult<ChatSession> {
    let source: String = row.try_get("client_source")?;
    let source = Channel::parse(&source)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown channel {source}")))?;
    Ok(ChatSession {
        chat_id: row.try_get("chat_id")?,
        client: Client {
            client_id: row.try_get("client_id")?,
            source,
            external_id: row.try_get("client_external_id")?,
            metadata: metadata_from(row.try_get("client_metadata")?),
        },
        bot_id: row.try_get("bot_id")?,
        company_name: row.try_get("company_name")?,
        messages: Vec::new(),
        manual_mode: row.try_get("manual_mode")?,
        forced_closed: row.try_get("forced_closed")?,
        created_at: row.try_get("created_at")?,
        last_activity: row.try_get("last_activity")?,
        brief_answers: row.try_get("brief_answers")?,
        constructor_chat_id: row.try_get("constructor_chat_id")?,
    })
}

fn parse_message_row(row: &PgRow) -> StoreResult<ChatMessage> {
    let role: String = row.try_get("sender_role")?;
    let sender_role = SenderRole::parse(&role)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown sender role {role}")))?;
    let evaluation: Option<Json<GptEvaluation>> = row.try_get("gpt_evaluation")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        message: row.try_get("message")?,
        sender_role,
        timestamp: row.try_get::<DateTime<Utc>, _>("sent_at")?,
        external_id: row.try_get("external_id")?,
        metadata: metadata_from(row.try_get("metadata")?),
        synced_to_constructor: row.try_get("synced_to_constructor")?,
        gpt_evaluation: evaluation.map(|Json(evaluation)| evaluation),
    })
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn find_or_create_session(&self, request: &SessionRequest) -> StoreResult<ChatSession> {
        let now = Utc::now();
        let chat_id: String = sqlx::query_scalar(
            r#"
            INSERT INTO chat_sessions (
                chat_id, bot_id, company_name, client_id, client_source, client_external_id,
                client_metadata, created_at, last_activity
            ) VALUES ($1,$2,$3,$4,$5,$6,jsonb_strip_nulls($7),$8,$8)
            ON CONFLICT (bot_id, client_id) DO UPDATE SET
                client_metadata = chat_sessions.client_metadata || EXCLUDED.client_metadata
            RETURNING chat_id
            "#,
        )
        .bind(crate::types::new_chat_id())
        .bind(&request.bot_id)
        .bind(&request.company_name)
        .bind(request.client_id())
        .bind(request.channel.as_str())
        .bind(request.client_external_id.trim())
        .bind(Value::Object(request.metadata.clone()))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        self.require_session(&chat_id).await
    }

    async fn append_message(
        &self,
        chat_id: &str,
        message: ChatMessage,
    ) -> StoreResult<ChatSession> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes appends for one chat.
        let source: Option<String> = sqlx::query_scalar(
            "SELECT client_source FROM chat_sessions WHERE chat_id = $1 FOR UPDATE",
        )
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(source) = source else {
            return Err(StoreError::NotFound(chat_id.to_string()));
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO chat_messages (
                id, chat_id, channel, message, sender_role, sent_at, external_id, metadata,
                synced_to_constructor, gpt_evaluation
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(chat_id)
        .bind(&source)
        .bind(&message.message)
        .bind(message.sender_role.as_str())
        .bind(message.timestamp)
        .bind(&message.external_id)
        .bind(Value::Object(message.metadata.clone()))
        .bind(message.synced_to_constructor)
        .bind(message.gpt_evaluation.as_ref().map(Json))
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateMessage(
                message.external_id.unwrap_or(message.id),
            ));
        }

        sqlx::query(
            "UPDATE chat_sessions SET \
                 last_activity = GREATEST(last_activity, $2), \
                 forced_closed = CASE WHEN $3 THEN FALSE ELSE forced_closed END \
             WHERE chat_id = $1",
        )
        .bind(chat_id)
        .bind(message.timestamp)
        .bind(message.sender_role == SenderRole::Client)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.require_session(chat_id).await
    }

    async fn message_exists(&self, channel: Channel, external_id: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM chat_messages WHERE channel = $1 AND external_id = $2)",
        )
        .bind(channel.as_str())
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn set_manual_mode(&self, chat_id: &str, enabled: bool) -> StoreResult<ChatSession> {
        let updated = sqlx::query("UPDATE chat_sessions SET manual_mode = $1 WHERE chat_id = $2")
            .bind(enabled)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(chat_id.to_string()));
        }
        self.require_session(chat_id).await
    }

    async fn set_forced_closed(&self, chat_id: &str, closed: bool) -> StoreResult<ChatSession> {
        let updated =
            sqlx::query("UPDATE chat_sessions SET forced_closed = $1 WHERE chat_id = $2")
                .bind(closed)
                .bind(chat_id)
                .execute(&self.pool)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(chat_id.to_string()));
        }
        self.require_session(chat_id).await
    }

    async fn get_session(&self, chat_id: &str) -> StoreResult<Option<ChatSession>> {
        self.load_session(chat_id).await
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<ChatSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions \
             WHERE ($1::text IS NULL OR bot_id = $1) \
             ORDER BY last_activity DESC, chat_id DESC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(&filter.bot_id)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut sessions = rows
            .iter()
            .map(parse_session_row)
            .collect::<StoreResult<Vec<_>>>()?;
        if sessions.is_empty() {
            return Ok(sessions);
        }

        let chat_ids = sessions
            .iter()
            .map(|s| s.chat_id.clone())
            .collect::<Vec<_>>();
        let message_rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
             WHERE chat_id = ANY($1::text[]) ORDER BY seq ASC"
        ))
        .bind(&chat_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_chat: HashMap<String, Vec<ChatMessage>> = HashMap::new();
        for row in &message_rows {
            let chat_id: String = row.try_get("chat_id")?;
            by_chat
                .entry(chat_id)
                .or_default()
                .push(parse_message_row(row)?);
        }
        for session in &mut sessions {
            session.messages = by_chat.remove(&session.chat_id).unwrap_or_default();
        }
        Ok(sessions)
    }

    async fn attach_evaluation(
        &self,
        chat_id: &str,
        message_id: &str,
        evaluation: &GptEvaluation,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE chat_messages SET gpt_evaluation = $1 WHERE id = $2 AND chat_id = $3",
        )
        .bind(Json(evaluation))
        .bind(message_id)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn attach_external_id(
        &self,
        chat_id: &str,
        message_id: &str,
        external_id: &str,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE chat_messages SET external_id = $1 \
             WHERE id = $2 AND chat_id = $3 AND external_id IS NULL",
        )
        .bind(external_id)
        .bind(message_id)
        .bind(chat_id)
        .execute(&self.pool)
        .await;
        match updated {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::DuplicateMessage(external_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_synced(&self, message_ids: &[String]) -> StoreResult<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let updated = sqlx::query(
            "UPDATE chat_messages SET synced_to_constructor = TRUE \
             WHERE id = ANY($1::text[]) AND synced_to_constructor = FALSE",
        )
        .bind(message_ids)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }
}
