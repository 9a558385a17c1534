//! Session lifecycle status. Always derived from persisted fields, never stored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatSession, SenderRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    SuccessfullyClosed,
    ClosedWithoutResponse,
    ForcedClosed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::SuccessfullyClosed => "successfully_closed",
            SessionStatus::ClosedWithoutResponse => "closed_without_response",
            SessionStatus::ForcedClosed => "forced_closed",
        }
    }
}

/// `timeout - (now - last_activity)`. Negative once the timeout has elapsed; saturates for
/// timeouts too large to represent.
pub fn ttl_remaining(
    last_activity: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> chrono::Duration {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    timeout
        .checked_sub(&(now - last_activity))
        .unwrap_or(chrono::Duration::MAX)
}

/// Pure status function.
///
/// An operator close wins over everything. Otherwise the chat is in progress until the ttl
/// runs out, after which the author of the last substantive message decides the outcome:
/// a reply from the AI or a consultant means the client was answered.
pub fn compute_status(session: &ChatSession, ttl_remaining: chrono::Duration) -> SessionStatus {
    if session.forced_closed {
        return SessionStatus::ForcedClosed;
    }
    if ttl_remaining > chrono::Duration::zero() {
        return SessionStatus::InProgress;
    }
    match session.last_substantive_message().map(|m| m.sender_role) {
        Some(SenderRole::AiAssistant) | Some(SenderRole::Consultant) => {
            SessionStatus::SuccessfullyClosed
        }
        Some(SenderRole::Client) | None => SessionStatus::ClosedWithoutResponse,
    }
}

pub fn status_at(session: &ChatSession, now: DateTime<Utc>, timeout: Duration) -> SessionStatus {
    compute_status(session, ttl_remaining(session.last_activity, now, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Client, Metadata};
    use chrono::Duration as ChronoDuration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn session_with(roles: &[SenderRole]) -> ChatSession {
        let client = Client::new(crate::types::Channel::Telegram, "55", Metadata::new());
        let mut session = ChatSession::new("4242", "acme", client);
        for role in roles {
            session
                .messages
                .push(ChatMessage::new(*role, "text", None, Metadata::new()));
        }
        session
    }

    #[test]
    fn stale_unanswered_chat_is_closed_without_response() {
        let mut session = session_with(&[SenderRole::Client]);
        let now = Utc::now();
        session.last_activity = now - ChronoDuration::hours(25);
        assert_eq!(
            status_at(&session, now, DAY),
            SessionStatus::ClosedWithoutResponse
        );
    }

    #[test]
    fn stale_answered_chat_is_successfully_closed() {
        let mut session = session_with(&[SenderRole::Client, SenderRole::AiAssistant]);
        let now = Utc::now();
        session.last_activity = now - ChronoDuration::hours(25);
        assert_eq!(
            status_at(&session, now, DAY),
            SessionStatus::SuccessfullyClosed
        );

        let mut session = session_with(&[SenderRole::Client, SenderRole::Consultant]);
        session.last_activity = now - ChronoDuration::hours(25);
        assert_eq!(
            status_at(&session, now, DAY),
            SessionStatus::SuccessfullyClosed
        );
    }

    #[test]
    fn status_flips_exactly_at_the_timeout_boundary() {
        let mut session = session_with(&[SenderRole::Client]);
        let last = Utc::now();
        session.last_activity = last;

        let just_before = last + ChronoDuration::hours(24) - ChronoDuration::seconds(1);
        let at_boundary = last + ChronoDuration::hours(24);
        assert_eq!(status_at(&session, just_before, DAY), SessionStatus::InProgress);
        assert_eq!(
            status_at(&session, at_boundary, DAY),
            SessionStatus::ClosedWithoutResponse
        );
    }

    #[test]
    fn compute_status_is_repeatable() {
        let session = session_with(&[SenderRole::Client, SenderRole::AiAssistant]);
        let ttl = ChronoDuration::seconds(-5);
        assert_eq!(compute_status(&session, ttl), compute_status(&session, ttl));
    }

    #[test]
    fn forced_close_overrides_activity() {
        let mut session = session_with(&[SenderRole::Client]);
        session.forced_closed = true;
        assert_eq!(
            compute_status(&session, ChronoDuration::hours(10)),
            SessionStatus::ForcedClosed
        );
    }

    #[test]
    fn empty_service_messages_do_not_count_as_replies() {
        let mut session = session_with(&[SenderRole::Client]);
        session.messages.push(ChatMessage::new(
            SenderRole::AiAssistant,
            "   ",
            None,
            Metadata::new(),
        ));
        assert_eq!(
            compute_status(&session, ChronoDuration::seconds(-1)),
            SessionStatus::ClosedWithoutResponse
        );
    }

    #[test]
    fn huge_timeout_with_activity_in_the_future_does_not_overflow() {
        let now = Utc::now();
        let ahead = now + ChronoDuration::hours(1);
        let ttl = ttl_remaining(ahead, now, Duration::from_secs(u64::MAX));
        assert_eq!(ttl, chrono::Duration::MAX);

        let mut session = session_with(&[SenderRole::Client]);
        session.last_activity = ahead;
        assert_eq!(
            status_at(&session, now, Duration::from_secs(u64::MAX)),
            SessionStatus::InProgress
        );
    }
}
