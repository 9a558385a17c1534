//! Live viewer registries, push events and typing state.
//!
//! Each connected socket is represented by the sending half of an unbounded channel; the
//! socket task drains it. Registries are process-local and start empty.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::status::SessionStatus;
use crate::types::{Channel, ChatMessage, SenderRole};

pub type ViewerTx = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerKind {
    /// Embedded web chat widget.
    Client,
    /// Operator console.
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeChangeReason {
    Escalation,
    AnswerFailures,
    Operator,
    ConsultantReply,
    ConsultantSilence,
}

/// Outbound frames, serialized as `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        chat_id: String,
        sender_role: SenderRole,
        message: ChatMessage,
    },
    Typing {
        chat_id: String,
        sender_role: SenderRole,
        is_typing: bool,
    },
    ModeChanged {
        chat_id: String,
        sender_role: SenderRole,
        manual_mode: bool,
        reason: ModeChangeReason,
    },
    RateLimited {
        chat_id: String,
        sender_role: SenderRole,
        retry_after_ms: u64,
        notice: String,
    },
    History {
        chat_id: String,
        manual_mode: bool,
        messages: Vec<ChatMessage>,
    },
    SessionUpdated {
        chat_id: String,
        bot_id: String,
        channel: Channel,
        status: SessionStatus,
        manual_mode: bool,
        last_activity: DateTime<Utc>,
        last_message: Option<ChatMessage>,
    },
}

impl ServerEvent {
    pub fn payload(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Inbound frames from a live viewer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    NewMessage {
        text: String,
        #[serde(default)]
        message_id: Option<String>,
    },
    Typing {
        is_typing: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Viewer {
    pub kind: ViewerKind,
    tx: ViewerTx,
}

/// Live viewers of one chat, keyed by viewer id.
#[derive(Debug, Default)]
pub struct ChatConnections {
    viewers: DashMap<String, Viewer>,
}

impl ChatConnections {
    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    pub fn contains(&self, viewer_id: &str) -> bool {
        self.viewers.contains_key(viewer_id)
    }

    /// Sends to every viewer and drops the ones whose socket is gone. Returns deliveries.
    fn send_all(&self, payload: &str) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.viewers.iter() {
            if entry.tx.send(payload.to_string()).is_ok() {
                delivered += 1;
            } else {
                dead.push((entry.key().clone(), entry.tx.clone()));
            }
        }
        // A reconnect may have replaced the entry meanwhile; only remove the stale sender.
        for (viewer_id, tx) in dead {
            self.viewers
                .remove_if(&viewer_id, |_, viewer| viewer.tx.same_channel(&tx));
            debug!("dropped dead viewer {viewer_id}");
        }
        delivered
    }
}

#[derive(Debug, Default)]
pub struct ConnectionHub {
    chats: DashMap<String, Arc<ChatConnections>>,
    operators: DashMap<String, ViewerTx>,
    /// (chat_id, role) -> active typing sources
    typing: DashMap<(String, SenderRole), usize>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_connection_registry(&self, chat_id: &str) -> Arc<ChatConnections> {
        self.chats.entry(chat_id.to_string()).or_default().clone()
    }

    /// Registers a viewer; a reconnect under the same id replaces the previous socket.
    pub fn connect(&self, chat_id: &str, viewer_id: &str, kind: ViewerKind, tx: ViewerTx) {
        let registry = self.get_connection_registry(chat_id);
        registry
            .viewers
            .insert(viewer_id.to_string(), Viewer { kind, tx });
        debug!("viewer {viewer_id} ({kind:?}) joined chat {chat_id}");
    }

    pub fn disconnect(&self, chat_id: &str, viewer_id: &str) {
        let Some(registry) = self.chats.get(chat_id).map(|r| r.clone()) else {
            return;
        };
        registry.viewers.remove(viewer_id);
        if registry.is_empty() {
            self.chats.remove_if(chat_id, |_, r| r.is_empty());
        }
    }

    /// Same as `disconnect`, but only if `tx` is still the registered socket for the viewer.
    pub fn disconnect_socket(&self, chat_id: &str, viewer_id: &str, tx: &ViewerTx) {
        let Some(registry) = self.chats.get(chat_id).map(|r| r.clone()) else {
            return;
        };
        registry
            .viewers
            .remove_if(viewer_id, |_, viewer| viewer.tx.same_channel(tx));
        if registry.is_empty() {
            self.chats.remove_if(chat_id, |_, r| r.is_empty());
        }
    }

    pub fn broadcast(&self, chat_id: &str, event: &ServerEvent) -> usize {
        let Some(registry) = self.chats.get(chat_id).map(|r| r.clone()) else {
            return 0;
        };
        let Some(payload) = event.payload() else {
            return 0;
        };
        registry.send_all(&payload)
    }

    /// Sends to one viewer only (e.g. history on join).
    pub fn send_to(&self, chat_id: &str, viewer_id: &str, event: &ServerEvent) -> bool {
        let Some(registry) = self.chats.get(chat_id).map(|r| r.clone()) else {
            return false;
        };
        let Some(payload) = event.payload() else {
            return false;
        };
        let Some(tx) = registry.viewers.get(viewer_id).map(|v| v.tx.clone()) else {
            return false;
        };
        tx.send(payload).is_ok()
    }

    pub fn viewer_count(&self, chat_id: &str) -> usize {
        self.chats.get(chat_id).map(|r| r.len()).unwrap_or(0)
    }

    pub fn connect_operator_feed(&self, viewer_id: &str, tx: ViewerTx) {
        self.operators.insert(viewer_id.to_string(), tx);
    }

    pub fn disconnect_operator_feed(&self, viewer_id: &str, tx: &ViewerTx) {
        self.operators
            .remove_if(viewer_id, |_, current| current.same_channel(tx));
    }

    pub fn operator_feed_len(&self) -> usize {
        self.operators.len()
    }

    /// Pushes to every console on the global feed, regardless of which chat it has open.
    pub fn notify_operators(&self, event: &ServerEvent) -> usize {
        let Some(payload) = event.payload() else {
            return 0;
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.operators.iter() {
            if entry.value().send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push((entry.key().clone(), entry.value().clone()));
            }
        }
        for (viewer_id, tx) in dead {
            self.operators
                .remove_if(&viewer_id, |_, current| current.same_channel(&tx));
        }
        delivered
    }

    /// Transient indicator; nothing is stored or deduplicated.
    pub fn typing_indicator(&self, chat_id: &str, sender_role: SenderRole, is_typing: bool) {
        self.broadcast(
            chat_id,
            &ServerEvent::Typing {
                chat_id: chat_id.to_string(),
                sender_role,
                is_typing,
            },
        );
    }

    /// Counted typing source. Emits only on the first start.
    pub fn start_typing(&self, chat_id: &str, sender_role: SenderRole) {
        let became_active = {
            let mut count = self
                .typing
                .entry((chat_id.to_string(), sender_role))
                .or_insert(0);
            *count += 1;
            *count == 1
        };
        if became_active {
            self.typing_indicator(chat_id, sender_role, true);
        }
    }

    /// Emits only when the last source stops.
    pub fn stop_typing(&self, chat_id: &str, sender_role: SenderRole) {
        let key = (chat_id.to_string(), sender_role);
        let became_idle = {
            match self.typing.get_mut(&key) {
                Some(mut count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if became_idle {
            self.typing.remove(&key);
            self.typing_indicator(chat_id, sender_role, false);
        }
    }

    pub fn is_typing(&self, chat_id: &str, sender_role: SenderRole) -> bool {
        self.typing
            .get(&(chat_id.to_string(), sender_role))
            .map(|count| *count > 0)
            .unwrap_or(false)
    }

    /// Drops registries nobody is watching. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.chats.len();
        self.chats.retain(|_, registry| !registry.is_empty());
        self.typing.retain(|_, count| *count > 0);
        before - self.chats.len()
    }
}
