//! Typed events crossing the engine boundary
//!
//! `InboundEvent` and `OutboundEvent` are the push channel vocabulary, framed
//! on the wire as `{"event": "<name>", "data": <payload>}`. `EngineEvent` is what
//! the engine reports to the presentation layer through the `EventBus`.

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{
    Contact, DeletionPolicy, DeliveryStatus, Message, MessageId, PresenceStatus, UserId,
    WireMessage,
};
use crate::selection::SelectionMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    ChatMessage(WireMessage),
    MessageStatus(StatusNotice),
    Typing(TypingNotice),
    Presence(PresenceNotice),
    ContactsUpdate(Vec<Contact>),
    MessageDeleted(DeletionNotice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotice {
    #[serde(alias = "messageId")]
    pub id: u64,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub from: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionNotice {
    pub message_id: u64,
    pub sender_id: UserId,
    pub deletion_type: DeletionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    MessageRead { partner_id: UserId },
    #[serde(rename_all = "camelCase")]
    MessageDelivered { message_id: u64 },
    #[serde(rename_all = "camelCase")]
    Typing { to: UserId, is_typing: bool },
    UserStatus(PresenceStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// State changes reported to the presentation layer
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageAppended(Message),
    MessageUpdated(Message),
    MessageRemoved { conversation_id: UserId, id: MessageId },
    HistoryLoaded { conversation_id: UserId, count: usize },
    ConversationChanged { previous: Option<UserId>, current: UserId },
    UnreadChanged { conversation_id: UserId, count: u32 },
    SelectionChanged { mode: SelectionMode, selected: usize },
    PeerTyping { peer_id: UserId, is_typing: bool },
    PresenceChanged { user_id: UserId, status: PresenceStatus },
    ContactsChanged { count: usize },
    Notice { level: NoticeLevel, text: String },
    SessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    History,
    Conversation,
    Unread,
    Selection,
    Typing,
    Presence,
    Contacts,
    Notice,
    Session,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::MessageAppended(_)
            | EngineEvent::MessageUpdated(_)
            | EngineEvent::MessageRemoved { .. } => EventKind::Message,
            EngineEvent::HistoryLoaded { .. } => EventKind::History,
            EngineEvent::ConversationChanged { .. } => EventKind::Conversation,
            EngineEvent::UnreadChanged { .. } => EventKind::Unread,
            EngineEvent::SelectionChanged { .. } => EventKind::Selection,
            EngineEvent::PeerTyping { .. } => EventKind::Typing,
            EngineEvent::PresenceChanged { .. } => EventKind::Presence,
            EngineEvent::ContactsChanged { .. } => EventKind::Contacts,
            EngineEvent::Notice { .. } => EventKind::Notice,
            EngineEvent::SessionExpired => EventKind::Session,
        }
    }

    pub(crate) fn notice(level: NoticeLevel, text: impl Into<String>) -> Self {
        EngineEvent::Notice { level, text: text.into() }
    }
}

pub type Handler = Box<dyn FnMut(&EngineEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

/// Observer registry. Handlers run synchronously, in subscription order.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one kind of event
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.register(Some(kind), Box::new(handler))
    }

    /// Register a handler for every event
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.register(None, Box::new(handler))
    }

    /// Forward events into a channel, for consumers living on another task
    pub fn subscribe_channel(&mut self, kind: Option<EventKind>) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(
            kind,
            Box::new(move |event: &EngineEvent| {
                if tx.send(event.clone()).is_err() {
                    debug!("Event receiver dropped, discarding {:?}", event.kind());
                }
            }),
        );
        rx
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub fn emit(&mut self, event: &EngineEvent) {
        let kind = event.kind();
        for sub in self.subscriptions.iter_mut() {
            if sub.kind.map_or(true, |k| k == kind) {
                (sub.handler)(event);
            }
        }
    }

    fn register(&mut self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription { id, kind, handler });
        id
    }
}
