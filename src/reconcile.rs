//! Message reconciliation
//!
//! `MessageLog` owns the ordered message sequence of one conversation. Local
//! sends are appended optimistically under a placeholder id and later rebound
//! to the server-confirmed message; push-originated messages are appended in
//! arrival order and deduplicated by server id.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;

use crate::error::{Result, SyncError};
use crate::models::{DeliveryStatus, Message, MessageBody, MessageId, UserId};

/// Result of rebinding a placeholder to its server-confirmed message
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Placeholder replaced in place
    Rebound(MessageId),
    /// The server message had already arrived over the push channel; the
    /// placeholder was dropped in its favour
    Merged { removed: MessageId },
    /// Placeholder no longer in the sequence, server message dropped
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Appended,
    Duplicate,
}

#[derive(Debug)]
pub struct MessageLog {
    conversation_id: UserId,
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new(conversation_id: UserId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> UserId {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Insert a pending local message at the tail and return its placeholder id.
    ///
    /// Only one text placeholder per sender and body may await resolution at
    /// a time. Attachments are only known by file name locally, so they are
    /// never treated as duplicates.
    pub fn append_optimistic(
        &mut self,
        sender_id: UserId,
        body: MessageBody,
        now: DateTime<Utc>,
    ) -> Result<MessageId> {
        if let MessageBody::Text(_) = body {
            if let Some(existing) = self.messages.iter().find(|m| {
                m.id.is_placeholder()
                    && m.status == DeliveryStatus::Pending
                    && m.sender_id == sender_id
                    && m.body == body
            }) {
                return Err(SyncError::DuplicatePending(existing.id));
            }
        }

        let id = MessageId::new_placeholder();
        self.messages.push(Message {
            id,
            conversation_id: self.conversation_id,
            sender_id,
            body,
            timestamp: now,
            status: DeliveryStatus::Pending,
        });
        debug!("Appended placeholder {} to conversation {}", id, self.conversation_id);
        Ok(id)
    }

    /// Replace a placeholder with the server-confirmed message, keeping its position
    pub fn resolve(&mut self, placeholder: MessageId, confirmed: Message) -> Resolution {
        let Some(index) = self.position(placeholder) else {
            info!(
                "Placeholder {} is gone, dropping confirmed message {}",
                placeholder, confirmed.id
            );
            return Resolution::Stale;
        };

        // The echo may have been ingested before the create response came back
        if self.contains(confirmed.id) {
            self.messages.remove(index);
            debug!("Placeholder {} merged into already ingested {}", placeholder, confirmed.id);
            return Resolution::Merged { removed: placeholder };
        }

        let id = confirmed.id;
        self.messages[index] = Message {
            status: DeliveryStatus::Sent,
            ..confirmed
        };
        debug!("Placeholder {} rebound to {}", placeholder, id);
        Resolution::Rebound(id)
    }

    /// Mark a pending placeholder as failed. Nothing is resent.
    pub fn fail(&mut self, placeholder: MessageId) -> Option<&Message> {
        let index = self.position(placeholder)?;
        let message = &mut self.messages[index];
        if message.status != DeliveryStatus::Pending {
            warn!("Not failing {} in state {:?}", placeholder, message.status);
            return None;
        }
        message.status = DeliveryStatus::Failed;
        Some(&self.messages[index])
    }

    /// Append a push-originated message unless its server id is already present
    pub fn ingest(&mut self, message: Message) -> Ingest {
        if self.contains(message.id) {
            debug!("Message {} already present, ignoring", message.id);
            return Ingest::Duplicate;
        }
        self.messages.push(message);
        Ingest::Appended
    }

    /// Load fetched history. History goes first; entries that arrived while the
    /// fetch was in flight keep their relative order after it.
    pub fn load_history(&mut self, history: Vec<Message>) -> usize {
        let mut seen = HashSet::new();
        let mut merged: Vec<Message> = Vec::with_capacity(history.len() + self.messages.len());
        for message in history {
            if seen.insert(message.id) {
                merged.push(message);
            }
        }
        let loaded = merged.len();

        for message in self.messages.drain(..) {
            if seen.insert(message.id) {
                merged.push(message);
            }
        }
        self.messages = merged;
        loaded
    }

    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.position(id)?;
        Some(self.messages.remove(index))
    }

    /// Narrow status mutation for the delivery tracker
    pub(crate) fn status_mut(&mut self, id: MessageId) -> Option<&mut DeliveryStatus> {
        let index = self.position(id)?;
        Some(&mut self.messages[index].status)
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}
