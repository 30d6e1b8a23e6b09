//! Conversation data model and the JSON wire message

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a user (also the id of the conversation with that user)
pub type UserId = u64;

static IMAGE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.(jpg|jpeg|png|gif)$").unwrap());
static AUDIO_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.(mp3|wav|ogg)$").unwrap());

/// Identity of a message in a conversation sequence.
///
/// A message is either a local placeholder (created optimistically, never
/// sent over the wire) or carries the id assigned by the server. The two
/// namespaces can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    Placeholder(Uuid),
    Server(u64),
}

impl MessageId {
    pub fn new_placeholder() -> Self {
        MessageId::Placeholder(Uuid::new_v4())
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, MessageId::Placeholder(_))
    }

    pub fn server_id(&self) -> Option<u64> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Placeholder(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Placeholder(uuid) => write!(f, "temp-{}", uuid),
            MessageId::Server(id) => write!(f, "{}", id),
        }
    }
}

/// Kind of an uploaded attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    File,
}

impl MediaKind {
    /// Guess the media kind from the extension of an attachment URL
    pub fn from_url(url: &str) -> Self {
        if IMAGE_URL.is_match(url) {
            MediaKind::Image
        } else if AUDIO_URL.is_match(url) {
            MediaKind::Audio
        } else {
            MediaKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Attachment { url: String, kind: MediaKind },
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Self {
        MessageBody::Text(content.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Attachment { .. } => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,   // Created locally, create request in flight
    Sent,      // Confirmed by the server
    Delivered, // Reached the recipient's client
    Read,      // Seen by the recipient
    Failed,    // Create request failed
}

impl DeliveryStatus {
    /// Position in the forward-only lifecycle. `Failed` sits outside of it.
    pub(crate) fn rank(self) -> Option<u8> {
        match self {
            DeliveryStatus::Pending => Some(0),
            DeliveryStatus::Sent => Some(1),
            DeliveryStatus::Delivered => Some(2),
            DeliveryStatus::Read => Some(3),
            DeliveryStatus::Failed => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: UserId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Message {
    pub fn is_own(&self, local_user: UserId) -> bool {
        self.sender_id == local_user
    }
}

/// Message as it travels over the request/response and push channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub id: u64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

impl WireMessage {
    /// Id of the peer this message belongs to, seen from `local_user`
    pub fn conversation_id(&self, local_user: UserId) -> UserId {
        if self.sender_id == local_user {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    pub fn into_message(self, local_user: UserId) -> Message {
        let conversation_id = self.conversation_id(local_user);
        let body = match self.file_url {
            Some(url) => MessageBody::Attachment {
                kind: MediaKind::from_url(&url),
                url,
            },
            None => MessageBody::Text(self.message.unwrap_or_default()),
        };

        Message {
            id: MessageId::Server(self.id),
            conversation_id,
            sender_id: self.sender_id,
            body,
            timestamp: self.timestamp,
            status: self.status.unwrap_or(DeliveryStatus::Sent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub status: PresenceStatus,
}

/// How a deletion applies to the other participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    Soft, // Local view only
    Hard, // Every participant, irreversible
}
