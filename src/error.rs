//! Error taxonomy of the synchronization engine

use thiserror::Error;

use crate::models::MessageId;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Request or channel failure. Surfaced as a notice, never retried automatically.
    #[error("Network error: {0}")]
    Network(String),

    /// The bearer credential was rejected. Terminal for the session.
    #[error("Not authorized, session must be re-established")]
    Unauthorized,

    /// Operation on a message that is no longer present locally
    #[error("Stale target: {0}")]
    StaleTarget(String),

    /// Operation not allowed for the current selection
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// An identical send is still awaiting resolution
    #[error("Message {0} with the same content is still pending")]
    DuplicatePending(MessageId),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Decoding error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Failures the user may simply re-initiate
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Failures after which the session cannot continue
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Unauthorized | SyncError::SessionClosed)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            SyncError::Unauthorized
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(ref response) if response.status() == 401 => SyncError::Unauthorized,
            other => SyncError::Network(other.to_string()),
        }
    }
}
