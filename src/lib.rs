//! Client-side synchronization engine for a real-time messaging app

pub mod api;
pub mod channel;
pub mod config;
pub mod contacts;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod presence;
pub mod reconcile;
pub mod selection;
pub mod session;
pub mod typing;
pub mod unread;

// Re-export main types for convenience
pub use engine::{Effect, SyncEngine, Ticket};
pub use error::{Result, SyncError};
pub use events::{EngineEvent, EventKind, InboundEvent, OutboundEvent};
pub use models::*;
pub use session::{Session, SessionHandle};
