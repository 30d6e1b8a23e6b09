//! Presence tracking for contacts
//! Presence is approximate: the most recent event for a user always wins.

use log::debug;
use std::collections::HashMap;

use crate::models::{PresenceStatus, UserId};

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    statuses: HashMap<UserId, PresenceStatus>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence event. Returns true if the visible status changed.
    pub fn on_presence_event(&mut self, user_id: UserId, status: PresenceStatus) -> bool {
        let previous = self.statuses.insert(user_id, status);
        debug!("Presence for {}: {:?} -> {}", user_id, previous, status);
        previous != Some(status)
    }

    /// Status of a user, `Offline` when nothing was heard yet
    pub fn status(&self, user_id: UserId) -> PresenceStatus {
        self.statuses.get(&user_id).copied().unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.status(user_id) == PresenceStatus::Online
    }

    pub fn online_users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == PresenceStatus::Online)
            .map(|(id, _)| *id)
    }
}
