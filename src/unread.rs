//! Per-conversation unread counters

use std::collections::HashMap;

use crate::models::UserId;

#[derive(Debug, Default)]
pub struct UnreadCounter {
    counts: HashMap<UserId, u32>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an inbound peer message. Messages for the active conversation
    /// are treated as read and leave the counters untouched.
    ///
    /// Returns the new count when it changed.
    pub fn on_inbound(&mut self, conversation_id: UserId, active: Option<UserId>) -> Option<u32> {
        if active == Some(conversation_id) {
            return None;
        }
        let count = self.counts.entry(conversation_id).or_insert(0);
        *count = count.saturating_add(1);
        Some(*count)
    }

    /// Conversation focused or view restored. Returns true if there was
    /// anything to clear.
    pub fn reset(&mut self, conversation_id: UserId) -> bool {
        self.counts
            .remove(&conversation_id)
            .map_or(false, |count| count > 0)
    }

    pub fn count(&self, conversation_id: UserId) -> u32 {
        self.counts.get(&conversation_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}
