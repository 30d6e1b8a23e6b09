//! Multi-select mode and bulk deletion policy
//!
//! Selection mode is derived from the selected set: the controller is
//! selecting exactly when at least one message is selected. Only
//! server-confirmed messages can be selected.

use log::debug;
use std::collections::BTreeSet;

use crate::api::ApiRequest;
use crate::error::{Result, SyncError};
use crate::models::{DeletionPolicy, Message, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Idle,
    Selecting,
}

#[derive(Debug, Default)]
pub struct SelectionController {
    selected: BTreeSet<MessageId>,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> SelectionMode {
        if self.selected.is_empty() {
            SelectionMode::Idle
        } else {
            SelectionMode::Selecting
        }
    }

    pub fn is_selecting(&self) -> bool {
        self.mode() == SelectionMode::Selecting
    }

    /// Long press or double activation on a message. Starts selecting with
    /// that message, or toggles it when already selecting.
    pub fn enter(&mut self, id: MessageId) -> bool {
        if self.is_selecting() {
            return self.toggle(id);
        }
        self.insert(id)
    }

    /// Add or remove a message. Returns true if the selection changed.
    /// Emptying the selection returns to idle.
    pub fn toggle(&mut self, id: MessageId) -> bool {
        if self.selected.remove(&id) {
            debug!("Deselected {}, {} left", id, self.selected.len());
            return true;
        }
        self.insert(id)
    }

    /// Explicit cancel. Returns true if anything was selected.
    pub fn cancel(&mut self) -> bool {
        let had_selection = !self.selected.is_empty();
        self.selected.clear();
        had_selection
    }

    /// Drop a message that went away (deleted locally or remotely)
    pub fn remove(&mut self, id: MessageId) -> bool {
        self.selected.remove(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.selected.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn selected_ids(&self) -> Vec<MessageId> {
        self.selected.iter().copied().collect()
    }

    fn insert(&mut self, id: MessageId) -> bool {
        if id.is_placeholder() {
            debug!("Placeholder {} is not selectable", id);
            return false;
        }
        self.selected.insert(id)
    }
}

/// What the user is offered before a deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionPrompt {
    /// Every selected message is our own: soft or hard is up to the user
    Choose { count: usize },
    /// At least one message from someone else: local removal only
    Forced { policy: DeletionPolicy, count: usize, note: String },
}

impl DeletionPrompt {
    pub fn allows(&self, policy: DeletionPolicy) -> bool {
        match self {
            DeletionPrompt::Choose { .. } => true,
            DeletionPrompt::Forced { policy: forced, .. } => *forced == policy,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            DeletionPrompt::Choose { count } | DeletionPrompt::Forced { count, .. } => *count,
        }
    }
}

/// Partition the selected messages into own and others' and decide which
/// deletion policies may be offered
pub fn resolve_deletion_policy(selected: &[&Message], local_user: UserId) -> DeletionPrompt {
    let own = selected.iter().filter(|m| m.is_own(local_user)).count();
    let others = selected.len() - own;

    match (own, others) {
        (own, 0) => DeletionPrompt::Choose { count: own },
        (0, others) => DeletionPrompt::Forced {
            policy: DeletionPolicy::Soft,
            count: others,
            note: if others == 1 {
                "It will still be visible to the sender".to_string()
            } else {
                "They will still be visible to the sender".to_string()
            },
        },
        (own, others) => DeletionPrompt::Forced {
            policy: DeletionPolicy::Soft,
            count: own + others,
            note: "Your sent messages will still be visible to recipients".to_string(),
        },
    }
}

/// Check a chosen policy against the prompt it answers
pub fn validate_policy(prompt: &DeletionPrompt, policy: DeletionPolicy) -> Result<()> {
    if prompt.allows(policy) {
        Ok(())
    } else {
        Err(SyncError::PolicyViolation(format!(
            "{:?} deletion is only available when every selected message is your own",
            policy
        )))
    }
}

/// Single or batch delete request, depending on how many ids are involved
pub fn deletion_request(ids: &[u64], policy: DeletionPolicy) -> Option<ApiRequest> {
    let delete_for_everyone = policy == DeletionPolicy::Hard;
    match ids {
        [] => None,
        [id] => Some(ApiRequest::DeleteOne { id: *id, delete_for_everyone }),
        ids => Some(ApiRequest::DeleteMany { ids: ids.to_vec(), delete_for_everyone }),
    }
}
