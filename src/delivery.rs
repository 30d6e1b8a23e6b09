//! Delivery status lifecycle
//!
//! pending -> sent -> delivered -> read, with failed reachable only from
//! pending. Status never moves backward and failed is absorbing.

use log::{debug, info};
use std::collections::{HashSet, VecDeque};

use crate::models::{DeliveryStatus, Message, MessageId};
use crate::reconcile::MessageLog;

/// Whether `current` may move to `next`
pub fn can_transition(current: DeliveryStatus, next: DeliveryStatus) -> bool {
    match (current, next) {
        (DeliveryStatus::Pending, DeliveryStatus::Failed) => true,
        (_, DeliveryStatus::Failed) | (DeliveryStatus::Failed, _) => false,
        (current, next) => match (current.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        },
    }
}

/// How many recently confirmed server ids are remembered
pub const CONFIRMED_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct DeliveryTracker {
    // Inbound peer messages we already confirmed as delivered, oldest first
    confirmed: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::with_capacity(CONFIRMED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            confirmed: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Apply a status acknowledgement to a message in `log`.
    ///
    /// Unknown ids (deleted locally, or never loaded) and backward moves are
    /// ignored. Returns the updated message when the status changed.
    pub fn apply(&self, log: &mut MessageLog, id: MessageId, next: DeliveryStatus) -> Option<Message> {
        let Some(status) = log.status_mut(id) else {
            debug!("Status {:?} for unknown message {}, ignoring", next, id);
            return None;
        };

        if !can_transition(*status, next) {
            debug!("Ignoring status move {:?} -> {:?} for {}", status, next, id);
            return None;
        }

        info!("Message {} status {:?} -> {:?}", id, status, next);
        *status = next;
        log.get(id).cloned()
    }

    /// Whether a delivery confirmation still has to be sent for an inbound
    /// message. Each recent server id is confirmed once; the oldest ids are
    /// forgotten past `capacity`.
    pub fn should_confirm(&mut self, server_id: u64) -> bool {
        if !self.confirmed.insert(server_id) {
            return false;
        }
        self.order.push_back(server_id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.confirmed.remove(&oldest);
            }
        }
        true
    }

    pub fn remembered(&self) -> usize {
        self.order.len()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}
