//! Local typing indicator debouncing
//!
//! Input activity turns into a `typing=true` signal right away and a
//! `typing=false` signal once the input has been quiet for the cooldown.
//! The stop signal is a deferred task identified by a token: scheduling a
//! new one or cancelling invalidates the previous token, so a late firing
//! of an outdated timer is a no-op.

use log::debug;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::UserId;

pub const DEFAULT_TYPING_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskToken(u64);

/// A pending `typing=false` emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredStop {
    pub token: TaskToken,
    pub peer: UserId,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub to: UserId,
    pub is_typing: bool,
}

#[derive(Debug)]
pub struct TypingDebouncer {
    cooldown: Duration,
    next_token: u64,
    signaled: Option<UserId>,
    pending: Option<DeferredStop>,
}

impl TypingDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            next_token: 0,
            signaled: None,
            pending: None,
        }
    }

    /// Local input changed while `peer`'s conversation is active
    pub fn on_input(&mut self, peer: UserId, now: Instant) -> Vec<TypingSignal> {
        let mut signals = Vec::new();

        // Input moved to another conversation without an explicit cancel
        if let Some(previous) = self.signaled.filter(|p| *p != peer) {
            signals.push(TypingSignal { to: previous, is_typing: false });
            self.signaled = None;
        }

        if self.signaled.is_none() {
            self.signaled = Some(peer);
            signals.push(TypingSignal { to: peer, is_typing: true });
        }

        let token = TaskToken(self.next_token);
        self.next_token += 1;
        self.pending = Some(DeferredStop {
            token,
            peer,
            deadline: now + self.cooldown,
        });

        signals
    }

    /// Run the deferred stop identified by `token`
    pub fn fire(&mut self, token: TaskToken) -> Option<TypingSignal> {
        match self.pending {
            Some(stop) if stop.token == token => {
                self.pending = None;
                self.signaled = None;
                Some(TypingSignal { to: stop.peer, is_typing: false })
            }
            _ => {
                debug!("Ignoring outdated typing timer {:?}", token);
                None
            }
        }
    }

    /// Fire the pending stop if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.pending {
            Some(stop) if stop.deadline <= now => self.fire(stop.token),
            _ => None,
        }
    }

    /// Focus lost or conversation switched
    pub fn cancel(&mut self) -> Option<TypingSignal> {
        self.pending = None;
        self.signaled
            .take()
            .map(|peer| TypingSignal { to: peer, is_typing: false })
    }

    pub fn pending(&self) -> Option<DeferredStop> {
        self.pending
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.map(|stop| stop.deadline)
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.is_some()
    }
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_COOLDOWN)
    }
}
