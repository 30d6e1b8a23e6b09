//! The synchronization engine
//!
//! `SyncEngine` is the single owner of the conversation state: the active
//! message sequence, selection, unread counters, presence, contacts and the
//! local typing state. It is synchronous and never performs I/O. Every
//! operation runs to completion and leaves behind `Effect`s (outbound push
//! events and API requests) for the driver to carry out; request results come
//! back through `complete` with the ticket they were issued under.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::api::{ApiRequest, ApiResponse, Upload};
use crate::config::SyncConfig;
use crate::contacts::ContactBook;
use crate::delivery::DeliveryTracker;
use crate::error::{Result, SyncError};
use crate::events::{
    DeletionNotice, EngineEvent, EventBus, EventKind, InboundEvent, NoticeLevel, OutboundEvent,
    PresenceNotice, StatusNotice, SubscriptionId, TypingNotice,
};
use crate::models::{
    Contact, DeletionPolicy, MediaKind, Message, MessageBody, MessageId, PresenceStatus, UserId,
    WireMessage,
};
use crate::presence::PresenceRegistry;
use crate::reconcile::{Ingest, MessageLog, Resolution};
use crate::selection::{self, DeletionPrompt, SelectionController};
use crate::typing::{TypingDebouncer, TypingSignal};
use crate::unread::UnreadCounter;

/// Identifies an issued request until its result comes back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// Work the engine asks its driver to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(OutboundEvent),
    Request { ticket: Ticket, request: ApiRequest },
}

#[derive(Debug)]
enum PendingOp {
    Create { conversation_id: UserId, placeholder: MessageId },
    History { conversation_id: UserId },
    Delete { conversation_id: UserId, ids: Vec<MessageId>, policy: DeletionPolicy },
    Contacts,
}

pub struct SyncEngine {
    local_user: UserId,
    active: Option<UserId>,
    visible: bool,
    expired: bool,
    log: Option<MessageLog>,
    delivery: DeliveryTracker,
    unread: UnreadCounter,
    selection: SelectionController,
    typing: TypingDebouncer,
    presence: PresenceRegistry,
    contacts: ContactBook,
    bus: EventBus,
    effects: VecDeque<Effect>,
    in_flight: HashMap<Ticket, PendingOp>,
    next_ticket: u64,
    // Prompt shown for the current selection, with the ids it was computed for
    deletion_prompt: Option<(DeletionPrompt, Vec<MessageId>)>,
}

impl SyncEngine {
    pub fn new(local_user: UserId, typing_cooldown: Duration) -> Self {
        Self {
            local_user,
            active: None,
            visible: true,
            expired: false,
            log: None,
            delivery: DeliveryTracker::new(),
            unread: UnreadCounter::new(),
            selection: SelectionController::new(),
            typing: TypingDebouncer::new(typing_cooldown),
            presence: PresenceRegistry::new(),
            contacts: ContactBook::new(),
            bus: EventBus::new(),
            effects: VecDeque::new(),
            in_flight: HashMap::new(),
            next_ticket: 0,
            deletion_prompt: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.user_id, config.typing_cooldown())
    }

    // ------------------------------------------------------------------
    // Observers and effects
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    /// Drain the effects produced so far, oldest first
    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        self.active
    }

    pub fn messages(&self) -> &[Message] {
        self.log.as_ref().map(|log| log.messages()).unwrap_or(&[])
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.log.as_ref().and_then(|log| log.get(id))
    }

    pub fn unread_count(&self, conversation_id: UserId) -> u32 {
        self.unread.count(conversation_id)
    }

    pub fn selection(&self) -> &SelectionController {
        &self.selection
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn contacts(&self) -> &ContactBook {
        &self.contacts
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.typing.next_deadline()
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Announce ourselves and load the contact list
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.emit(OutboundEvent::UserStatus(PresenceStatus::Online));
        self.request(ApiRequest::ListContacts, PendingOp::Contacts);
        Ok(())
    }

    /// Focus the conversation with `peer_id`.
    ///
    /// The previous sequence and selection are discarded. Requests still in
    /// flight for it are not aborted: their results are dropped, or merged
    /// into the sequence if the same conversation has been reopened by then.
    pub fn select_conversation(&mut self, peer_id: UserId) -> Result<()> {
        self.ensure_open()?;
        let previous = self.active;

        self.cancel_typing();
        self.clear_selection();

        info!("Switching conversation {:?} -> {}", previous, peer_id);
        self.active = Some(peer_id);
        self.log = Some(MessageLog::new(peer_id));
        self.notify(EngineEvent::ConversationChanged { previous, current: peer_id });

        self.request(ApiRequest::FetchHistory { peer_id }, PendingOp::History { conversation_id: peer_id });
        if self.unread.reset(peer_id) {
            self.notify(EngineEvent::UnreadChanged { conversation_id: peer_id, count: 0 });
        }
        Ok(())
    }

    /// Page hidden or shown again
    pub fn set_visibility(&mut self, visible: bool) -> Result<()> {
        self.ensure_open()?;
        self.visible = visible;

        if !visible {
            self.emit(OutboundEvent::UserStatus(PresenceStatus::Away));
            return Ok(());
        }

        self.emit(OutboundEvent::UserStatus(PresenceStatus::Online));
        if let Some(active) = self.active {
            if self.unread.reset(active) {
                self.notify(EngineEvent::UnreadChanged { conversation_id: active, count: 0 });
            }
        }
        Ok(())
    }

    pub fn on_connected(&mut self) {
        info!("Push channel connected");
        self.notify(EngineEvent::notice(NoticeLevel::Success, "Connected"));
    }

    pub fn on_disconnected(&mut self, reason: &str) {
        warn!("Push channel disconnected: {}", reason);
        self.notify(EngineEvent::notice(NoticeLevel::Error, "Connection lost. Restart the session to reconnect"));
    }

    pub fn on_connect_error(&mut self, reason: &str) {
        warn!("Push channel connection error: {}", reason);
        self.notify(EngineEvent::notice(NoticeLevel::Error, "Connection error"));
    }

    /// The credential was rejected. Terminal: state is dropped and nothing
    /// else is accepted.
    pub fn expire(&mut self) {
        if self.expired {
            return;
        }
        warn!("Session for user {} expired", self.local_user);
        self.expired = true;
        self.typing.cancel();
        self.selection.cancel();
        self.deletion_prompt = None;
        self.log = None;
        self.active = None;
        self.in_flight.clear();
        self.effects.clear();
        self.notify(EngineEvent::SessionExpired);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Optimistically append a text message and request its creation.
    /// Returns the placeholder id immediately.
    pub fn send_text(&mut self, text: &str) -> Result<MessageId> {
        let receiver_id = self.active_peer()?;
        let placeholder = self.append_optimistic(MessageBody::text(text))?;
        self.request(
            ApiRequest::SendText { receiver_id, body: text.to_string() },
            PendingOp::Create { conversation_id: receiver_id, placeholder },
        );
        Ok(placeholder)
    }

    /// Optimistically append an attachment produced by the upload layer
    pub fn send_attachment(&mut self, upload: Upload, kind: MediaKind) -> Result<MessageId> {
        let receiver_id = self.active_peer()?;
        let body = MessageBody::Attachment {
            url: format!("local://{}", upload.file_name),
            kind,
        };
        let request = match kind {
            MediaKind::Image => ApiRequest::SendImage { receiver_id, upload },
            MediaKind::Audio => ApiRequest::SendAudio { receiver_id, upload },
            MediaKind::File => {
                let text = "Only image and audio attachments can be sent";
                self.notify(EngineEvent::notice(NoticeLevel::Error, text));
                return Err(SyncError::PolicyViolation(text.to_string()));
            }
        };

        let placeholder = self.append_optimistic(body)?;
        self.request(request, PendingOp::Create { conversation_id: receiver_id, placeholder });
        Ok(placeholder)
    }

    fn append_optimistic(&mut self, body: MessageBody) -> Result<MessageId> {
        let local_user = self.local_user;
        let log = self.log.as_mut().ok_or(SyncError::NoActiveConversation)?;
        let id = match log.append_optimistic(local_user, body, Utc::now()) {
            Ok(id) => id,
            Err(e) => {
                self.notify(EngineEvent::notice(
                    NoticeLevel::Info,
                    "An identical message is still being sent",
                ));
                return Err(e);
            }
        };
        if let Some(message) = log.get(id).cloned() {
            self.notify(EngineEvent::MessageAppended(message));
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Request completions
    // ------------------------------------------------------------------

    /// Feed back the result of a request issued under `ticket`
    pub fn complete(&mut self, ticket: Ticket, result: Result<ApiResponse>) {
        let Some(op) = self.in_flight.remove(&ticket) else {
            debug!("Result for unknown ticket {:?}, ignoring", ticket);
            return;
        };

        if let Err(SyncError::Unauthorized) = result {
            self.expire();
            return;
        }

        match (op, result) {
            (PendingOp::Create { conversation_id, placeholder }, Ok(ApiResponse::Created(wire))) => {
                self.on_created(conversation_id, placeholder, wire)
            }
            (PendingOp::Create { conversation_id, placeholder }, Err(e)) => {
                self.on_create_failed(conversation_id, placeholder, e)
            }
            (PendingOp::History { conversation_id }, Ok(ApiResponse::History(history))) => {
                self.on_history(conversation_id, history)
            }
            (PendingOp::History { conversation_id }, Err(e)) => {
                warn!("Failed to load history for {}: {}", conversation_id, e);
                self.notify(EngineEvent::notice(NoticeLevel::Error, "Failed to load messages"));
            }
            (PendingOp::Delete { conversation_id, ids, policy }, Ok(ApiResponse::Deleted)) => {
                self.on_deleted(conversation_id, ids, policy)
            }
            (PendingOp::Delete { ids, .. }, Err(e)) => {
                warn!("Failed to delete {} message(s): {}", ids.len(), e);
                self.notify(EngineEvent::notice(NoticeLevel::Error, "Failed to delete messages"));
            }
            (PendingOp::Contacts, Ok(ApiResponse::Contacts(contacts))) => self.on_contacts(contacts),
            (PendingOp::Contacts, Err(e)) => {
                warn!("Failed to load contacts: {}", e);
                self.notify(EngineEvent::notice(NoticeLevel::Error, "Failed to load contacts"));
            }
            (op, Ok(response)) => warn!("Unexpected response {:?} for {:?}", response, op),
        }
    }

    fn on_created(&mut self, conversation_id: UserId, placeholder: MessageId, wire: WireMessage) {
        let confirmed = wire.into_message(self.local_user);
        let Some(log) = self.log.as_mut().filter(|log| log.conversation_id() == conversation_id) else {
            info!("Conversation {} no longer open, dropping {}", conversation_id, confirmed.id);
            return;
        };

        let event = match log.resolve(placeholder, confirmed.clone()) {
            Resolution::Rebound(id) => log.get(id).cloned().map(EngineEvent::MessageUpdated),
            Resolution::Merged { removed } => Some(EngineEvent::MessageRemoved { conversation_id, id: removed }),
            // Conversation was reopened since the send; the placeholder went with the old sequence
            Resolution::Stale => match log.ingest(confirmed.clone()) {
                Ingest::Appended => Some(EngineEvent::MessageAppended(confirmed)),
                Ingest::Duplicate => None,
            },
        };
        if let Some(event) = event {
            self.notify(event);
        }
    }

    fn on_create_failed(&mut self, conversation_id: UserId, placeholder: MessageId, error: SyncError) {
        warn!("Failed to send {}: {}", placeholder, error);
        let failed = self
            .log
            .as_mut()
            .filter(|log| log.conversation_id() == conversation_id)
            .and_then(|log| log.fail(placeholder).cloned());
        if let Some(message) = failed {
            self.notify(EngineEvent::MessageUpdated(message));
        }
        self.notify(EngineEvent::notice(NoticeLevel::Error, "Failed to send message"));
    }

    fn on_history(&mut self, conversation_id: UserId, history: Vec<WireMessage>) {
        let local_user = self.local_user;
        let Some(log) = self.log.as_mut().filter(|log| log.conversation_id() == conversation_id) else {
            debug!("History for {} arrived after switching away, dropping", conversation_id);
            return;
        };
        let messages = history.into_iter().map(|w| w.into_message(local_user)).collect();
        let count = log.load_history(messages);
        info!("Loaded {} historical messages for {}", count, conversation_id);
        self.notify(EngineEvent::HistoryLoaded { conversation_id, count });
        self.emit(OutboundEvent::MessageRead { partner_id: conversation_id });
    }

    fn on_deleted(&mut self, conversation_id: UserId, ids: Vec<MessageId>, policy: DeletionPolicy) {
        let count = ids.len();
        for id in ids {
            self.remove_locally(conversation_id, id);
        }

        let text = match (policy, count) {
            (DeletionPolicy::Hard, 1) => "Message deleted for everyone".to_string(),
            (DeletionPolicy::Hard, n) => format!("{} messages deleted for everyone", n),
            (DeletionPolicy::Soft, 1) => "Message removed from your chat".to_string(),
            (DeletionPolicy::Soft, n) => format!("{} messages removed from your chat", n),
        };
        self.notify(EngineEvent::notice(NoticeLevel::Success, text));
    }

    fn on_contacts(&mut self, contacts: Vec<Contact>) {
        for contact in &contacts {
            self.presence.on_presence_event(contact.id, contact.status);
        }
        let count = contacts.len();
        self.contacts.replace(contacts);
        self.notify(EngineEvent::ContactsChanged { count });
    }

    // ------------------------------------------------------------------
    // Push events
    // ------------------------------------------------------------------

    /// Apply one inbound push event. Events are applied in arrival order.
    pub fn handle_inbound(&mut self, event: InboundEvent) {
        if self.expired {
            debug!("Session expired, ignoring {:?}", event);
            return;
        }

        match event {
            InboundEvent::ChatMessage(wire) => self.ingest(wire),
            InboundEvent::MessageStatus(StatusNotice { id, status }) => {
                let updated = self
                    .log
                    .as_mut()
                    .and_then(|log| self.delivery.apply(log, MessageId::Server(id), status));
                if let Some(message) = updated {
                    self.notify(EngineEvent::MessageUpdated(message));
                }
            }
            InboundEvent::Typing(TypingNotice { from, is_typing }) => {
                if self.active == Some(from) {
                    self.notify(EngineEvent::PeerTyping { peer_id: from, is_typing });
                } else {
                    debug!("Typing from inactive conversation {}, ignoring", from);
                }
            }
            InboundEvent::Presence(PresenceNotice { user_id, status }) => {
                if self.presence.on_presence_event(user_id, status) {
                    self.contacts.set_status(user_id, status);
                    self.notify(EngineEvent::PresenceChanged { user_id, status });
                }
            }
            InboundEvent::ContactsUpdate(contacts) => self.on_contacts(contacts),
            InboundEvent::MessageDeleted(DeletionNotice { message_id, sender_id, deletion_type }) => {
                let Some(conversation_id) = self.active else {
                    return;
                };
                let removed = self.remove_locally(conversation_id, MessageId::Server(message_id));
                if removed && sender_id != self.local_user && deletion_type == DeletionPolicy::Hard {
                    self.notify(EngineEvent::notice(NoticeLevel::Info, "A message was deleted by sender"));
                }
            }
        }
    }

    /// Push-originated message, from the peer or an echo of our own
    fn ingest(&mut self, wire: WireMessage) {
        let conversation_id = wire.conversation_id(self.local_user);
        let server_id = wire.id;
        let own = wire.sender_id == self.local_user;

        if !own && self.delivery.should_confirm(server_id) {
            self.emit(OutboundEvent::MessageDelivered { message_id: server_id });
        }

        let message = wire.into_message(self.local_user);
        match self.log.as_mut().filter(|log| log.conversation_id() == conversation_id) {
            Some(log) => {
                if log.ingest(message.clone()) == Ingest::Appended {
                    self.notify(EngineEvent::MessageAppended(message));
                    if !own && self.visible {
                        self.emit(OutboundEvent::MessageRead { partner_id: conversation_id });
                    }
                }
            }
            None if !own => {
                if let Some(count) = self.unread.on_inbound(conversation_id, self.active) {
                    self.notify(EngineEvent::UnreadChanged { conversation_id, count });
                }
            }
            None => debug!("Own message {} for closed conversation {}", server_id, conversation_id),
        }
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Local input changed in the active conversation
    pub fn on_input(&mut self, now: Instant) -> Result<()> {
        let peer = self.active_peer()?;
        let signals = self.typing.on_input(peer, now);
        for signal in signals {
            self.emit_typing(signal);
        }
        Ok(())
    }

    /// Fire the typing stop if its cooldown has elapsed
    pub fn on_typing_deadline(&mut self, now: Instant) {
        if let Some(signal) = self.typing.poll(now) {
            self.emit_typing(signal);
        }
    }

    /// Input lost focus
    pub fn on_blur(&mut self) {
        self.cancel_typing();
    }

    fn cancel_typing(&mut self) {
        if let Some(signal) = self.typing.cancel() {
            self.emit_typing(signal);
        }
    }

    fn emit_typing(&mut self, signal: TypingSignal) {
        self.emit(OutboundEvent::Typing { to: signal.to, is_typing: signal.is_typing });
    }

    // ------------------------------------------------------------------
    // Selection and deletion
    // ------------------------------------------------------------------

    /// Long press or double activation on a message
    pub fn enter_selection(&mut self, id: MessageId) -> bool {
        if !self.is_selectable(id) {
            return false;
        }
        let changed = self.selection.enter(id);
        self.after_selection_change(changed);
        changed
    }

    pub fn toggle_selection(&mut self, id: MessageId) -> bool {
        if !self.selection.contains(id) && !self.is_selectable(id) {
            return false;
        }
        let changed = self.selection.toggle(id);
        self.after_selection_change(changed);
        changed
    }

    pub fn cancel_selection(&mut self) {
        self.clear_selection();
    }

    /// Work out which deletion policies may be offered for the selection
    pub fn request_deletion(&mut self) -> Result<DeletionPrompt> {
        self.ensure_open()?;
        let ids = self.selection.selected_ids();
        let selected: Vec<&Message> = ids.iter().filter_map(|id| self.message(*id)).collect();
        if selected.is_empty() {
            return Err(SyncError::PolicyViolation("No messages selected".to_string()));
        }

        let prompt = selection::resolve_deletion_policy(&selected, self.local_user);
        self.deletion_prompt = Some((prompt.clone(), ids));
        Ok(prompt)
    }

    /// Answer the last prompt with the chosen policy
    pub fn confirm_deletion(&mut self, policy: DeletionPolicy) -> Result<Ticket> {
        let (prompt, ids) = match self.deletion_prompt.take() {
            Some(pending) => pending,
            None => {
                self.request_deletion()?;
                self.deletion_prompt
                    .take()
                    .ok_or_else(|| SyncError::PolicyViolation("No messages selected".to_string()))?
            }
        };
        selection::validate_policy(&prompt, policy)?;
        self.apply_deletion(ids, policy)
    }

    /// Issue a single or batch delete. The messages stay until the server
    /// acknowledges.
    pub fn apply_deletion(&mut self, ids: Vec<MessageId>, policy: DeletionPolicy) -> Result<Ticket> {
        let conversation_id = self.active_peer()?;

        if let Some(missing) = ids.iter().find(|id| self.message(**id).is_none()) {
            return Err(SyncError::StaleTarget(missing.to_string()));
        }
        if policy == DeletionPolicy::Hard {
            let foreign = ids
                .iter()
                .any(|id| self.message(*id).map_or(false, |m| !m.is_own(self.local_user)));
            if foreign {
                return Err(SyncError::PolicyViolation(
                    "Only your own messages can be deleted for everyone".to_string(),
                ));
            }
        }

        let server_ids: Vec<u64> = ids.iter().filter_map(|id| id.server_id()).collect();
        if server_ids.len() != ids.len() {
            return Err(SyncError::PolicyViolation("Pending messages cannot be deleted".to_string()));
        }
        let request = selection::deletion_request(&server_ids, policy)
            .ok_or_else(|| SyncError::PolicyViolation("No messages selected".to_string()))?;

        info!("Deleting {} message(s) ({:?})", ids.len(), policy);
        Ok(self.request(request, PendingOp::Delete { conversation_id, ids, policy }))
    }

    fn is_selectable(&self, id: MessageId) -> bool {
        !id.is_placeholder() && self.message(id).is_some()
    }

    fn clear_selection(&mut self) {
        self.deletion_prompt = None;
        let changed = self.selection.cancel();
        self.after_selection_change(changed);
    }

    fn after_selection_change(&mut self, changed: bool) {
        if !changed {
            return;
        }
        self.deletion_prompt = None;
        self.notify(EngineEvent::SelectionChanged {
            mode: self.selection.mode(),
            selected: self.selection.len(),
        });
    }

    /// Drop a message from the sequence and the selection
    fn remove_locally(&mut self, conversation_id: UserId, id: MessageId) -> bool {
        let removed = self
            .log
            .as_mut()
            .filter(|log| log.conversation_id() == conversation_id)
            .and_then(|log| log.remove(id))
            .is_some();
        if removed {
            self.notify(EngineEvent::MessageRemoved { conversation_id, id });
        }
        let deselected = self.selection.remove(id);
        self.after_selection_change(deselected);
        removed
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        if self.expired {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn active_peer(&self) -> Result<UserId> {
        self.ensure_open()?;
        self.active.ok_or(SyncError::NoActiveConversation)
    }

    fn emit(&mut self, event: OutboundEvent) {
        self.effects.push_back(Effect::Emit(event));
    }

    fn request(&mut self, request: ApiRequest, op: PendingOp) -> Ticket {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight.insert(ticket, op);
        self.effects.push_back(Effect::Request { ticket, request });
        ticket
    }

    fn notify(&mut self, event: EngineEvent) {
        self.bus.emit(&event);
    }
}
