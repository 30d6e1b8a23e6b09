// Common test utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use log::LevelFilter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use nchat_sync::api::{ApiRequest, ApiResponse, ChatApi, Upload};
use nchat_sync::{
    Contact, Effect, EngineEvent, OutboundEvent, PresenceStatus, Result, SyncEngine, SyncError,
    Ticket, UserId, WireMessage,
};

pub const ME: UserId = 1;
pub const ALICE: UserId = 2;
pub const BOB: UserId = 3;

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn engine() -> SyncEngine {
    setup_logging();
    SyncEngine::new(ME, Duration::from_secs(1))
}

pub fn wire(id: u64, sender_id: UserId, receiver_id: UserId, text: &str) -> WireMessage {
    WireMessage {
        id,
        sender_id,
        receiver_id,
        message: Some(text.to_string()),
        file_url: None,
        timestamp: Utc::now(),
        status: None,
    }
}

pub fn contact(id: UserId, username: &str) -> Contact {
    Contact {
        id,
        username: username.to_string(),
        email: format!("{}@example.com", username),
        status: PresenceStatus::Offline,
    }
}

/// Split drained effects into emitted events and issued requests
pub fn drain(engine: &mut SyncEngine) -> (Vec<OutboundEvent>, Vec<(Ticket, ApiRequest)>) {
    let mut emitted = Vec::new();
    let mut requests = Vec::new();
    for effect in engine.take_effects() {
        match effect {
            Effect::Emit(event) => emitted.push(event),
            Effect::Request { ticket, request } => requests.push((ticket, request)),
        }
    }
    (emitted, requests)
}

/// Record every engine event
pub fn record(engine: &mut SyncEngine) -> Arc<Mutex<Vec<EngineEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.events_mut().subscribe_all(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// In-memory request/response implementation
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    local_user: UserId,
    history: HashMap<UserId, Vec<WireMessage>>,
    contacts: Vec<Contact>,
    fail_sends: bool,
    unauthorized: bool,
    calls: Vec<ApiRequest>,
}

impl FakeApi {
    pub fn new(local_user: UserId) -> Arc<Self> {
        Arc::new(FakeApi {
            state: Mutex::new(FakeState {
                next_id: 100,
                local_user,
                ..Default::default()
            }),
        })
    }

    pub fn set_history(&self, peer_id: UserId, history: Vec<WireMessage>) {
        self.state.lock().unwrap().history.insert(peer_id, history);
    }

    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        self.state.lock().unwrap().contacts = contacts;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    pub fn reject_credential(&self) {
        self.state.lock().unwrap().unauthorized = true;
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, request: ApiRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(request);
        if state.unauthorized {
            return Err(SyncError::Unauthorized);
        }
        Ok(())
    }

    fn create(&self, receiver_id: UserId, message: Option<String>, file_url: Option<String>) -> Result<WireMessage> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        state.next_id += 1;
        Ok(WireMessage {
            id: state.next_id,
            sender_id: state.local_user,
            receiver_id,
            message,
            file_url,
            timestamp: Utc::now(),
            status: None,
        })
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_history(&self, peer_id: UserId) -> Result<Vec<WireMessage>> {
        self.record(ApiRequest::FetchHistory { peer_id })?;
        Ok(self.state.lock().unwrap().history.get(&peer_id).cloned().unwrap_or_default())
    }

    async fn send_text(&self, receiver_id: UserId, body: &str) -> Result<WireMessage> {
        self.record(ApiRequest::SendText { receiver_id, body: body.to_string() })?;
        self.create(receiver_id, Some(body.to_string()), None)
    }

    async fn send_image(&self, receiver_id: UserId, upload: &Upload) -> Result<WireMessage> {
        self.record(ApiRequest::SendImage { receiver_id, upload: upload.clone() })?;
        self.create(receiver_id, None, Some(format!("/uploads/{}", upload.file_name)))
    }

    async fn send_audio(&self, receiver_id: UserId, upload: &Upload) -> Result<WireMessage> {
        self.record(ApiRequest::SendAudio { receiver_id, upload: upload.clone() })?;
        self.create(receiver_id, None, Some(format!("/uploads/{}", upload.file_name)))
    }

    async fn delete_message(&self, id: u64, delete_for_everyone: bool) -> Result<()> {
        self.record(ApiRequest::DeleteOne { id, delete_for_everyone })
    }

    async fn delete_messages(&self, ids: &[u64], delete_for_everyone: bool) -> Result<()> {
        self.record(ApiRequest::DeleteMany { ids: ids.to_vec(), delete_for_everyone })
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.record(ApiRequest::ListContacts)?;
        Ok(self.state.lock().unwrap().contacts.clone())
    }
}

/// Complete a request the way the server would on success
pub fn ok_created(engine: &mut SyncEngine, ticket: Ticket, id: u64, receiver_id: UserId, text: &str) {
    engine.complete(ticket, Ok(ApiResponse::Created(wire(id, ME, receiver_id, text))));
}
