// Engine-level tests: reconciliation, unread accounting, selection and deletion
mod common;

use common::*;
use nchat_sync::api::{ApiRequest, ApiResponse, Upload};
use nchat_sync::events::{DeletionNotice, NoticeLevel, PresenceNotice, StatusNotice, TypingNotice};
use nchat_sync::selection::{DeletionPrompt, SelectionMode};
use nchat_sync::{
    DeletionPolicy, DeliveryStatus, EngineEvent, EventKind, InboundEvent, MediaKind, MessageId,
    OutboundEvent, PresenceStatus, SyncError,
};
use std::sync::{Arc, Mutex};

/// Focus ALICE with the given history already loaded
fn focused_with(history: Vec<nchat_sync::WireMessage>) -> nchat_sync::SyncEngine {
    let mut engine = engine();
    engine.select_conversation(ALICE).unwrap();
    let (_, requests) = drain(&mut engine);
    let (ticket, _) = requests
        .into_iter()
        .find(|(_, r)| matches!(r, ApiRequest::FetchHistory { .. }))
        .unwrap();
    engine.complete(ticket, Ok(ApiResponse::History(history)));
    engine
}

#[test]
fn test_ingest_is_idempotent() {
    let mut engine = focused_with(vec![]);

    engine.handle_inbound(InboundEvent::ChatMessage(wire(7, ALICE, ME, "hello")));
    engine.handle_inbound(InboundEvent::ChatMessage(wire(7, ALICE, ME, "hello")));

    assert_eq!(engine.messages().len(), 1);
}

#[test]
fn test_echo_after_resolution_is_noop() {
    let mut engine = focused_with(vec![]);

    let placeholder = engine.send_text("hi").unwrap();
    let (_, requests) = drain(&mut engine);
    let (ticket, request) = requests.into_iter().next().unwrap();
    assert_eq!(request, ApiRequest::SendText { receiver_id: ALICE, body: "hi".to_string() });

    ok_created(&mut engine, ticket, 50, ALICE, "hi");
    assert_eq!(engine.messages().len(), 1);
    assert!(engine.message(placeholder).is_none());

    engine.handle_inbound(InboundEvent::ChatMessage(wire(50, ME, ALICE, "hi")));
    assert_eq!(engine.messages().len(), 1);
    assert_eq!(engine.messages()[0].id, MessageId::Server(50));
    assert_eq!(engine.messages()[0].status, DeliveryStatus::Sent);
}

#[test]
fn test_echo_before_resolution_merges() {
    let mut engine = focused_with(vec![]);

    let placeholder = engine.send_text("hi").unwrap();
    let (_, requests) = drain(&mut engine);
    let ticket = requests[0].0;

    engine.handle_inbound(InboundEvent::ChatMessage(wire(51, ME, ALICE, "hi")));
    assert_eq!(engine.messages().len(), 2);

    ok_created(&mut engine, ticket, 51, ALICE, "hi");
    assert_eq!(engine.messages().len(), 1);
    assert!(engine.message(placeholder).is_none());
    assert!(engine.message(MessageId::Server(51)).is_some());
}

#[test]
fn test_resolution_keeps_position() {
    let mut engine = focused_with(vec![]);

    engine.send_text("first").unwrap();
    let (_, requests) = drain(&mut engine);
    engine.handle_inbound(InboundEvent::ChatMessage(wire(9, ALICE, ME, "reply")));

    ok_created(&mut engine, requests[0].0, 10, ALICE, "first");
    let ids: Vec<MessageId> = engine.messages().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![MessageId::Server(10), MessageId::Server(9)]);
}

#[test]
fn test_failed_send_is_not_retried() {
    let mut engine = focused_with(vec![]);

    let placeholder = engine.send_text("hi").unwrap();
    assert_eq!(engine.message(placeholder).unwrap().status, DeliveryStatus::Pending);
    let (_, requests) = drain(&mut engine);

    engine.complete(requests[0].0, Err(SyncError::Network("offline".to_string())));

    assert_eq!(engine.message(placeholder).unwrap().status, DeliveryStatus::Failed);
    assert_eq!(engine.messages().len(), 1);
    let (_, requests) = drain(&mut engine);
    assert!(requests.is_empty());
}

#[test]
fn test_identical_pending_send_is_rejected() {
    let mut engine = focused_with(vec![]);

    let first = engine.send_text("hi").unwrap();
    match engine.send_text("hi") {
        Err(SyncError::DuplicatePending(id)) => assert_eq!(id, first),
        other => panic!("Expected DuplicatePending, got {:?}", other),
    }
    assert_eq!(engine.messages().len(), 1);

    // Once resolved, the same text may be sent again
    let (_, requests) = drain(&mut engine);
    ok_created(&mut engine, requests[0].0, 60, ALICE, "hi");
    assert!(engine.send_text("hi").is_ok());
}

#[test]
fn test_resolution_after_switch_is_dropped() {
    let mut engine = focused_with(vec![]);

    engine.send_text("hi").unwrap();
    let (_, requests) = drain(&mut engine);

    engine.select_conversation(BOB).unwrap();
    ok_created(&mut engine, requests[0].0, 70, ALICE, "hi");

    assert!(engine.messages().is_empty());
    assert_eq!(engine.active_conversation(), Some(BOB));
}

#[test]
fn test_send_survives_switching_away_and_back() {
    let mut engine = focused_with(vec![]);

    let placeholder = engine.send_text("hi").unwrap();
    let (_, requests) = drain(&mut engine);
    let send_ticket = requests[0].0;

    engine.select_conversation(BOB).unwrap();
    engine.select_conversation(ALICE).unwrap();
    let (_, requests) = drain(&mut engine);
    let history_ticket = requests
        .iter()
        .find(|(_, r)| *r == ApiRequest::FetchHistory { peer_id: ALICE })
        .map(|(t, _)| *t)
        .unwrap();

    // History was read before the server stored the message
    engine.complete(history_ticket, Ok(ApiResponse::History(vec![])));
    let events = record(&mut engine);
    ok_created(&mut engine, send_ticket, 77, ALICE, "hi");

    let ids: Vec<MessageId> = engine.messages().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![MessageId::Server(77)]);
    assert!(engine.message(placeholder).is_none());
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, EngineEvent::MessageAppended(m) if m.id == MessageId::Server(77))));

    // The push echo does not add it a second time
    engine.handle_inbound(InboundEvent::ChatMessage(wire(77, ME, ALICE, "hi")));
    assert_eq!(engine.messages().len(), 1);
}

#[test]
fn test_same_named_uploads_are_both_sent() {
    let mut engine = focused_with(vec![]);
    drain(&mut engine);
    let upload = |bytes: Vec<u8>| Upload {
        file_name: "image.png".to_string(),
        mime: "image/png".to_string(),
        bytes,
    };

    let first = engine.send_attachment(upload(vec![1, 2, 3]), MediaKind::Image).unwrap();
    let second = engine.send_attachment(upload(vec![4, 5, 6]), MediaKind::Image).unwrap();
    assert_ne!(first, second);
    assert_eq!(engine.messages().len(), 2);

    let (_, requests) = drain(&mut engine);
    assert_eq!(requests.len(), 2);
    assert!(requests
        .iter()
        .all(|(_, r)| matches!(r, ApiRequest::SendImage { receiver_id: ALICE, .. })));
}

#[test]
fn test_refused_send_raises_notice() {
    let mut engine = focused_with(vec![]);
    engine.send_text("hi").unwrap();
    let events = record(&mut engine);

    assert!(matches!(engine.send_text("hi"), Err(SyncError::DuplicatePending(_))));
    let upload = Upload {
        file_name: "notes.txt".to_string(),
        mime: "text/plain".to_string(),
        bytes: vec![0],
    };
    assert!(matches!(
        engine.send_attachment(upload, MediaKind::File),
        Err(SyncError::PolicyViolation(_))
    ));

    let notices = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, EngineEvent::Notice { .. }))
        .count();
    assert_eq!(notices, 2);
    assert_eq!(engine.messages().len(), 1);
}

#[test]
fn test_read_receipt_follows_history() {
    let mut engine = engine();
    engine.select_conversation(ALICE).unwrap();
    let (emitted, requests) = drain(&mut engine);
    assert!(!emitted.contains(&OutboundEvent::MessageRead { partner_id: ALICE }));

    let (ticket, _) = requests
        .into_iter()
        .find(|(_, r)| matches!(r, ApiRequest::FetchHistory { .. }))
        .unwrap();
    engine.complete(ticket, Ok(ApiResponse::History(vec![wire(1, ALICE, ME, "old")])));
    let (emitted, _) = drain(&mut engine);
    assert_eq!(emitted, vec![OutboundEvent::MessageRead { partner_id: ALICE }]);
}

#[test]
fn test_history_goes_before_live_messages() {
    let mut engine = engine();
    engine.select_conversation(ALICE).unwrap();
    let (_, requests) = drain(&mut engine);

    // Arrives while the fetch is in flight, and is also part of the history
    engine.handle_inbound(InboundEvent::ChatMessage(wire(3, ALICE, ME, "three")));
    engine.handle_inbound(InboundEvent::ChatMessage(wire(4, ALICE, ME, "four")));

    let history = vec![wire(1, ME, ALICE, "one"), wire(2, ALICE, ME, "two"), wire(3, ALICE, ME, "three")];
    engine.complete(requests[0].0, Ok(ApiResponse::History(history)));

    let ids: Vec<MessageId> = engine.messages().iter().map(|m| m.id).collect();
    assert_eq!(
        ids,
        vec![MessageId::Server(1), MessageId::Server(2), MessageId::Server(3), MessageId::Server(4)]
    );
}

#[test]
fn test_unread_counts_background_conversations() {
    let mut engine = focused_with(vec![]);

    engine.handle_inbound(InboundEvent::ChatMessage(wire(20, BOB, ME, "psst")));
    engine.handle_inbound(InboundEvent::ChatMessage(wire(21, BOB, ME, "psst again")));
    assert_eq!(engine.unread_count(BOB), 2);
    assert_eq!(engine.unread_count(ALICE), 0);
    assert!(engine.messages().is_empty());

    engine.select_conversation(BOB).unwrap();
    assert_eq!(engine.unread_count(BOB), 0);
}

#[test]
fn test_unread_only_increases_until_focus() {
    let mut engine = focused_with(vec![]);
    let mut last = 0;

    for id in 0..5 {
        engine.handle_inbound(InboundEvent::ChatMessage(wire(100 + id, BOB, ME, "x")));
        engine.handle_inbound(InboundEvent::Presence(PresenceNotice { user_id: BOB, status: PresenceStatus::Online }));
        let count = engine.unread_count(BOB);
        assert!(count > last);
        last = count;
    }
    engine.select_conversation(BOB).unwrap();
    assert_eq!(engine.unread_count(BOB), 0);
}

#[test]
fn test_peer_messages_are_acknowledged() {
    let mut engine = focused_with(vec![]);
    drain(&mut engine);

    engine.handle_inbound(InboundEvent::ChatMessage(wire(30, ALICE, ME, "hey")));
    engine.handle_inbound(InboundEvent::ChatMessage(wire(31, BOB, ME, "yo")));

    let (emitted, _) = drain(&mut engine);
    assert_eq!(
        emitted,
        vec![
            OutboundEvent::MessageDelivered { message_id: 30 },
            OutboundEvent::MessageRead { partner_id: ALICE },
            OutboundEvent::MessageDelivered { message_id: 31 },
        ]
    );
}

#[test]
fn test_hidden_page_defers_read_receipts() {
    let mut engine = focused_with(vec![]);
    engine.set_visibility(false).unwrap();
    drain(&mut engine);

    engine.handle_inbound(InboundEvent::ChatMessage(wire(32, ALICE, ME, "hey")));
    let (emitted, _) = drain(&mut engine);
    assert_eq!(emitted, vec![OutboundEvent::MessageDelivered { message_id: 32 }]);

    engine.set_visibility(true).unwrap();
    let (emitted, _) = drain(&mut engine);
    assert_eq!(emitted, vec![OutboundEvent::UserStatus(PresenceStatus::Online)]);
}

#[test]
fn test_status_never_moves_backwards() {
    let mut engine = focused_with(vec![]);
    engine.send_text("hi").unwrap();
    let (_, requests) = drain(&mut engine);
    ok_created(&mut engine, requests[0].0, 40, ALICE, "hi");

    let status = |engine: &nchat_sync::SyncEngine| engine.message(MessageId::Server(40)).unwrap().status;

    engine.handle_inbound(InboundEvent::MessageStatus(StatusNotice { id: 40, status: DeliveryStatus::Read }));
    assert_eq!(status(&engine), DeliveryStatus::Read);

    engine.handle_inbound(InboundEvent::MessageStatus(StatusNotice { id: 40, status: DeliveryStatus::Delivered }));
    assert_eq!(status(&engine), DeliveryStatus::Read);

    // Unknown ids are ignored
    engine.handle_inbound(InboundEvent::MessageStatus(StatusNotice { id: 41, status: DeliveryStatus::Read }));
    assert_eq!(engine.messages().len(), 1);
}

#[test]
fn test_typing_only_shown_for_active_peer() {
    let mut engine = focused_with(vec![]);
    let events = record(&mut engine);

    engine.handle_inbound(InboundEvent::Typing(TypingNotice { from: BOB, is_typing: true }));
    engine.handle_inbound(InboundEvent::Typing(TypingNotice { from: ALICE, is_typing: true }));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], EngineEvent::PeerTyping { peer_id: ALICE, is_typing: true }));
}

#[test]
fn test_presence_updates_contacts() {
    let mut engine = engine();
    engine.start().unwrap();
    let (emitted, requests) = drain(&mut engine);
    assert_eq!(emitted, vec![OutboundEvent::UserStatus(PresenceStatus::Online)]);
    assert_eq!(requests[0].1, ApiRequest::ListContacts);

    engine.complete(requests[0].0, Ok(ApiResponse::Contacts(vec![contact(ALICE, "alice"), contact(BOB, "bob")])));
    assert_eq!(engine.contacts().all().len(), 2);

    engine.handle_inbound(InboundEvent::Presence(PresenceNotice { user_id: ALICE, status: PresenceStatus::Busy }));
    assert_eq!(engine.presence().status(ALICE), PresenceStatus::Busy);
    assert_eq!(engine.contacts().get(ALICE).unwrap().status, PresenceStatus::Busy);
    assert_eq!(engine.presence().status(BOB), PresenceStatus::Offline);
}

#[test]
fn test_selection_mode_tracks_emptiness() {
    let history = (1..=4).map(|id| wire(id, ALICE, ME, "m")).collect();
    let mut engine = focused_with(history);

    let toggles = [1, 2, 1, 3, 3, 2, 4, 4, 1];
    assert!(engine.enter_selection(MessageId::Server(toggles[0])));
    for id in &toggles[1..] {
        engine.toggle_selection(MessageId::Server(*id));
        let selection = engine.selection();
        assert_eq!(selection.mode() == SelectionMode::Idle, selection.is_empty());
    }
}

#[test]
fn test_placeholders_cannot_be_selected() {
    let mut engine = focused_with(vec![]);
    let placeholder = engine.send_text("hi").unwrap();

    assert!(!engine.enter_selection(placeholder));
    assert!(!engine.toggle_selection(MessageId::Server(999)));
    assert_eq!(engine.selection().mode(), SelectionMode::Idle);
}

#[test]
fn test_deletion_policy_by_ownership() {
    let history = vec![
        wire(1, ME, ALICE, "a"),
        wire(2, ME, ALICE, "b"),
        wire(3, ME, ALICE, "c"),
        wire(4, ALICE, ME, "d"),
        wire(5, ALICE, ME, "e"),
    ];
    let mut engine = focused_with(history);

    for id in [1, 2, 3] {
        engine.toggle_selection(MessageId::Server(id));
    }
    assert_eq!(engine.request_deletion().unwrap(), DeletionPrompt::Choose { count: 3 });

    engine.cancel_selection();
    for id in [4, 5] {
        engine.toggle_selection(MessageId::Server(id));
    }
    match engine.request_deletion().unwrap() {
        DeletionPrompt::Forced { policy, count, .. } => {
            assert_eq!(policy, DeletionPolicy::Soft);
            assert_eq!(count, 2);
        }
        other => panic!("Expected forced soft delete, got {:?}", other),
    }

    engine.cancel_selection();
    for id in [1, 4] {
        engine.toggle_selection(MessageId::Server(id));
    }
    let prompt = engine.request_deletion().unwrap();
    assert!(!prompt.allows(DeletionPolicy::Hard));
    assert!(matches!(
        engine.confirm_deletion(DeletionPolicy::Hard),
        Err(SyncError::PolicyViolation(_))
    ));
}

#[test]
fn test_batch_soft_delete_clears_selection() {
    let history = (4..=7).map(|id| wire(id, ALICE, ME, "m")).collect();
    let mut engine = focused_with(history);
    drain(&mut engine);

    engine.enter_selection(MessageId::Server(6));
    let ticket = engine
        .apply_deletion(vec![MessageId::Server(5), MessageId::Server(6)], DeletionPolicy::Soft)
        .unwrap();

    let (_, requests) = drain(&mut engine);
    assert_eq!(
        requests,
        vec![(ticket, ApiRequest::DeleteMany { ids: vec![5, 6], delete_for_everyone: false })]
    );
    // Nothing changes before the server confirms
    assert_eq!(engine.messages().len(), 4);

    engine.complete(ticket, Ok(ApiResponse::Deleted));
    let ids: Vec<MessageId> = engine.messages().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![MessageId::Server(4), MessageId::Server(7)]);
    assert!(!engine.selection().contains(MessageId::Server(6)));
    assert_eq!(engine.selection().mode(), SelectionMode::Idle);
}

#[test]
fn test_single_hard_delete_of_own_message() {
    let mut engine = focused_with(vec![wire(8, ME, ALICE, "oops")]);
    drain(&mut engine);

    engine.enter_selection(MessageId::Server(8));
    assert_eq!(engine.request_deletion().unwrap(), DeletionPrompt::Choose { count: 1 });
    let ticket = engine.confirm_deletion(DeletionPolicy::Hard).unwrap();

    let (_, requests) = drain(&mut engine);
    assert_eq!(requests, vec![(ticket, ApiRequest::DeleteOne { id: 8, delete_for_everyone: true })]);

    engine.complete(ticket, Ok(ApiResponse::Deleted));
    assert!(engine.messages().is_empty());
}

#[test]
fn test_failed_delete_leaves_state() {
    let mut engine = focused_with(vec![wire(8, ME, ALICE, "keep")]);
    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    engine.subscribe(EventKind::Notice, move |event| {
        if let EngineEvent::Notice { level, .. } = event {
            sink.lock().unwrap().push(*level);
        }
    });

    engine.enter_selection(MessageId::Server(8));
    let ticket = engine.confirm_deletion(DeletionPolicy::Soft).unwrap();
    engine.complete(ticket, Err(SyncError::Network("timeout".to_string())));

    assert_eq!(engine.messages().len(), 1);
    assert!(engine.selection().contains(MessageId::Server(8)));
    assert_eq!(notices.lock().unwrap().as_slice(), &[NoticeLevel::Error]);
}

#[test]
fn test_remote_deletion_updates_selection() {
    let mut engine = focused_with(vec![wire(1, ALICE, ME, "a"), wire(2, ALICE, ME, "b")]);
    engine.enter_selection(MessageId::Server(2));

    engine.handle_inbound(InboundEvent::MessageDeleted(DeletionNotice {
        message_id: 2,
        sender_id: ALICE,
        deletion_type: DeletionPolicy::Hard,
    }));

    assert_eq!(engine.messages().len(), 1);
    assert_eq!(engine.selection().mode(), SelectionMode::Idle);
}

#[test]
fn test_unauthorized_is_terminal() {
    let mut engine = focused_with(vec![]);
    let events = record(&mut engine);
    engine.send_text("hi").unwrap();
    let (_, requests) = drain(&mut engine);

    engine.complete(requests[0].0, Err(SyncError::Unauthorized));

    assert!(engine.is_expired());
    assert!(engine.messages().is_empty());
    assert!(events.lock().unwrap().iter().any(|e| matches!(e, EngineEvent::SessionExpired)));
    assert!(matches!(engine.send_text("again"), Err(SyncError::SessionClosed)));

    engine.handle_inbound(InboundEvent::ChatMessage(wire(1, BOB, ME, "late")));
    assert_eq!(engine.unread_count(BOB), 0);
}
