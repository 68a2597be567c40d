use super::*;

use shared::{domain::TenantId, error::ErrorCode as Code};
use storage::NewMessage;

async fn direct_with_message() -> (Storage, UserId, UserId, MessageId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice", TenantId(1))
        .await
        .expect("alice");
    let bob = storage.create_user("bob", TenantId(1)).await.expect("bob");
    let direct = storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");
    let stored = storage
        .insert_message(NewMessage {
            conversation_id: direct,
            sender_id: alice,
            sender_tenant: TenantId(1),
            content: &shared::domain::MessageContent::Text {
                text: "hi".to_string(),
            },
            visibility: shared::domain::Visibility::AllMembers,
            reply_to: None,
            forwarded_from: None,
        })
        .await
        .expect("insert");
    storage
        .insert_delivery_statuses(stored.message_id, &[bob])
        .await
        .expect("statuses");
    (storage, alice, bob, stored.message_id)
}

#[tokio::test]
async fn repeated_read_produces_one_state_change_and_one_receipt() {
    let (storage, alice, bob, message_id) = direct_with_message().await;
    let presence = Arc::new(PresenceRegistry::new());
    let tracker = StatusTracker::new(storage.clone(), presence.clone());
    let (_alice_session, mut alice_rx) = presence.connect(alice).await;

    assert!(tracker
        .advance(message_id, bob, DeliveryState::Read)
        .await
        .expect("first read"));
    assert!(!tracker
        .advance(message_id, bob, DeliveryState::Read)
        .await
        .expect("second read"));

    match alice_rx.try_recv().expect("read receipt") {
        ServerEvent::MessageRead { recipient_id, .. } => assert_eq!(recipient_id, bob),
        other => panic!("unexpected event: {other:?}"),
    }
    // Exactly one receipt, not two.
    assert!(alice_rx.try_recv().is_err());

    assert_eq!(
        storage
            .delivery_state(message_id, bob)
            .await
            .expect("state"),
        Some(DeliveryState::Read)
    );
}

#[tokio::test]
async fn offline_sender_misses_the_receipt_without_error() {
    let (storage, _alice, bob, message_id) = direct_with_message().await;
    let presence = Arc::new(PresenceRegistry::new());
    let tracker = StatusTracker::new(storage, presence);

    assert!(tracker
        .advance(message_id, bob, DeliveryState::Read)
        .await
        .expect("read with sender offline"));
}

#[tokio::test]
async fn backward_transition_is_a_quiet_no_op() {
    let (storage, alice, bob, message_id) = direct_with_message().await;
    let presence = Arc::new(PresenceRegistry::new());
    let tracker = StatusTracker::new(storage.clone(), presence.clone());
    let (_alice_session, mut alice_rx) = presence.connect(alice).await;

    assert!(tracker
        .advance(message_id, bob, DeliveryState::Read)
        .await
        .expect("read"));
    let _ = alice_rx.try_recv();

    assert!(!tracker
        .advance(message_id, bob, DeliveryState::Delivered)
        .await
        .expect("backward"));
    assert!(alice_rx.try_recv().is_err());
    assert_eq!(
        storage
            .delivery_state(message_id, bob)
            .await
            .expect("state"),
        Some(DeliveryState::Read)
    );
}

#[tokio::test]
async fn advancing_a_missing_message_is_not_found() {
    let (storage, _alice, bob, _message_id) = direct_with_message().await;
    let presence = Arc::new(PresenceRegistry::new());
    let tracker = StatusTracker::new(storage, presence);

    let err = tracker
        .advance(MessageId(9999), bob, DeliveryState::Read)
        .await
        .expect_err("missing message");
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn ineligible_recipient_has_no_row_to_advance() {
    let (storage, alice, _bob, message_id) = direct_with_message().await;
    let presence = Arc::new(PresenceRegistry::new());
    let tracker = StatusTracker::new(storage, presence);

    // The sender never gets a status row for their own message.
    assert!(!tracker
        .advance(message_id, alice, DeliveryState::Read)
        .await
        .expect("no-op"));
}

#[tokio::test]
async fn bulk_read_is_idempotent_and_fans_receipts_to_senders() {
    let (storage, alice, bob, first_id) = direct_with_message().await;
    let direct = storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");
    let second = storage
        .insert_message(NewMessage {
            conversation_id: direct,
            sender_id: alice,
            sender_tenant: TenantId(1),
            content: &shared::domain::MessageContent::Text {
                text: "again".to_string(),
            },
            visibility: shared::domain::Visibility::AllMembers,
            reply_to: None,
            forwarded_from: None,
        })
        .await
        .expect("insert");
    storage
        .insert_delivery_statuses(second.message_id, &[bob])
        .await
        .expect("statuses");

    let presence = Arc::new(PresenceRegistry::new());
    let tracker = StatusTracker::new(storage.clone(), presence.clone());
    let (_alice_session, mut alice_rx) = presence.connect(alice).await;

    let advanced = tracker
        .mark_conversation_read(direct, bob)
        .await
        .expect("bulk read");
    assert_eq!(advanced, 2);

    let mut read_ids = Vec::new();
    while let Ok(event) = alice_rx.try_recv() {
        if let ServerEvent::MessageRead { message_id, .. } = event {
            read_ids.push(message_id);
        }
    }
    assert_eq!(read_ids, vec![first_id, second.message_id]);

    assert_eq!(
        tracker
            .mark_conversation_read(direct, bob)
            .await
            .expect("bulk read again"),
        0
    );
}
