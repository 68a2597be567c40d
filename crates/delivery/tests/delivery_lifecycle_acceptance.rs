use std::sync::Arc;

use delivery::{
    dispatch::Dispatcher, notify::LogNotifier, presence::PresenceRegistry, replay::ReplayQueue,
    status::StatusTracker,
};
use shared::{
    domain::{DeliveryState, MessageContent, Role, TenantId, Visibility},
    protocol::ServerEvent,
};
use storage::{NewMessage, Storage};

#[tokio::test]
async fn direct_chat_with_online_recipient_delivers_without_replay() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("acceptance-alice", TenantId(1))
        .await
        .expect("alice");
    let bob = storage
        .create_user("acceptance-bob", TenantId(1))
        .await
        .expect("bob");
    let direct = storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");

    let presence = Arc::new(PresenceRegistry::new());
    let dispatcher = Dispatcher::new(storage.clone(), presence.clone(), Arc::new(LogNotifier));
    let replay = ReplayQueue::new(storage.clone(), presence.clone(), 50);

    let (_bob_session, mut bob_rx) = presence.connect(bob).await;

    let message = storage
        .insert_message(NewMessage {
            conversation_id: direct,
            sender_id: alice,
            sender_tenant: TenantId(1),
            content: &MessageContent::Text {
                text: "hi".to_string(),
            },
            visibility: Visibility::AllMembers,
            reply_to: None,
            forwarded_from: None,
        })
        .await
        .expect("persist");
    dispatcher.dispatch(&message).await.expect("dispatch");

    // Bob's client observes message_created immediately.
    match bob_rx.try_recv().expect("immediate push") {
        ServerEvent::MessageCreated { message: payload } => {
            assert_eq!(payload.message_id, message.message_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(
        storage
            .delivery_state(message.message_id, bob)
            .await
            .expect("state"),
        Some(DeliveryState::Delivered)
    );

    // A reconnect on another device finds nothing left to replay.
    let (second_session, _rx) = presence.connect(bob).await;
    let summary = replay
        .replay_backlog(bob, second_session)
        .await
        .expect("replay");
    assert_eq!(summary.replayed, 0);
}

#[tokio::test]
async fn direct_chat_with_offline_recipient_heals_through_replay() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("offline-alice", TenantId(1))
        .await
        .expect("alice");
    let bob = storage
        .create_user("offline-bob", TenantId(1))
        .await
        .expect("bob");
    let direct = storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");

    let presence = Arc::new(PresenceRegistry::new());
    let dispatcher = Dispatcher::new(storage.clone(), presence.clone(), Arc::new(LogNotifier));
    let replay = ReplayQueue::new(storage.clone(), presence.clone(), 50);

    let message = storage
        .insert_message(NewMessage {
            conversation_id: direct,
            sender_id: alice,
            sender_tenant: TenantId(1),
            content: &MessageContent::Text {
                text: "hi".to_string(),
            },
            visibility: Visibility::AllMembers,
            reply_to: None,
            forwarded_from: None,
        })
        .await
        .expect("persist");
    dispatcher.dispatch(&message).await.expect("dispatch");

    // Zero sessions: the status stays at sent, no error anywhere.
    assert_eq!(
        storage
            .delivery_state(message.message_id, bob)
            .await
            .expect("state"),
        Some(DeliveryState::Sent)
    );

    // Bob connects later; replay yields the message and advances it.
    let (session, mut rx) = presence.connect(bob).await;
    let summary = replay.replay_backlog(bob, session).await.expect("replay");
    assert_eq!(summary.replayed, 1);

    match rx.try_recv().expect("replayed message") {
        ServerEvent::MessageCreated { message: payload } => {
            assert_eq!(payload.message_id, message.message_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(
        storage
            .delivery_state(message.message_id, bob)
            .await
            .expect("state"),
        Some(DeliveryState::Delivered)
    );
}

#[tokio::test]
async fn tenant_scoped_group_message_never_touches_the_other_tenant() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("tenant-alice", TenantId(1))
        .await
        .expect("alice");
    let bob = storage
        .create_user("tenant-bob", TenantId(1))
        .await
        .expect("bob");
    let carol = storage
        .create_user("tenant-carol", TenantId(2))
        .await
        .expect("carol");
    let group = storage.create_group("two-tenants", alice).await.expect("group");
    storage.add_member(group, bob, Role::Member).await.expect("bob");
    storage
        .add_member(group, carol, Role::Member)
        .await
        .expect("carol");

    let presence = Arc::new(PresenceRegistry::new());
    let dispatcher = Dispatcher::new(storage.clone(), presence.clone(), Arc::new(LogNotifier));

    let (_bob_session, mut bob_rx) = presence.connect(bob).await;
    let (_carol_session, mut carol_rx) = presence.connect(carol).await;

    let message = storage
        .insert_message(NewMessage {
            conversation_id: group,
            sender_id: alice,
            sender_tenant: TenantId(1),
            content: &MessageContent::Text {
                text: "same-tenant only".to_string(),
            },
            visibility: Visibility::TenantOnly,
            reply_to: None,
            forwarded_from: None,
        })
        .await
        .expect("persist");
    dispatcher.dispatch(&message).await.expect("dispatch");

    assert!(bob_rx.try_recv().is_ok());
    assert!(carol_rx.try_recv().is_err());

    assert_eq!(
        storage
            .delivery_state(message.message_id, bob)
            .await
            .expect("bob state"),
        Some(DeliveryState::Delivered)
    );
    assert_eq!(
        storage
            .delivery_state(message.message_id, carol)
            .await
            .expect("carol state"),
        None
    );
}

#[tokio::test]
async fn read_receipts_reach_online_senders_and_vanish_for_offline_ones() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("receipt-alice", TenantId(1))
        .await
        .expect("alice");
    let bob = storage
        .create_user("receipt-bob", TenantId(1))
        .await
        .expect("bob");
    let direct = storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");

    let presence = Arc::new(PresenceRegistry::new());
    let dispatcher = Dispatcher::new(storage.clone(), presence.clone(), Arc::new(LogNotifier));
    let tracker = StatusTracker::new(storage.clone(), presence.clone());

    let (alice_session, mut alice_rx) = presence.connect(alice).await;
    let (_bob_session, mut _bob_rx) = presence.connect(bob).await;

    let message = storage
        .insert_message(NewMessage {
            conversation_id: direct,
            sender_id: alice,
            sender_tenant: TenantId(1),
            content: &MessageContent::Text {
                text: "read me".to_string(),
            },
            visibility: Visibility::AllMembers,
            reply_to: None,
            forwarded_from: None,
        })
        .await
        .expect("persist");
    dispatcher.dispatch(&message).await.expect("dispatch");
    // Drain the delivery receipt.
    let _ = alice_rx.try_recv();

    assert!(tracker
        .advance(message.message_id, bob, DeliveryState::Read)
        .await
        .expect("read"));
    match alice_rx.try_recv().expect("read receipt") {
        ServerEvent::MessageRead { recipient_id, .. } => assert_eq!(recipient_id, bob),
        other => panic!("unexpected event: {other:?}"),
    }

    // Sender offline: the repeat read is a no-op and nothing is queued.
    presence.disconnect(alice, alice_session).await;
    assert!(!tracker
        .advance(message.message_id, bob, DeliveryState::Read)
        .await
        .expect("repeat read"));
}
