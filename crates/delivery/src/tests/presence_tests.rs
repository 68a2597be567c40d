use super::*;

fn probe_event() -> ServerEvent {
    ServerEvent::ReplayComplete {
        replayed: 0,
        truncated: false,
    }
}

#[tokio::test]
async fn connect_is_visible_to_subsequent_online_checks() {
    let registry = PresenceRegistry::new();
    let user = UserId(1);
    assert!(!registry.is_online(user).await);

    let (session, _rx) = registry.connect(user).await;
    assert!(registry.is_online(user).await);

    registry.disconnect(user, session).await;
    assert!(!registry.is_online(user).await);
}

#[tokio::test]
async fn identity_stays_online_until_last_session_disconnects() {
    let registry = PresenceRegistry::new();
    let user = UserId(7);
    let (first, _rx1) = registry.connect(user).await;
    let (second, _rx2) = registry.connect(user).await;
    assert_eq!(registry.session_count(user).await, 2);

    assert!(!registry.disconnect(user, first).await);
    assert!(registry.is_online(user).await);

    assert!(registry.disconnect(user, second).await);
    assert!(!registry.is_online(user).await);
}

#[tokio::test]
async fn push_reaches_every_live_session() {
    let registry = PresenceRegistry::new();
    let user = UserId(3);
    let (_s1, mut rx1) = registry.connect(user).await;
    let (_s2, mut rx2) = registry.connect(user).await;

    let reached = registry.push_to_user(user, &probe_event()).await;
    assert_eq!(reached, 2);
    assert!(rx1.try_recv().is_ok());
    assert!(rx2.try_recv().is_ok());
}

#[tokio::test]
async fn vanished_session_is_pruned_not_an_error() {
    let registry = PresenceRegistry::new();
    let user = UserId(4);
    let (_session, rx) = registry.connect(user).await;
    drop(rx);

    let reached = registry.push_to_user(user, &probe_event()).await;
    assert_eq!(reached, 0);
    assert_eq!(registry.session_count(user).await, 0);
}

#[tokio::test]
async fn targeted_push_hits_only_the_addressed_session() {
    let registry = PresenceRegistry::new();
    let user = UserId(5);
    let (first, mut rx1) = registry.connect(user).await;
    let (_second, mut rx2) = registry.connect(user).await;

    assert!(registry.push_to_session(user, first, &probe_event()).await);
    assert!(rx1.try_recv().is_ok());
    assert!(rx2.try_recv().is_err());

    // A session id that was never issued.
    assert!(
        !registry
            .push_to_session(user, SessionId(9999), &probe_event())
            .await
    );
}

#[tokio::test]
async fn presence_transitions_fire_only_on_first_and_last_session() {
    let registry = PresenceRegistry::new();
    let mut updates = registry.subscribe_presence();
    let user = UserId(6);

    let (first, _rx1) = registry.connect(user).await;
    let up = updates.try_recv().expect("online update");
    assert!(up.online);
    assert_eq!(up.user_id, user);

    // Second device: no transition.
    let (second, _rx2) = registry.connect(user).await;
    assert!(updates.try_recv().is_err());

    registry.disconnect(user, first).await;
    assert!(updates.try_recv().is_err());

    registry.disconnect(user, second).await;
    let down = updates.try_recv().expect("offline update");
    assert!(!down.online);
}
