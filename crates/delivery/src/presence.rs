use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{domain::UserId, protocol::ServerEvent};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// One live, addressable connection for an identity. An identity may hold
/// several concurrently (multi-device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Offline/online transition, emitted when an identity gains its first
/// session or loses its last one. Consumed by the collaborator layer for
/// UI presence indicators.
#[derive(Debug, Clone, Copy)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
}

/// Session registry. "Online" for delivery purposes means at least one
/// registered session; a completed `connect` is visible to any subsequent
/// `is_online` check.
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<UserId, HashMap<u64, mpsc::UnboundedSender<ServerEvent>>>>,
    next_session_id: AtomicU64,
    presence_tx: broadcast::Sender<PresenceUpdate>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (presence_tx, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            presence_tx,
        }
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.presence_tx.subscribe()
    }

    /// Registers a session and returns the receiver carrying every event
    /// pushed at it.
    pub async fn connect(
        &self,
        user_id: UserId,
    ) -> (SessionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(user_id).or_default();
        let first = entry.is_empty();
        entry.insert(session_id.0, tx);
        drop(sessions);

        if first {
            let _ = self.presence_tx.send(PresenceUpdate {
                user_id,
                online: true,
            });
        }
        (session_id, rx)
    }

    /// Deregisters a session. Cancels only that session's future pushes;
    /// persisted message and status state is untouched. Returns true when
    /// the identity just went fully offline.
    pub async fn disconnect(&self, user_id: UserId, session_id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&user_id) else {
            return false;
        };
        entry.remove(&session_id.0);
        let last = entry.is_empty();
        if last {
            sessions.remove(&user_id);
        }
        drop(sessions);

        if last {
            let _ = self.presence_tx.send(PresenceUpdate {
                user_id,
                online: false,
            });
        }
        last
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.sessions
            .read()
            .await
            .get(&user_id)
            .is_some_and(|entry| !entry.is_empty())
    }

    pub async fn session_count(&self, user_id: UserId) -> usize {
        self.sessions
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    /// Fan-out to every live session for the identity. A session whose
    /// receiver vanished mid-send is pruned rather than reported as an
    /// error. Returns the number of sessions reached; zero means the
    /// recipient is offline as far as delivery is concerned.
    pub async fn push_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&user_id) else {
            return 0;
        };
        let mut reached = 0;
        entry.retain(|session_id, tx| match tx.send(event.clone()) {
            Ok(()) => {
                reached += 1;
                true
            }
            Err(_) => {
                debug!(
                    user_id = user_id.0,
                    session_id, "pruning vanished session during push"
                );
                false
            }
        });
        reached
    }

    /// Targeted push to a single session (replay path). Returns false when
    /// the session is gone.
    pub async fn push_to_session(
        &self,
        user_id: UserId,
        session_id: SessionId,
        event: &ServerEvent,
    ) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(&user_id)
            .and_then(|entry| entry.get(&session_id.0))
            .map_or(false, |tx| tx.send(event.clone()).is_ok())
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
