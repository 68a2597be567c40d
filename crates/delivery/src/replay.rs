use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use shared::{
    domain::{DeliveryState, UserId},
    protocol::ServerEvent,
};
use storage::Storage;
use tracing::debug;

use crate::{
    payload_from_parts,
    presence::{PresenceRegistry, SessionId},
};

#[derive(Debug, Clone, Copy)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub truncated: bool,
}

/// Streams the backlog of never-delivered messages to a session that just
/// came online. Advancement is idempotent, so a crash mid-replay restarts
/// safely: unreplayed rows are still at `sent` on the next connect.
pub struct ReplayQueue {
    storage: Storage,
    presence: Arc<PresenceRegistry>,
    per_conversation_cap: u32,
}

impl ReplayQueue {
    pub fn new(storage: Storage, presence: Arc<PresenceRegistry>, per_conversation_cap: u32) -> Self {
        Self {
            storage,
            presence,
            per_conversation_cap,
        }
    }

    /// Invoked once per offline→online transition. Pushes every message
    /// the identity never reached `delivered` for, ordered by conversation
    /// then creation time, bounded per conversation by the configured cap
    /// (most recent messages win; truncation is reported to the client,
    /// not treated as a failure). Ends with a `replay_complete` event on
    /// the new session.
    pub async fn replay_backlog(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<ReplaySummary> {
        let (backlog, truncated) = self
            .storage
            .undelivered_for_user(user_id, self.per_conversation_cap)
            .await?;

        let mut username_cache: HashMap<UserId, Option<String>> = HashMap::new();
        let mut replayed = 0;
        for message in &backlog {
            let sender_username = if let Some(cached) = username_cache.get(&message.sender_id) {
                cached.clone()
            } else {
                let resolved = self.storage.username_for_user(message.sender_id).await?;
                username_cache.insert(message.sender_id, resolved.clone());
                resolved
            };
            let created = ServerEvent::MessageCreated {
                message: payload_from_parts(message, sender_username),
            };
            if !self
                .presence
                .push_to_session(user_id, session_id, &created)
                .await
            {
                // Session vanished mid-replay; remaining rows stay at
                // `sent` for the next connect.
                debug!(
                    user_id = user_id.0,
                    session_id = session_id.0,
                    "session vanished mid-replay"
                );
                return Ok(ReplaySummary { replayed, truncated });
            }

            let advanced = self
                .storage
                .advance_delivery_status(message.message_id, user_id, DeliveryState::Delivered)
                .await?;
            if advanced {
                replayed += 1;
                self.presence
                    .push_to_user(
                        message.sender_id,
                        &ServerEvent::MessageDelivered {
                            message_id: message.message_id,
                            recipient_id: user_id,
                        },
                    )
                    .await;
            }
        }

        self.presence
            .push_to_session(
                user_id,
                session_id,
                &ServerEvent::ReplayComplete { replayed, truncated },
            )
            .await;
        Ok(ReplaySummary { replayed, truncated })
    }
}

#[cfg(test)]
#[path = "tests/replay_tests.rs"]
mod tests;
