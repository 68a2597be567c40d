use std::sync::Arc;

use shared::{
    domain::{ConversationId, DeliveryState, MessageId, UserId},
    error::{ApiException, ErrorCode},
    protocol::ServerEvent,
};
use storage::Storage;

use crate::presence::PresenceRegistry;

/// Per-(message, recipient) state machine over the stored delivery rows.
/// Both this tracker and the dispatcher advance rows through the same
/// conditional UPDATE, so the recipient's read path and the delivery path
/// race safely without a coordinating lock.
pub struct StatusTracker {
    storage: Storage,
    presence: Arc<PresenceRegistry>,
}

impl StatusTracker {
    pub fn new(storage: Storage, presence: Arc<PresenceRegistry>) -> Self {
        Self { storage, presence }
    }

    /// Advances the recipient's state for one message. Moving backward or
    /// to a state already reached is a no-op returning `false`, not an
    /// error. A genuine transition notifies the original sender's live
    /// sessions with the matching receipt; the notification is best-effort
    /// and never queued for an offline sender.
    pub async fn advance(
        &self,
        message_id: MessageId,
        recipient: UserId,
        target: DeliveryState,
    ) -> Result<bool, ApiException> {
        let message = self
            .storage
            .message(message_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiException::new(ErrorCode::NotFound, "message not found"))?;

        let advanced = self
            .storage
            .advance_delivery_status(message_id, recipient, target)
            .await
            .map_err(internal)?;
        if !advanced {
            return Ok(false);
        }

        let receipt = match target {
            DeliveryState::Delivered => ServerEvent::MessageDelivered {
                message_id,
                recipient_id: recipient,
            },
            DeliveryState::Read => ServerEvent::MessageRead {
                message_id,
                recipient_id: recipient,
            },
            // `sent` is the initial state; nothing can advance into it.
            DeliveryState::Sent => return Ok(true),
        };
        self.presence.push_to_user(message.sender_id, &receipt).await;
        Ok(true)
    }

    /// Bulk read over every unread row the recipient holds in the
    /// conversation, message-creation order. Returns how many rows
    /// actually advanced; each fires one read receipt at its sender.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
    ) -> Result<usize, ApiException> {
        let advanced = self
            .storage
            .mark_conversation_read(conversation_id, recipient)
            .await
            .map_err(internal)?;
        for row in &advanced {
            self.presence
                .push_to_user(
                    row.sender_id,
                    &ServerEvent::MessageRead {
                        message_id: row.message_id,
                        recipient_id: recipient,
                    },
                )
                .await;
        }
        Ok(advanced.len())
    }
}

fn internal(err: anyhow::Error) -> ApiException {
    ApiException::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
