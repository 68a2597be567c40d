use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{
    domain::{ConversationKind, DeliveryState, UserId, Visibility},
    protocol::ServerEvent,
};
use storage::{Storage, StoredMember, StoredMessage};
use tracing::debug;

use crate::{message_payload, notify::PushNotifier, presence::PresenceRegistry};

/// Fans a freshly persisted message out to its eligible recipients.
///
/// Invoked exactly once per appended message, strictly after the insert
/// returned (persist, then dispatch). Per-recipient pushes are
/// fire-and-forget: a recipient that cannot be reached stays at `sent`
/// and is healed by replay, never reported to the sender.
pub struct Dispatcher {
    storage: Storage,
    presence: Arc<PresenceRegistry>,
    notifier: Arc<dyn PushNotifier>,
}

impl Dispatcher {
    pub fn new(
        storage: Storage,
        presence: Arc<PresenceRegistry>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            storage,
            presence,
            notifier,
        }
    }

    pub async fn dispatch(&self, message: &StoredMessage) -> Result<()> {
        let conversation = self
            .storage
            .conversation(message.conversation_id)
            .await?
            .context("conversation vanished between persist and dispatch")?;
        let members = self.storage.members_of(message.conversation_id).await?;
        let recipients = eligible_recipients(conversation.kind, &members, message);
        if recipients.is_empty() {
            debug!(
                message_id = message.message_id.0,
                "no eligible recipients for message"
            );
            return Ok(());
        }

        self.storage
            .insert_delivery_statuses(message.message_id, &recipients)
            .await?;

        let payload = message_payload(&self.storage, message).await?;
        let created = ServerEvent::MessageCreated { message: payload };
        for recipient in recipients {
            let reached = self.presence.push_to_user(recipient, &created).await;
            if reached == 0 {
                self.notifier.message_pending(recipient, message).await;
                continue;
            }
            let advanced = self
                .storage
                .advance_delivery_status(message.message_id, recipient, DeliveryState::Delivered)
                .await?;
            if advanced {
                // Delivery receipt for the sender's own sessions, best-effort.
                self.presence
                    .push_to_user(
                        message.sender_id,
                        &ServerEvent::MessageDelivered {
                            message_id: message.message_id,
                            recipient_id: recipient,
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }
}

/// Membership ∩ visibility rule, excluding the sender. Direct messages go
/// to the other member unconditionally; group messages marked
/// `tenant_only` reach only members of the sender's tenant.
pub fn eligible_recipients(
    kind: ConversationKind,
    members: &[StoredMember],
    message: &StoredMessage,
) -> Vec<UserId> {
    members
        .iter()
        .filter(|member| member.user_id != message.sender_id)
        .filter(|member| match kind {
            ConversationKind::Direct => true,
            ConversationKind::Group => {
                message.visibility == Visibility::AllMembers
                    || member.tenant_id == message.sender_tenant
            }
        })
        .map(|member| member.user_id)
        .collect()
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
