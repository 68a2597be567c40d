//! Real-time conversation delivery: presence tracking, message fan-out,
//! per-recipient status advancement, and offline replay.
//!
//! The crate owns no transport. Live sessions are registered with the
//! [`presence::PresenceRegistry`], which hands each one an event receiver;
//! the server's WebSocket layer drains that receiver into the socket.

use std::collections::HashMap;

use shared::{domain::UserId, protocol::MessagePayload};
use storage::{Storage, StoredMessage};

pub mod dispatch;
pub mod notify;
pub mod presence;
pub mod replay;
pub mod status;

/// Assembles the wire payload for a stored message, resolving the sender's
/// username. Content arrives already redacted when the storage read was
/// scoped to a requester.
pub async fn message_payload(
    storage: &Storage,
    message: &StoredMessage,
) -> anyhow::Result<MessagePayload> {
    let sender_username = storage.username_for_user(message.sender_id).await?;
    Ok(payload_from_parts(message, sender_username))
}

/// Batch variant of [`message_payload`] with one username lookup per
/// distinct sender.
pub async fn message_payloads(
    storage: &Storage,
    messages: &[StoredMessage],
) -> anyhow::Result<Vec<MessagePayload>> {
    let mut username_cache: HashMap<UserId, Option<String>> = HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let sender_username = if let Some(cached) = username_cache.get(&message.sender_id) {
            cached.clone()
        } else {
            let resolved = storage.username_for_user(message.sender_id).await?;
            username_cache.insert(message.sender_id, resolved.clone());
            resolved
        };
        payloads.push(payload_from_parts(message, sender_username));
    }
    Ok(payloads)
}

pub fn payload_from_parts(
    message: &StoredMessage,
    sender_username: Option<String>,
) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        sender_username,
        content: message.content.clone(),
        visibility: message.visibility,
        reply_to: message.reply_to,
        forwarded_from: message.forwarded_from,
        edited: message.edited,
        edited_at: message.edited_at,
        deleted_for_everyone: message.deleted_for_everyone,
        pinned: message.pinned,
        sent_at: message.created_at,
    }
}
