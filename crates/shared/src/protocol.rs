use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, ConversationKind, DeliveryState, MessageContent, MessageId, Role, TenantId,
        UserId, Visibility,
    },
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_user_id: Option<UserId>,
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visibility: Option<Visibility>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forwarded_from: Option<MessageId>,
    },
    MarkDelivered {
        message_id: MessageId,
    },
    MarkRead {
        message_id: MessageId,
    },
    MarkConversationRead {
        conversation_id: ConversationId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    /// Redacted to `None` for non-senders once deleted for everyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<MessageId>,
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_for_everyone: bool,
    pub pinned: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub username: String,
    pub tenant_id: TenantId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub state: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// Events a connected client observes. Serialized variant names are the
/// on-wire vocabulary: `message_created`, `message_delivered`,
/// `message_read`, `presence_changed`, `replay_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessageDelivered {
        message_id: MessageId,
        recipient_id: UserId,
    },
    MessageRead {
        message_id: MessageId,
        recipient_id: UserId,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    ReplayComplete {
        replayed: usize,
        truncated: bool,
    },
    Error(ApiError),
}
