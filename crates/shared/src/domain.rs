use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(TenantId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    TenantOnly,
    AllMembers,
}

/// Message payload content. The delivery path treats this as an opaque
/// tagged union; only validation looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        media_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
}

impl MessageContent {
    /// True when the content carries nothing deliverable (empty text, or a
    /// blank media reference).
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text { text } => text.trim().is_empty(),
            MessageContent::Media { media_ref, .. } => media_ref.trim().is_empty(),
            MessageContent::Location { .. } => false,
        }
    }
}

/// Per-recipient delivery state. A status row only ever moves to a
/// strictly higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn rank(self) -> i64 {
        match self {
            DeliveryState::Sent => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Read => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            2 => DeliveryState::Read,
            1 => DeliveryState::Delivered,
            _ => DeliveryState::Sent,
        }
    }
}
