use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ConversationId, ConversationKind, DeliveryState, MessageContent, MessageId, Role, TenantId,
    UserId, Visibility,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub pinned: bool,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub username: String,
    pub tenant_id: TenantId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_tenant: TenantId,
    pub content: &'a MessageContent,
    pub visibility: Visibility,
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_tenant: TenantId,
    /// `None` once the message is deleted for everyone and the reader is
    /// not the sender.
    pub content: Option<MessageContent>,
    pub visibility: Visibility,
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_for_everyone: bool,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredReaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredStatus {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub state: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// A row advanced to `read` by a bulk mark-read, with the sender to notify.
#[derive(Debug, Clone)]
pub struct ReadAdvance {
    pub message_id: MessageId,
    pub sender_id: UserId,
}

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.sender_tenant, \
     m.content_kind, m.body, m.media_ref, m.mime_type, m.latitude, m.longitude, \
     m.visibility, m.reply_to, m.forwarded_from, m.edited, m.edited_at, \
     m.deleted_for_everyone, m.pinned, m.created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // ---- identities -----------------------------------------------------

    pub async fn create_user(&self, username: &str, tenant_id: TenantId) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, tenant_id) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET tenant_id=excluded.tenant_id
             RETURNING id",
        )
        .bind(username)
        .bind(tenant_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT id, username, tenant_id FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            tenant_id: TenantId(r.get::<i64, _>(2)),
        }))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    // ---- conversation directory -----------------------------------------

    pub async fn create_group(&self, name: &str, creator: UserId) -> Result<ConversationId> {
        let creator_tenant = self
            .user(creator)
            .await?
            .map(|u| u.tenant_id)
            .context("creator does not exist")?;

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, name, created_by) VALUES ('group', ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(creator.0)
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, tenant_id) VALUES (?, ?, 'admin', ?)",
        )
        .bind(conversation_id.0)
        .bind(creator.0)
        .bind(creator_tenant.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(conversation_id)
    }

    /// Returns the direct conversation for the unordered pair, creating it
    /// (with both memberships) when absent. The UNIQUE `direct_key` column
    /// makes this race-safe under concurrent bootstraps.
    pub async fn find_or_create_direct(&self, a: UserId, b: UserId) -> Result<ConversationId> {
        let a_tenant = self
            .user(a)
            .await?
            .map(|u| u.tenant_id)
            .context("user does not exist")?;
        let b_tenant = self
            .user(b)
            .await?
            .map(|u| u.tenant_id)
            .context("peer does not exist")?;

        let key = direct_key(a, b);
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, created_by, direct_key) VALUES ('direct', ?, ?)
             ON CONFLICT(direct_key) DO UPDATE SET direct_key=excluded.direct_key
             RETURNING id",
        )
        .bind(a.0)
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        for (user, tenant) in [(a, a_tenant), (b, b_tenant)] {
            sqlx::query(
                "INSERT OR IGNORE INTO memberships (conversation_id, user_id, role, tenant_id)
                 VALUES (?, ?, 'member', ?)",
            )
            .bind(conversation_id.0)
            .bind(user.0)
            .bind(tenant.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT id, kind, name, created_by, created_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredConversation {
            conversation_id: ConversationId(r.get::<i64, _>(0)),
            kind: kind_from_str(&r.get::<String, _>(1)),
            name: r.get::<Option<String>, _>(2),
            created_by: UserId(r.get::<i64, _>(3)),
            created_at: r.get::<DateTime<Utc>, _>(4),
        }))
    }

    pub async fn add_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: Role,
    ) -> Result<()> {
        let tenant = self
            .user(user_id)
            .await?
            .map(|u| u.tenant_id)
            .context("member does not exist")?;
        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, tenant_id)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET role=excluded.role",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(role_to_str(role))
        .bind(tenant.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM memberships WHERE conversation_id = ? AND user_id = ?")
            .bind(conversation_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn admin_count(&self, conversation_id: ConversationId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM memberships WHERE conversation_id = ? AND role = 'admin'",
        )
        .bind(conversation_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn members_of(&self, conversation_id: ConversationId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, m.tenant_id, m.role, m.joined_at
             FROM memberships m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ?
             ORDER BY lower(u.username) ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(member_from_row).collect())
    }

    pub async fn membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<StoredMember>> {
        let row = sqlx::query(
            "SELECT u.id, u.username, m.tenant_id, m.role, m.joined_at
             FROM memberships m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ? AND m.user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(member_from_row))
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationEntry>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.name, m.pinned
             FROM conversations c
             INNER JOIN memberships m ON m.conversation_id = c.id
             WHERE m.user_id = ?
             ORDER BY m.pinned DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ConversationEntry {
                conversation_id: ConversationId(r.get::<i64, _>(0)),
                kind: kind_from_str(&r.get::<String, _>(1)),
                name: r.get::<Option<String>, _>(2),
                pinned: r.get::<bool, _>(3),
            })
            .collect())
    }

    pub async fn set_conversation_pinned(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        pinned: bool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE memberships SET pinned = ? WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(pinned)
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    // ---- message store --------------------------------------------------

    pub async fn insert_message(&self, new: NewMessage<'_>) -> Result<StoredMessage> {
        let (kind, body, media_ref, mime_type, latitude, longitude) = content_columns(new.content);
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, sender_tenant, content_kind,
                 body, media_ref, mime_type, latitude, longitude, visibility, reply_to, forwarded_from)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id, created_at",
        )
        .bind(new.conversation_id.0)
        .bind(new.sender_id.0)
        .bind(new.sender_tenant.0)
        .bind(kind)
        .bind(body)
        .bind(media_ref)
        .bind(mime_type)
        .bind(latitude)
        .bind(longitude)
        .bind(visibility_to_str(new.visibility))
        .bind(new.reply_to.map(|id| id.0))
        .bind(new.forwarded_from.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            sender_tenant: new.sender_tenant,
            content: Some(new.content.clone()),
            visibility: new.visibility,
            reply_to: new.reply_to,
            forwarded_from: new.forwarded_from,
            edited: false,
            edited_at: None,
            deleted_for_everyone: false,
            pinned: false,
            created_at: rec.get::<DateTime<Utc>, _>(1),
        })
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| message_from_row(&r, None)))
    }

    /// Replaces the content and stamps the edit flag. Refuses rows already
    /// deleted for everyone.
    pub async fn mark_edited(
        &self,
        message_id: MessageId,
        content: &MessageContent,
    ) -> Result<bool> {
        let (kind, body, media_ref, mime_type, latitude, longitude) = content_columns(content);
        let updated = sqlx::query(
            "UPDATE messages
             SET content_kind = ?, body = ?, media_ref = ?, mime_type = ?, latitude = ?, longitude = ?,
                 edited = 1, edited_at = ?
             WHERE id = ? AND deleted_for_everyone = 0",
        )
        .bind(kind)
        .bind(body)
        .bind(media_ref)
        .bind(mime_type)
        .bind(latitude)
        .bind(longitude)
        .bind(Utc::now())
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn mark_deleted_for_everyone(&self, message_id: MessageId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET deleted_for_everyone = 1 WHERE id = ? AND deleted_for_everyone = 0",
        )
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn hide_message_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO message_hidden (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_message_pinned(&self, message_id: MessageId, pinned: bool) -> Result<bool> {
        let updated = sqlx::query("UPDATE messages SET pinned = ? WHERE id = ?")
            .bind(pinned)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Flips the requesting user's star. Returns whether the message is
    /// starred after the call.
    pub async fn toggle_star(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO message_stars (message_id, user_id) VALUES (?, ?)",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted > 0 {
            return Ok(true);
        }
        sqlx::query("DELETE FROM message_stars WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(false)
    }

    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO message_reactions (message_id, user_id, emoji) VALUES (?, ?, ?)",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed > 0)
    }

    pub async fn reactions_for_message(&self, message_id: MessageId) -> Result<Vec<StoredReaction>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, emoji, reacted_at
             FROM message_reactions WHERE message_id = ? ORDER BY reacted_at ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredReaction {
                message_id: MessageId(r.get::<i64, _>(0)),
                user_id: UserId(r.get::<i64, _>(1)),
                emoji: r.get::<String, _>(2),
                reacted_at: r.get::<DateTime<Utc>, _>(3),
            })
            .collect())
    }

    /// Newest-first page, reversed to chronological order before returning.
    /// Filters rows the requester hid for themselves and, in group
    /// conversations, tenant-scoped messages from other tenants.
    pub async fn list_recent_messages(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        requester_tenant: TenantId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let filter = "AND NOT EXISTS (
                 SELECT 1 FROM message_hidden h WHERE h.message_id = m.id AND h.user_id = ?
             )
             AND (c.kind = 'direct' OR m.visibility = 'all_members'
                  OR m.sender_tenant = ? OR m.sender_id = ?)";
        let mut rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 INNER JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.conversation_id = ? AND m.id < ? {filter}
                 ORDER BY m.id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(before_id.0)
            .bind(requester.0)
            .bind(requester_tenant.0)
            .bind(requester.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 INNER JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.conversation_id = ? {filter}
                 ORDER BY m.id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(requester.0)
            .bind(requester_tenant.0)
            .bind(requester.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        Ok(rows
            .iter()
            .map(|r| message_from_row(r, Some(requester)))
            .collect())
    }

    // ---- delivery status ------------------------------------------------

    pub async fn insert_delivery_statuses(
        &self,
        message_id: MessageId,
        recipients: &[UserId],
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for recipient in recipients {
            sqlx::query(
                "INSERT INTO delivery_status (message_id, recipient_id, state, updated_at)
                 VALUES (?, ?, 0, ?)
                 ON CONFLICT(message_id, recipient_id) DO NOTHING",
            )
            .bind(message_id.0)
            .bind(recipient.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Monotonic compare-and-set. Returns whether the row actually moved;
    /// a backward or already-reached transition is a no-op, not an error.
    pub async fn advance_delivery_status(
        &self,
        message_id: MessageId,
        recipient: UserId,
        target: DeliveryState,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE delivery_status SET state = ?, updated_at = ?
             WHERE message_id = ? AND recipient_id = ? AND state < ?",
        )
        .bind(target.rank())
        .bind(Utc::now())
        .bind(message_id.0)
        .bind(recipient.0)
        .bind(target.rank())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn delivery_state(
        &self,
        message_id: MessageId,
        recipient: UserId,
    ) -> Result<Option<DeliveryState>> {
        let row = sqlx::query(
            "SELECT state FROM delivery_status WHERE message_id = ? AND recipient_id = ?",
        )
        .bind(message_id.0)
        .bind(recipient.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| DeliveryState::from_rank(r.get::<i64, _>(0))))
    }

    pub async fn statuses_for_message(&self, message_id: MessageId) -> Result<Vec<StoredStatus>> {
        let rows = sqlx::query(
            "SELECT message_id, recipient_id, state, updated_at
             FROM delivery_status WHERE message_id = ? ORDER BY recipient_id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredStatus {
                message_id: MessageId(r.get::<i64, _>(0)),
                recipient_id: UserId(r.get::<i64, _>(1)),
                state: DeliveryState::from_rank(r.get::<i64, _>(2)),
                updated_at: r.get::<DateTime<Utc>, _>(3),
            })
            .collect())
    }

    /// Advances every unread row the recipient holds in the conversation to
    /// `read`, in message-creation order. Runs in one transaction so a
    /// concurrent per-row advance cannot observe a half-applied bulk read.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
    ) -> Result<Vec<ReadAdvance>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT ds.message_id, m.sender_id
             FROM delivery_status ds
             INNER JOIN messages m ON m.id = ds.message_id
             WHERE ds.recipient_id = ? AND ds.state < 2 AND m.conversation_id = ?
             ORDER BY m.id ASC",
        )
        .bind(recipient.0)
        .bind(conversation_id.0)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE delivery_status SET state = 2, updated_at = ?
             WHERE recipient_id = ? AND state < 2
               AND message_id IN (SELECT id FROM messages WHERE conversation_id = ?)",
        )
        .bind(Utc::now())
        .bind(recipient.0)
        .bind(conversation_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|r| ReadAdvance {
                message_id: MessageId(r.get::<i64, _>(0)),
                sender_id: UserId(r.get::<i64, _>(1)),
            })
            .collect())
    }

    /// Backlog for a reconnecting user: every message still at `sent`
    /// across their conversations, ordered conversation-then-message,
    /// capped at the most recent `per_conversation_cap` rows per
    /// conversation. The second return value reports whether any
    /// conversation was truncated.
    pub async fn undelivered_for_user(
        &self,
        user_id: UserId,
        per_conversation_cap: u32,
    ) -> Result<(Vec<StoredMessage>, bool)> {
        let conversation_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT conversation_id FROM memberships WHERE user_id = ? ORDER BY conversation_id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut backlog = Vec::new();
        let mut truncated = false;
        for conversation_id in conversation_ids {
            let mut rows = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 INNER JOIN delivery_status ds ON ds.message_id = m.id
                 WHERE ds.recipient_id = ? AND ds.state = 0 AND m.conversation_id = ?
                   AND NOT EXISTS (
                       SELECT 1 FROM message_hidden h WHERE h.message_id = m.id AND h.user_id = ?
                   )
                 ORDER BY m.id DESC
                 LIMIT ?"
            ))
            .bind(user_id.0)
            .bind(conversation_id)
            .bind(user_id.0)
            .bind(per_conversation_cap + 1)
            .fetch_all(&self.pool)
            .await?;

            if rows.len() > per_conversation_cap as usize {
                truncated = true;
                rows.truncate(per_conversation_cap as usize);
            }
            rows.reverse();
            backlog.extend(rows.iter().map(|r| message_from_row(r, Some(user_id))));
        }
        Ok((backlog, truncated))
    }
}

fn member_from_row(r: SqliteRow) -> StoredMember {
    StoredMember {
        user_id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        tenant_id: TenantId(r.get::<i64, _>(2)),
        role: role_from_str(&r.get::<String, _>(3)),
        joined_at: r.get::<DateTime<Utc>, _>(4),
    }
}

fn message_from_row(r: &SqliteRow, requester: Option<UserId>) -> StoredMessage {
    let sender_id = UserId(r.get::<i64, _>(2));
    let deleted_for_everyone = r.get::<bool, _>(15);
    // A `None` requester is an internal read; redaction applies only to
    // reader-scoped fetches.
    let redacted = deleted_for_everyone && requester.is_some_and(|reader| reader != sender_id);
    let content = if redacted {
        None
    } else {
        Some(content_from_row(r))
    };
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        conversation_id: ConversationId(r.get::<i64, _>(1)),
        sender_id,
        sender_tenant: TenantId(r.get::<i64, _>(3)),
        content,
        visibility: visibility_from_str(&r.get::<String, _>(10)),
        reply_to: r.get::<Option<i64>, _>(11).map(MessageId),
        forwarded_from: r.get::<Option<i64>, _>(12).map(MessageId),
        edited: r.get::<bool, _>(13),
        edited_at: r.get::<Option<DateTime<Utc>>, _>(14),
        deleted_for_everyone,
        pinned: r.get::<bool, _>(16),
        created_at: r.get::<DateTime<Utc>, _>(17),
    }
}

fn content_from_row(r: &SqliteRow) -> MessageContent {
    match r.get::<String, _>(4).as_str() {
        "media" => MessageContent::Media {
            media_ref: r.get::<Option<String>, _>(6).unwrap_or_default(),
            mime_type: r.get::<Option<String>, _>(7),
        },
        "location" => MessageContent::Location {
            latitude: r.get::<Option<f64>, _>(8).unwrap_or_default(),
            longitude: r.get::<Option<f64>, _>(9).unwrap_or_default(),
        },
        _ => MessageContent::Text {
            text: r.get::<Option<String>, _>(5).unwrap_or_default(),
        },
    }
}

type ContentColumns<'a> = (
    &'static str,
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    Option<f64>,
    Option<f64>,
);

fn content_columns(content: &MessageContent) -> ContentColumns<'_> {
    match content {
        MessageContent::Text { text } => ("text", Some(text.as_str()), None, None, None, None),
        MessageContent::Media {
            media_ref,
            mime_type,
        } => (
            "media",
            None,
            Some(media_ref.as_str()),
            mime_type.as_deref(),
            None,
            None,
        ),
        MessageContent::Location {
            latitude,
            longitude,
        } => ("location", None, None, None, Some(*latitude), Some(*longitude)),
    }
}

fn direct_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
    format!("{lo}:{hi}")
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::Admin => "admin",
        Role::Member => "member",
    }
}

fn role_from_str(raw: &str) -> Role {
    match raw {
        "admin" => Role::Admin,
        _ => Role::Member,
    }
}

fn kind_from_str(raw: &str) -> ConversationKind {
    match raw {
        "direct" => ConversationKind::Direct,
        _ => ConversationKind::Group,
    }
}

fn visibility_to_str(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::TenantOnly => "tenant_only",
        Visibility::AllMembers => "all_members",
    }
}

fn visibility_from_str(raw: &str) -> Visibility {
    match raw {
        "tenant_only" => Visibility::TenantOnly,
        _ => Visibility::AllMembers,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
