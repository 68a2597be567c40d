use shared::{
    domain::{
        ConversationId, ConversationKind, MessageContent, MessageId, Role, UserId, Visibility,
    },
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MemberSummary, MessagePayload, StatusSummary},
};
use storage::{NewMessage, Storage, StoredConversation, StoredMember, StoredMessage};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub sender: UserId,
    pub conversation_id: Option<ConversationId>,
    pub peer_user_id: Option<UserId>,
    pub content: MessageContent,
    pub visibility: Option<Visibility>,
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
}

/// Validates and persists a send request. Dispatch happens at the caller
/// strictly after this returns, so the row is durable before any fan-out.
pub async fn send_message(
    ctx: &ApiContext,
    request: SendMessage,
) -> Result<StoredMessage, ApiError> {
    if request.content.is_empty() {
        return Err(ApiError::validation("message content is empty"));
    }

    let conversation_id = match (request.conversation_id, request.peer_user_id) {
        (Some(conversation_id), _) => conversation_id,
        (None, Some(peer)) => {
            if peer == request.sender {
                return Err(ApiError::validation(
                    "cannot open a direct conversation with yourself",
                ));
            }
            ctx.storage
                .user(peer)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::not_found("peer identity not found"))?;
            ctx.storage
                .find_or_create_direct(request.sender, peer)
                .await
                .map_err(internal)?
        }
        (None, None) => {
            return Err(ApiError::validation(
                "neither a conversation nor a peer identity was addressed",
            ));
        }
    };

    let (_, sender_membership) = ensure_membership(ctx, conversation_id, request.sender).await?;

    if let Some(reply_to) = request.reply_to {
        let target = ctx
            .storage
            .message(reply_to)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found("reply target not found"))?;
        if target.conversation_id != conversation_id {
            return Err(ApiError::not_found("reply target is not in this conversation"));
        }
    }
    if let Some(forwarded_from) = request.forwarded_from {
        ctx.storage
            .message(forwarded_from)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found("forwarded message not found"))?;
    }

    ctx.storage
        .insert_message(NewMessage {
            conversation_id,
            sender_id: request.sender,
            sender_tenant: sender_membership.tenant_id,
            content: &request.content,
            visibility: request.visibility.unwrap_or(Visibility::AllMembers),
            reply_to: request.reply_to,
            forwarded_from: request.forwarded_from,
        })
        .await
        .map_err(internal)
}

pub async fn list_messages(
    ctx: &ApiContext,
    requester: UserId,
    conversation_id: ConversationId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let (_, membership) = ensure_membership(ctx, conversation_id, requester).await?;
    let messages = ctx
        .storage
        .list_recent_messages(conversation_id, requester, membership.tenant_id, limit, before)
        .await
        .map_err(internal)?;
    delivery::message_payloads(&ctx.storage, &messages)
        .await
        .map_err(internal)
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let entries = ctx
        .storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(entries
        .into_iter()
        .map(|entry| ConversationSummary {
            conversation_id: entry.conversation_id,
            kind: entry.kind,
            name: entry.name,
            pinned: entry.pinned,
        })
        .collect())
}

pub async fn create_group(
    ctx: &ApiContext,
    creator: UserId,
    name: &str,
) -> Result<ConversationId, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("group name is empty"));
    }
    ctx.storage
        .user(creator)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("unknown identity"))?;
    ctx.storage.create_group(name, creator).await.map_err(internal)
}

pub async fn create_direct(
    ctx: &ApiContext,
    user_id: UserId,
    peer_user_id: UserId,
) -> Result<ConversationId, ApiError> {
    if user_id == peer_user_id {
        return Err(ApiError::validation(
            "cannot open a direct conversation with yourself",
        ));
    }
    for id in [user_id, peer_user_id] {
        ctx.storage
            .user(id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found("unknown identity"))?;
    }
    ctx.storage
        .find_or_create_direct(user_id, peer_user_id)
        .await
        .map_err(internal)
}

pub async fn list_members(
    ctx: &ApiContext,
    requester: UserId,
    conversation_id: ConversationId,
) -> Result<Vec<MemberSummary>, ApiError> {
    ensure_membership(ctx, conversation_id, requester).await?;
    let members = ctx
        .storage
        .members_of(conversation_id)
        .await
        .map_err(internal)?;
    Ok(members
        .into_iter()
        .map(|member| MemberSummary {
            conversation_id,
            user_id: member.user_id,
            username: member.username,
            tenant_id: member.tenant_id,
            role: member.role,
        })
        .collect())
}

pub async fn add_member(
    ctx: &ApiContext,
    actor: UserId,
    conversation_id: ConversationId,
    target: UserId,
    role: Role,
) -> Result<(), ApiError> {
    let (conversation, actor_membership) = ensure_membership(ctx, conversation_id, actor).await?;
    if conversation.kind != ConversationKind::Group {
        return Err(ApiError::validation(
            "members can only be added to group conversations",
        ));
    }
    if actor_membership.role != Role::Admin {
        return Err(ApiError::permission_denied(
            "adding members requires the admin role",
        ));
    }
    ctx.storage
        .user(target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("unknown identity"))?;
    ctx.storage
        .add_member(conversation_id, target, role)
        .await
        .map_err(internal)
}

/// Admins may remove anyone; a member may remove themselves (leave). The
/// last admin of a group can never be removed.
pub async fn remove_member(
    ctx: &ApiContext,
    actor: UserId,
    conversation_id: ConversationId,
    target: UserId,
) -> Result<(), ApiError> {
    let (conversation, actor_membership) = ensure_membership(ctx, conversation_id, actor).await?;
    if conversation.kind != ConversationKind::Group {
        return Err(ApiError::validation(
            "members can only be removed from group conversations",
        ));
    }
    if actor_membership.role != Role::Admin && actor != target {
        return Err(ApiError::permission_denied(
            "removing another member requires the admin role",
        ));
    }

    let target_membership = ctx
        .storage
        .membership(conversation_id, target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("target is not a member"))?;
    if target_membership.role == Role::Admin {
        let admins = ctx.storage.admin_count(conversation_id).await.map_err(internal)?;
        if admins <= 1 {
            return Err(ApiError::validation("cannot remove the last admin"));
        }
    }

    ctx.storage
        .remove_member(conversation_id, target)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn pin_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    pinned: bool,
) -> Result<(), ApiError> {
    ensure_membership(ctx, conversation_id, user_id).await?;
    ctx.storage
        .set_conversation_pinned(conversation_id, user_id, pinned)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn edit_message(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
    content: MessageContent,
) -> Result<(), ApiError> {
    if content.is_empty() {
        return Err(ApiError::validation("message content is empty"));
    }
    let message = require_message(ctx, message_id).await?;
    if message.sender_id != actor {
        return Err(ApiError::permission_denied("only the sender can edit a message"));
    }
    if message.deleted_for_everyone {
        return Err(ApiError::validation("message was deleted"));
    }
    let updated = ctx
        .storage
        .mark_edited(message_id, &content)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::validation("message was deleted"));
    }
    Ok(())
}

pub async fn delete_message(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
    for_everyone: bool,
) -> Result<(), ApiError> {
    let message = require_message(ctx, message_id).await?;
    if for_everyone {
        if message.sender_id != actor {
            return Err(ApiError::permission_denied(
                "only the sender can delete a message for everyone",
            ));
        }
        ctx.storage
            .mark_deleted_for_everyone(message_id)
            .await
            .map_err(internal)?;
        return Ok(());
    }

    ensure_membership(ctx, message.conversation_id, actor).await?;
    ctx.storage
        .hide_message_for_user(message_id, actor)
        .await
        .map_err(internal)
}

pub async fn pin_message(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
    pinned: bool,
) -> Result<(), ApiError> {
    let message = require_message(ctx, message_id).await?;
    let (_, membership) = ensure_membership(ctx, message.conversation_id, actor).await?;
    if membership.role != Role::Admin {
        return Err(ApiError::permission_denied("pinning requires the admin role"));
    }
    ctx.storage
        .set_message_pinned(message_id, pinned)
        .await
        .map_err(internal)?;
    Ok(())
}

/// Flips the actor's star on the message; returns the resulting state.
pub async fn star_message(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
) -> Result<bool, ApiError> {
    let message = require_message(ctx, message_id).await?;
    ensure_membership(ctx, message.conversation_id, actor).await?;
    ctx.storage
        .toggle_star(message_id, actor)
        .await
        .map_err(internal)
}

pub async fn add_reaction(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<(), ApiError> {
    if emoji.trim().is_empty() {
        return Err(ApiError::validation("reaction emoji is empty"));
    }
    let message = require_message(ctx, message_id).await?;
    ensure_membership(ctx, message.conversation_id, actor).await?;
    ctx.storage
        .add_reaction(message_id, actor, emoji)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn remove_reaction(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<(), ApiError> {
    let message = require_message(ctx, message_id).await?;
    ensure_membership(ctx, message.conversation_id, actor).await?;
    ctx.storage
        .remove_reaction(message_id, actor, emoji)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn message_statuses(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
) -> Result<Vec<StatusSummary>, ApiError> {
    let message = require_message(ctx, message_id).await?;
    ensure_membership(ctx, message.conversation_id, actor).await?;
    let statuses = ctx
        .storage
        .statuses_for_message(message_id)
        .await
        .map_err(internal)?;
    Ok(statuses
        .into_iter()
        .map(|status| StatusSummary {
            message_id: status.message_id,
            recipient_id: status.recipient_id,
            state: status.state,
            updated_at: status.updated_at,
        })
        .collect())
}

pub async fn ensure_conversation_member(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    ensure_membership(ctx, conversation_id, user_id).await?;
    Ok(())
}

/// Conversation-not-found and not-a-member are distinct failures: the
/// first is a data error, the second an authorization one.
async fn ensure_membership(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(StoredConversation, StoredMember), ApiError> {
    let conversation = ctx
        .storage
        .conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    let membership = ctx
        .storage
        .membership(conversation_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::permission_denied("user is not a member"))?;
    Ok((conversation, membership))
}

async fn require_message(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    ctx.storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
