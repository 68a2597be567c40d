use super::*;

use shared::domain::TenantId;

async fn setup() -> (ApiContext, UserId, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice", TenantId(1))
        .await
        .expect("alice");
    let bob = storage.create_user("bob", TenantId(1)).await.expect("bob");
    let carol = storage
        .create_user("carol", TenantId(2))
        .await
        .expect("carol");
    (ApiContext { storage }, alice, bob, carol)
}

fn text(body: &str) -> MessageContent {
    MessageContent::Text {
        text: body.to_string(),
    }
}

fn send_request(sender: UserId, conversation_id: ConversationId, body: &str) -> SendMessage {
    SendMessage {
        sender,
        conversation_id: Some(conversation_id),
        peer_user_id: None,
        content: text(body),
        visibility: None,
        reply_to: None,
        forwarded_from: None,
    }
}

#[tokio::test]
async fn send_requires_a_conversation_or_a_peer() {
    let (ctx, alice, _, _) = setup().await;
    let err = send_message(
        &ctx,
        SendMessage {
            sender: alice,
            conversation_id: None,
            peer_user_id: None,
            content: text("hi"),
            visibility: None,
            reply_to: None,
            forwarded_from: None,
        },
    )
    .await
    .expect_err("should fail");
    assert!(matches!(err.code, ErrorCode::Validation));
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let (ctx, alice, bob, _) = setup().await;
    let err = send_message(
        &ctx,
        SendMessage {
            sender: alice,
            conversation_id: None,
            peer_user_id: Some(bob),
            content: text("   "),
            visibility: None,
            reply_to: None,
            forwarded_from: None,
        },
    )
    .await
    .expect_err("should fail");
    assert!(matches!(err.code, ErrorCode::Validation));
}

#[tokio::test]
async fn sending_to_a_peer_reuses_one_direct_conversation() {
    let (ctx, alice, bob, _) = setup().await;
    let first = send_message(
        &ctx,
        SendMessage {
            sender: alice,
            conversation_id: None,
            peer_user_id: Some(bob),
            content: text("hi"),
            visibility: None,
            reply_to: None,
            forwarded_from: None,
        },
    )
    .await
    .expect("first send");

    let second = send_message(
        &ctx,
        SendMessage {
            sender: bob,
            conversation_id: None,
            peer_user_id: Some(alice),
            content: text("hello back"),
            visibility: None,
            reply_to: None,
            forwarded_from: None,
        },
    )
    .await
    .expect("second send");

    assert_eq!(first.conversation_id, second.conversation_id);
}

#[tokio::test]
async fn non_member_cannot_send_into_a_group() {
    let (ctx, alice, _, carol) = setup().await;
    let group = ctx
        .storage
        .create_group("private", alice)
        .await
        .expect("group");

    let err = send_message(&ctx, send_request(carol, group, "intruding"))
        .await
        .expect_err("should fail");
    assert!(matches!(err.code, ErrorCode::PermissionDenied));

    let err = send_message(&ctx, send_request(alice, ConversationId(999), "void"))
        .await
        .expect_err("should fail");
    assert!(matches!(err.code, ErrorCode::NotFound));
}

#[tokio::test]
async fn reply_target_must_exist_in_the_same_conversation() {
    let (ctx, alice, bob, _) = setup().await;
    let direct = ctx
        .storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");
    let group = ctx.storage.create_group("other", alice).await.expect("group");
    let elsewhere = send_message(&ctx, send_request(alice, group, "elsewhere"))
        .await
        .expect("group message");

    let mut request = send_request(alice, direct, "reply");
    request.reply_to = Some(MessageId(4242));
    let err = send_message(&ctx, request)
        .await
        .expect_err("missing reply target");
    assert!(matches!(err.code, ErrorCode::NotFound));

    let mut request = send_request(alice, direct, "reply");
    request.reply_to = Some(elsewhere.message_id);
    let err = send_message(&ctx, request)
        .await
        .expect_err("cross-conversation reply");
    assert!(matches!(err.code, ErrorCode::NotFound));
}

#[tokio::test]
async fn only_the_sender_can_edit_and_never_after_deletion() {
    let (ctx, alice, bob, _) = setup().await;
    let direct = ctx
        .storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");
    let message = send_message(&ctx, send_request(alice, direct, "draft"))
        .await
        .expect("send");

    let err = edit_message(&ctx, bob, message.message_id, text("hijack"))
        .await
        .expect_err("non-owner edit");
    assert!(matches!(err.code, ErrorCode::PermissionDenied));

    edit_message(&ctx, alice, message.message_id, text("final"))
        .await
        .expect("owner edit");

    delete_message(&ctx, alice, message.message_id, true)
        .await
        .expect("delete for everyone");
    let err = edit_message(&ctx, alice, message.message_id, text("too late"))
        .await
        .expect_err("edit after delete");
    assert!(matches!(err.code, ErrorCode::Validation));
}

#[tokio::test]
async fn delete_for_everyone_is_sender_only_but_own_copy_is_not() {
    let (ctx, alice, bob, _) = setup().await;
    let direct = ctx
        .storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");
    let message = send_message(&ctx, send_request(alice, direct, "hi"))
        .await
        .expect("send");

    let err = delete_message(&ctx, bob, message.message_id, true)
        .await
        .expect_err("recipient cannot delete for everyone");
    assert!(matches!(err.code, ErrorCode::PermissionDenied));

    // The recipient can drop their own copy.
    delete_message(&ctx, bob, message.message_id, false)
        .await
        .expect("own-copy delete");
    let for_bob = list_messages(&ctx, bob, direct, 50, None)
        .await
        .expect("bob view");
    assert!(for_bob.is_empty());
}

#[tokio::test]
async fn pinning_a_message_requires_the_admin_role() {
    let (ctx, alice, bob, _) = setup().await;
    let group = ctx.storage.create_group("ops", alice).await.expect("group");
    ctx.storage
        .add_member(group, bob, Role::Member)
        .await
        .expect("bob joins");
    let message = send_message(&ctx, send_request(alice, group, "pin me"))
        .await
        .expect("send");

    let err = pin_message(&ctx, bob, message.message_id, true)
        .await
        .expect_err("member pin");
    assert!(matches!(err.code, ErrorCode::PermissionDenied));

    pin_message(&ctx, alice, message.message_id, true)
        .await
        .expect("admin pin");
    let listed = list_messages(&ctx, alice, group, 50, None)
        .await
        .expect("list");
    assert!(listed[0].pinned);
}

#[tokio::test]
async fn stars_and_reactions_require_membership_only() {
    let (ctx, alice, bob, carol) = setup().await;
    let direct = ctx
        .storage
        .find_or_create_direct(alice, bob)
        .await
        .expect("direct");
    let message = send_message(&ctx, send_request(alice, direct, "hi"))
        .await
        .expect("send");

    assert!(star_message(&ctx, bob, message.message_id)
        .await
        .expect("star"));
    add_reaction(&ctx, bob, message.message_id, "👍")
        .await
        .expect("react");

    let err = add_reaction(&ctx, carol, message.message_id, "👀")
        .await
        .expect_err("outsider reaction");
    assert!(matches!(err.code, ErrorCode::PermissionDenied));

    let err = add_reaction(&ctx, bob, message.message_id, "  ")
        .await
        .expect_err("empty emoji");
    assert!(matches!(err.code, ErrorCode::Validation));
}

#[tokio::test]
async fn the_last_admin_cannot_be_removed() {
    let (ctx, alice, bob, _) = setup().await;
    let group = ctx.storage.create_group("ops", alice).await.expect("group");
    ctx.storage
        .add_member(group, bob, Role::Member)
        .await
        .expect("bob joins");

    let err = remove_member(&ctx, alice, group, alice)
        .await
        .expect_err("last admin leaving");
    assert!(matches!(err.code, ErrorCode::Validation));

    // A member cannot remove someone else, but may leave.
    let err = remove_member(&ctx, bob, group, alice)
        .await
        .expect_err("member removing admin");
    assert!(matches!(err.code, ErrorCode::PermissionDenied));
    remove_member(&ctx, bob, group, bob).await.expect("leave");

    // With a second admin, the original admin can be removed.
    ctx.storage
        .add_member(group, bob, Role::Admin)
        .await
        .expect("bob admin");
    remove_member(&ctx, bob, group, alice)
        .await
        .expect("remove original admin");
}

#[tokio::test]
async fn group_visibility_scopes_listing_by_tenant() {
    let (ctx, alice, bob, carol) = setup().await;
    let group = ctx.storage.create_group("mixed", alice).await.expect("group");
    ctx.storage
        .add_member(group, bob, Role::Member)
        .await
        .expect("bob joins");
    ctx.storage
        .add_member(group, carol, Role::Member)
        .await
        .expect("carol joins");

    let mut request = send_request(alice, group, "tenant scoped");
    request.visibility = Some(Visibility::TenantOnly);
    send_message(&ctx, request).await.expect("send");

    let for_bob = list_messages(&ctx, bob, group, 50, None).await.expect("bob");
    assert_eq!(for_bob.len(), 1);
    let for_carol = list_messages(&ctx, carol, group, 50, None)
        .await
        .expect("carol");
    assert!(for_carol.is_empty());
}
