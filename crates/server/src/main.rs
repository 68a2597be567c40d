use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use delivery::{
    dispatch::Dispatcher, notify::LogNotifier, presence::PresenceRegistry, replay::ReplayQueue,
    status::StatusTracker,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        ConversationId, DeliveryState, MessageContent, MessageId, Role, UserId, Visibility,
    },
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MemberSummary, MessagePayload, StatusSummary},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod api;
mod config;
mod ws;

use api::ApiContext;
use config::{load_settings, prepare_database_url};

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) presence: Arc<PresenceRegistry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) tracker: StatusTracker,
    pub(crate) replay: ReplayQueue,
}

const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    tenant_id: i64,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    user_id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DirectRequest {
    user_id: i64,
    peer_user_id: i64,
}

#[derive(Debug, Serialize)]
struct ConversationCreatedResponse {
    conversation_id: i64,
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    user_id: i64,
    target_user_id: i64,
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    user_id: i64,
    #[serde(default)]
    conversation_id: Option<i64>,
    #[serde(default)]
    peer_user_id: Option<i64>,
    content: MessageContent,
    #[serde(default)]
    visibility: Option<Visibility>,
    #[serde(default)]
    reply_to: Option<i64>,
    #[serde(default)]
    forwarded_from: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    user_id: i64,
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
struct DeleteMessageRequest {
    user_id: i64,
    #[serde(default)]
    for_everyone: bool,
}

#[derive(Debug, Deserialize)]
struct PinRequest {
    user_id: i64,
    pinned: bool,
}

#[derive(Debug, Deserialize)]
struct StarRequest {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ReactionRequest {
    user_id: i64,
    emoji: String,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    user_id: i64,
    state: DeliveryState,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = app_state(storage, settings.replay_limit);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "delivery server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn app_state(storage: Storage, replay_limit: u32) -> AppState {
    let presence = Arc::new(PresenceRegistry::new());
    AppState {
        api: ApiContext {
            storage: storage.clone(),
        },
        dispatcher: Dispatcher::new(storage.clone(), presence.clone(), Arc::new(LogNotifier)),
        tracker: StatusTracker::new(storage.clone(), presence.clone()),
        replay: ReplayQueue::new(storage, presence.clone(), replay_limit),
        presence,
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/conversations", get(http_list_conversations))
        .route("/conversations", post(http_create_group))
        .route("/conversations/direct", post(http_create_direct))
        .route("/conversations/:conversation_id/members", get(http_list_members))
        .route("/conversations/:conversation_id/members", post(http_add_member))
        .route(
            "/conversations/:conversation_id/members/:target_user_id",
            delete(http_remove_member),
        )
        .route("/conversations/:conversation_id/messages", get(http_list_messages))
        .route("/conversations/:conversation_id/read", post(http_mark_conversation_read))
        .route("/conversations/:conversation_id/pin", post(http_pin_conversation))
        .route("/messages", post(http_send_message))
        .route("/messages/:message_id/edit", post(http_edit_message))
        .route("/messages/:message_id/delete", post(http_delete_message))
        .route("/messages/:message_id/pin", post(http_pin_message))
        .route("/messages/:message_id/star", post(http_star_message))
        .route("/messages/:message_id/reactions", post(http_add_reaction))
        .route("/messages/:message_id/reactions", delete(http_remove_reaction))
        .route("/messages/:message_id/status", get(http_message_statuses))
        .route("/messages/:message_id/status", post(http_update_status))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn error_reply(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(error_reply(ApiError::validation("username is empty")));
    }
    let user_id = state
        .api
        .storage
        .create_user(username, shared::domain::TenantId(req.tenant_id))
        .await
        .map_err(|e| error_reply(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<ConversationSummary>>, (StatusCode, Json<ApiError>)> {
    let conversations = api::list_conversations(&state.api, UserId(q.user_id))
        .await
        .map_err(error_reply)?;
    Ok(Json(conversations))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<ConversationCreatedResponse>, (StatusCode, Json<ApiError>)> {
    let conversation_id = api::create_group(&state.api, UserId(req.user_id), &req.name)
        .await
        .map_err(error_reply)?;
    Ok(Json(ConversationCreatedResponse {
        conversation_id: conversation_id.0,
    }))
}

async fn http_create_direct(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DirectRequest>,
) -> Result<Json<ConversationCreatedResponse>, (StatusCode, Json<ApiError>)> {
    let conversation_id =
        api::create_direct(&state.api, UserId(req.user_id), UserId(req.peer_user_id))
            .await
            .map_err(error_reply)?;
    Ok(Json(ConversationCreatedResponse {
        conversation_id: conversation_id.0,
    }))
}

async fn http_list_members(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<MemberSummary>>, (StatusCode, Json<ApiError>)> {
    let members = api::list_members(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
    )
    .await
    .map_err(error_reply)?;
    Ok(Json(members))
}

async fn http_add_member(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::add_member(
        &state.api,
        UserId(req.user_id),
        ConversationId(conversation_id),
        UserId(req.target_user_id),
        req.role.unwrap_or(Role::Member),
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, target_user_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::remove_member(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        UserId(target_user_id),
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let limit = q.limit.unwrap_or(100).clamp(1, 100);
    let messages = api::list_messages(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        limit,
        q.before.map(MessageId),
    )
    .await
    .map_err(error_reply)?;
    Ok(Json(messages))
}

async fn http_mark_conversation_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let conversation_id = ConversationId(conversation_id);
    let user_id = UserId(req.user_id);
    api::ensure_conversation_member(&state.api, conversation_id, user_id)
        .await
        .map_err(error_reply)?;
    let advanced = state
        .tracker
        .mark_conversation_read(conversation_id, user_id)
        .await
        .map_err(|e| error_reply(e.into()))?;
    Ok(Json(serde_json::json!({ "read": advanced })))
}

async fn http_pin_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<PinRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::pin_conversation(
        &state.api,
        UserId(req.user_id),
        ConversationId(conversation_id),
        req.pinned,
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Send operation: persist, then dispatch. A dispatch failure after the
/// durable insert is reported as an internal error rather than a silent
/// success; replay can still heal recipients whose status rows exist.
async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let message = api::send_message(
        &state.api,
        api::SendMessage {
            sender: UserId(req.user_id),
            conversation_id: req.conversation_id.map(ConversationId),
            peer_user_id: req.peer_user_id.map(UserId),
            content: req.content,
            visibility: req.visibility,
            reply_to: req.reply_to.map(MessageId),
            forwarded_from: req.forwarded_from.map(MessageId),
        },
    )
    .await
    .map_err(error_reply)?;

    state
        .dispatcher
        .dispatch(&message)
        .await
        .map_err(|e| error_reply(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    let payload = delivery::message_payload(&state.api.storage, &message)
        .await
        .map_err(|e| error_reply(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(payload))
}

async fn http_edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::edit_message(
        &state.api,
        UserId(req.user_id),
        MessageId(message_id),
        req.content,
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<DeleteMessageRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::delete_message(
        &state.api,
        UserId(req.user_id),
        MessageId(message_id),
        req.for_everyone,
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_pin_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<PinRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::pin_message(
        &state.api,
        UserId(req.user_id),
        MessageId(message_id),
        req.pinned,
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_star_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<StarRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let starred = api::star_message(&state.api, UserId(req.user_id), MessageId(message_id))
        .await
        .map_err(error_reply)?;
    Ok(Json(serde_json::json!({ "starred": starred })))
}

async fn http_add_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::add_reaction(
        &state.api,
        UserId(req.user_id),
        MessageId(message_id),
        &req.emoji,
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::remove_reaction(
        &state.api,
        UserId(req.user_id),
        MessageId(message_id),
        &req.emoji,
    )
    .await
    .map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_message_statuses(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<StatusSummary>>, (StatusCode, Json<ApiError>)> {
    let statuses = api::message_statuses(&state.api, UserId(q.user_id), MessageId(message_id))
        .await
        .map_err(error_reply)?;
    Ok(Json(statuses))
}

/// Status-update operation exposed to collaborators: advance one
/// (message, recipient) row toward the target state.
async fn http_update_status(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let advanced = state
        .tracker
        .advance(MessageId(message_id), UserId(req.user_id), req.state)
        .await
        .map_err(|e| error_reply(e.into()))?;
    Ok(Json(serde_json::json!({ "advanced": advanced })))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::ws_connection(state, socket, UserId(q.user_id)))
}
