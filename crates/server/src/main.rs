use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use board_api::ApiContext;
use serde::Deserialize;
use shared::{
    domain::{
        BoardId, BoardSummary, CardId, Invitation, InvitationId, InvitationStatus, ListId,
        MemberSummary, UserId, UserSummary,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        BoardEvent, BoardSnapshot, CreateBoardRequest, CreateCardRequest, CreateListRequest,
        CreateUserRequest, InviteMemberRequest, MoveCardRequest, MoveListRequest,
        RenameListRequest, RespondInvitationRequest, UpdateBoardRequest, UpdateCardRequest,
    },
};
use storage::{Storage, StorageOptions};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpError = (StatusCode, Json<ApiError>);
type HttpResult<T> = Result<Json<T>, HttpError>;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct InvitationsQuery {
    user_id: i64,
    #[serde(default)]
    status: Option<InvitationStatus>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
    board_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let options = StorageOptions {
        busy_timeout: settings.busy_timeout(),
        ..StorageOptions::default()
    };
    let storage = Storage::connect(&database_url, &options)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;

    if settings.seed_sample_data {
        if let Some(board_id) = storage.seed_sample_data().await? {
            info!(%board_id, "seeded sample board");
        }
    }

    let state = AppState::new(ApiContext { storage });
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(http_create_user))
        .route("/boards", get(http_list_boards).post(http_create_board))
        .route(
            "/boards/:board_id",
            get(http_get_board).patch(http_update_board),
        )
        .route("/boards/:board_id/members", get(http_list_members))
        .route("/boards/:board_id/lists", post(http_create_list))
        .route("/boards/:board_id/invitations", post(http_invite_member))
        .route(
            "/lists/:list_id",
            patch(http_rename_list).delete(http_delete_list),
        )
        .route("/lists/:list_id/move", put(http_move_list))
        .route("/lists/:list_id/cards", post(http_create_card))
        .route(
            "/cards/:card_id",
            patch(http_update_card).delete(http_delete_card),
        )
        .route("/cards/:card_id/move", put(http_move_card))
        .route("/invitations", get(http_list_invitations))
        .route("/invitations/:invitation_id/respond", post(http_respond_invitation))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    if err.code == ErrorCode::Internal {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

/// Broadcasts a committed change and echoes it back to the caller.
fn published(state: &AppState, result: Result<BoardEvent, ApiError>) -> HttpResult<BoardEvent> {
    let event = result.map_err(http_error)?;
    state.publish(&event);
    Ok(Json(event))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| http_error(ApiError::internal(e.to_string())))?;
    Ok("ok")
}

async fn http_create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> HttpResult<UserSummary> {
    let user = board_api::create_user(&state.api, &req)
        .await
        .map_err(http_error)?;
    Ok(Json(user))
}

async fn http_list_boards(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<BoardSummary>> {
    let boards = board_api::list_boards(&state.api, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(boards))
}

async fn http_create_board(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<CreateBoardRequest>,
) -> HttpResult<BoardSummary> {
    let board = board_api::create_board(&state.api, UserId(q.user_id), &req)
        .await
        .map_err(http_error)?;
    Ok(Json(board))
}

async fn http_get_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<BoardSnapshot> {
    let snapshot = board_api::get_board(&state.api, UserId(q.user_id), BoardId(board_id))
        .await
        .map_err(http_error)?;
    Ok(Json(snapshot))
}

async fn http_update_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<UpdateBoardRequest>,
) -> HttpResult<BoardEvent> {
    let result =
        board_api::update_board(&state.api, UserId(q.user_id), BoardId(board_id), &req).await;
    published(&state, result)
}

async fn http_list_members(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<MemberSummary>> {
    let members = board_api::list_members(&state.api, UserId(q.user_id), BoardId(board_id))
        .await
        .map_err(http_error)?;
    Ok(Json(members))
}

async fn http_create_list(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<CreateListRequest>,
) -> HttpResult<BoardEvent> {
    let result =
        board_api::create_list(&state.api, UserId(q.user_id), BoardId(board_id), &req).await;
    published(&state, result)
}

async fn http_rename_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<RenameListRequest>,
) -> HttpResult<BoardEvent> {
    let result = board_api::rename_list(&state.api, UserId(q.user_id), ListId(list_id), &req).await;
    published(&state, result)
}

async fn http_delete_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<BoardEvent> {
    let result = board_api::delete_list(&state.api, UserId(q.user_id), ListId(list_id)).await;
    published(&state, result)
}

async fn http_move_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<MoveListRequest>,
) -> HttpResult<BoardEvent> {
    let result = board_api::move_list(&state.api, UserId(q.user_id), ListId(list_id), &req).await;
    published(&state, result)
}

async fn http_create_card(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<CreateCardRequest>,
) -> HttpResult<BoardEvent> {
    let result = board_api::create_card(&state.api, UserId(q.user_id), ListId(list_id), &req).await;
    published(&state, result)
}

async fn http_update_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<UpdateCardRequest>,
) -> HttpResult<BoardEvent> {
    let result = board_api::update_card(&state.api, UserId(q.user_id), CardId(card_id), &req).await;
    published(&state, result)
}

async fn http_delete_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<BoardEvent> {
    let result = board_api::delete_card(&state.api, UserId(q.user_id), CardId(card_id)).await;
    published(&state, result)
}

async fn http_move_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<MoveCardRequest>,
) -> HttpResult<BoardEvent> {
    let result = board_api::move_card(&state.api, UserId(q.user_id), CardId(card_id), &req).await;
    published(&state, result)
}

async fn http_invite_member(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<InviteMemberRequest>,
) -> HttpResult<BoardEvent> {
    let result =
        board_api::invite_member(&state.api, UserId(q.user_id), BoardId(board_id), &req).await;
    published(&state, result)
}

async fn http_list_invitations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<InvitationsQuery>,
) -> HttpResult<Vec<Invitation>> {
    let invitations = board_api::list_invitations(&state.api, UserId(q.user_id), q.status)
        .await
        .map_err(http_error)?;
    Ok(Json(invitations))
}

async fn http_respond_invitation(
    State(state): State<Arc<AppState>>,
    Path(invitation_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<RespondInvitationRequest>,
) -> HttpResult<Vec<BoardEvent>> {
    let events = board_api::respond_to_invitation(
        &state.api,
        UserId(q.user_id),
        InvitationId(invitation_id),
        &req,
    )
    .await
    .map_err(http_error)?;
    for event in &events {
        state.publish(event);
    }
    Ok(Json(events))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let user_id = UserId(q.user_id);
    let board_id = BoardId(q.board_id);
    if let Err(err) = board_api::ensure_board_member(&state.api, board_id, user_id).await {
        return http_error(err).into_response();
    }
    ws.on_upgrade(move |socket| ws_connection(state, socket, user_id, board_id))
}

/// Forwards every event of one board to a websocket until either side
/// closes. A lagging subscriber is told to refetch instead of being fed a
/// stream with holes in it.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId, board_id: BoardId) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();
    debug!(%user_id, %board_id, "board feed opened");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) if event.board_id() == Some(board_id) => event,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%board_id, skipped, "board feed lagged");
                    BoardEvent::Error(ApiError::internal(format!(
                        "missed {skipped} events; refetch the board"
                    )))
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!(%user_id, %board_id, "board feed closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
