use super::*;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use board_api::ApiContext;
use serde::Deserialize;
use shared::{domain::Priority, error::ErrorCode};
use storage::{NewCard, Storage};
use tokio::{net::TcpListener, sync::oneshot};

type Gate = (oneshot::Sender<()>, oneshot::Receiver<()>);

#[derive(Clone)]
struct StubState {
    api: ApiContext,
    fail_moves: Arc<AtomicBool>,
    board_fetches: Arc<AtomicUsize>,
    move_gate: Arc<Mutex<Option<Gate>>>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn stub_get_board(
    State(state): State<StubState>,
    Path(board_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<BoardSnapshot>, (StatusCode, Json<ApiError>)> {
    state.board_fetches.fetch_add(1, Ordering::SeqCst);
    board_api::get_board(&state.api, UserId(q.user_id), BoardId(board_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn stub_move_card(
    State(state): State<StubState>,
    Path(card_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<MoveCardRequest>,
) -> Result<Json<BoardEvent>, (StatusCode, Json<ApiError>)> {
    let gate = state.move_gate.lock().await.take();
    if let Some((arrived, release)) = gate {
        let _ = arrived.send(());
        let _ = release.await;
    }
    if state.fail_moves.load(Ordering::SeqCst) {
        return Err(reject(ApiError::internal("database is locked")));
    }
    board_api::move_card(&state.api, UserId(q.user_id), CardId(card_id), &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn stub_create_card(
    State(state): State<StubState>,
    Path(list_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<CreateCardRequest>,
) -> Result<Json<BoardEvent>, (StatusCode, Json<ApiError>)> {
    board_api::create_card(&state.api, UserId(q.user_id), ListId(list_id), &req)
        .await
        .map(Json)
        .map_err(reject)
}

struct Fixture {
    server_url: String,
    state: StubState,
    user: UserId,
    board: BoardId,
    todo: ListId,
    done: ListId,
    /// Cards in To Do, in order.
    cards: Vec<CardId>,
}

async fn spawn_board_server() -> Result<Fixture> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let storage = Storage::new("sqlite::memory:").await?;
    let user = storage.create_user("alice", None).await?;
    let board = storage.create_board("Client board", None, user).await?;
    let todo = storage.create_list(board, "To Do").await?.list_id;
    let done = storage.create_list(board, "Done").await?.list_id;
    let mut cards = Vec::new();
    for title in ["one", "two", "three"] {
        let card = storage
            .create_card(
                todo,
                NewCard {
                    title: title.to_string(),
                    description: None,
                    checklist: Vec::new(),
                    priority: Priority::Medium,
                    created_by: Some(user),
                },
            )
            .await?;
        cards.push(card.card_id);
    }

    let state = StubState {
        api: ApiContext { storage },
        fail_moves: Arc::new(AtomicBool::new(false)),
        board_fetches: Arc::new(AtomicUsize::new(0)),
        move_gate: Arc::new(Mutex::new(None)),
    };
    let app = Router::new()
        .route("/boards/:board_id", get(stub_get_board))
        .route("/cards/:card_id/move", put(stub_move_card))
        .route("/lists/:list_id/cards", post(stub_create_card))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(Fixture {
        server_url: format!("http://{addr}"),
        state,
        user,
        board,
        todo,
        done,
        cards,
    })
}

fn card_order(snapshot: &BoardSnapshot, list_id: ListId) -> Vec<CardId> {
    snapshot
        .find_list(list_id)
        .expect("list")
        .cards
        .iter()
        .map(|card| card.card_id)
        .collect()
}

async fn server_snapshot(fx: &Fixture) -> BoardSnapshot {
    board_api::get_board(&fx.state.api, fx.user, fx.board)
        .await
        .expect("server snapshot")
}

#[tokio::test]
async fn open_board_caches_the_snapshot() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");

    let opened = client.open_board(fx.board).await.expect("open");
    assert_eq!(card_order(&opened, fx.todo), fx.cards);
    assert_eq!(client.snapshot().await, Some(opened));
}

#[tokio::test]
async fn move_without_open_board_is_rejected_locally() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");

    let err = client
        .move_card(fx.cards[0], fx.done, 0)
        .await
        .expect_err("no board open");
    assert!(matches!(err, ClientError::NoBoardOpen));
    assert_eq!(fx.state.board_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn optimistic_move_is_visible_before_the_server_answers() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = Arc::new(BoardClient::new(&fx.server_url, fx.user).expect("client"));
    client.open_board(fx.board).await.expect("open");

    let (arrived_tx, arrived_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    *fx.state.move_gate.lock().await = Some((arrived_tx, release_rx));

    let moving = {
        let client = client.clone();
        let card = fx.cards[1];
        let done = fx.done;
        tokio::spawn(async move { client.move_card(card, done, 0).await })
    };

    arrived_rx.await.expect("request reached server");
    let speculative = client.snapshot().await.expect("cached");
    assert_eq!(card_order(&speculative, fx.todo), vec![fx.cards[0], fx.cards[2]]);
    assert_eq!(card_order(&speculative, fx.done), vec![fx.cards[1]]);

    release_tx.send(()).expect("release");
    let card = moving.await.expect("join").expect("move");
    assert_eq!(card.list_id, fx.done);
    assert_eq!(card.position, 0);

    let cached = client.snapshot().await.expect("cached");
    let server = server_snapshot(&fx).await;
    assert_eq!(card_order(&cached, fx.todo), card_order(&server, fx.todo));
    assert_eq!(card_order(&cached, fx.done), card_order(&server, fx.done));
}

#[tokio::test]
async fn failed_move_discards_optimistic_state_and_refetches() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");
    client.open_board(fx.board).await.expect("open");
    fx.state.fail_moves.store(true, Ordering::SeqCst);
    let fetches_before = fx.state.board_fetches.load(Ordering::SeqCst);

    let err = client
        .move_card(fx.cards[0], fx.done, 0)
        .await
        .expect_err("server refuses");

    assert!(matches!(err, ClientError::Api { status: 500, .. }));
    assert_eq!(
        fx.state.board_fetches.load(Ordering::SeqCst),
        fetches_before + 1
    );
    let cached = client.snapshot().await.expect("cached");
    assert_eq!(cached, server_snapshot(&fx).await);
    assert_eq!(card_order(&cached, fx.todo), fx.cards);
}

#[tokio::test]
async fn stale_cache_move_surfaces_not_found_and_resyncs() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");
    client.open_board(fx.board).await.expect("open");

    // someone else deletes the card behind the client's back
    fx.state
        .api
        .storage
        .delete_card(fx.cards[0])
        .await
        .expect("delete");

    let err = client
        .move_card(fx.cards[0], fx.done, 0)
        .await
        .expect_err("card is gone");
    assert_eq!(
        err.api_error().map(|e| e.code),
        Some(ErrorCode::NotFound)
    );

    let cached = client.snapshot().await.expect("cached");
    assert!(cached.find_card(fx.cards[0]).is_none());
    assert_eq!(card_order(&cached, fx.todo), vec![fx.cards[1], fx.cards[2]]);
}

#[tokio::test]
async fn move_of_card_missing_from_cache_refetches_and_reaches_server() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");
    client.open_board(fx.board).await.expect("open");

    // another member adds a card the client has not seen yet
    let fresh = fx
        .state
        .api
        .storage
        .create_card(
            fx.todo,
            NewCard {
                title: "from elsewhere".to_string(),
                description: None,
                checklist: Vec::new(),
                priority: Priority::Low,
                created_by: Some(fx.user),
            },
        )
        .await
        .expect("create")
        .card_id;
    let fetches_before = fx.state.board_fetches.load(Ordering::SeqCst);

    let card = client
        .move_card(fresh, fx.done, 0)
        .await
        .expect("server accepts the move");

    assert_eq!((card.list_id, card.position), (fx.done, 0));
    assert_eq!(
        fx.state.board_fetches.load(Ordering::SeqCst),
        fetches_before + 1
    );
    let cached = client.snapshot().await.expect("cached");
    assert_eq!(card_order(&cached, fx.done), vec![fresh]);
    assert_eq!(card_order(&cached, fx.todo), fx.cards);
    let server = server_snapshot(&fx).await;
    assert_eq!(card_order(&server, fx.done), vec![fresh]);
}

#[tokio::test]
async fn move_of_card_unknown_everywhere_is_left_to_the_server() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");
    client.open_board(fx.board).await.expect("open");

    let err = client
        .move_card(CardId(4040), fx.done, 0)
        .await
        .expect_err("no such card");

    assert_eq!(err.api_error().map(|e| e.code), Some(ErrorCode::NotFound));
    let cached = client.snapshot().await.expect("cached");
    assert_eq!(card_order(&cached, fx.todo), fx.cards);
}

#[tokio::test]
async fn created_cards_land_in_the_cache() {
    let fx = spawn_board_server().await.expect("spawn server");
    let client = BoardClient::new(&fx.server_url, fx.user).expect("client");
    client.open_board(fx.board).await.expect("open");

    let card = client
        .create_card(
            fx.done,
            &CreateCardRequest {
                title: "ship it".into(),
                description: Some("release notes".into()),
                checklist: vec!["tag".into(), "announce".into()],
                priority: Priority::High,
            },
        )
        .await
        .expect("create");

    let cached = client.snapshot().await.expect("cached");
    assert_eq!(cached.find_card(card.card_id), Some(&card));
    assert_eq!(card.position, 0);
    assert_eq!(card.checklist.len(), 2);
}
