use std::time::Duration;

use shared::domain::{CardId, ListId, Priority};
use storage::{NewCard, Storage, StorageOptions};

const WORKERS: usize = 8;
const MOVES_PER_WORKER: usize = 15;

async fn file_backed_storage(dir: &tempfile::TempDir) -> Storage {
    let path = dir.path().join("board.db");
    let url = format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"));
    Storage::connect(
        &url,
        &StorageOptions {
            max_connections: WORKERS as u32,
            busy_timeout: Duration::from_secs(30),
        },
    )
    .await
    .expect("db")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_moves_keep_every_list_dense() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = file_backed_storage(&dir).await;

    let owner = storage.create_user("racer", None).await.expect("user");
    let board = storage
        .create_board("Contended", None, owner)
        .await
        .expect("board");

    let mut lists: Vec<ListId> = Vec::new();
    let mut cards: Vec<CardId> = Vec::new();
    for title in ["To Do", "Doing", "Done"] {
        let list = storage.create_list(board, title).await.expect("list");
        for n in 0..4 {
            let card = storage
                .create_card(
                    list.list_id,
                    NewCard {
                        title: format!("{title} #{n}"),
                        description: None,
                        checklist: Vec::new(),
                        priority: Priority::Medium,
                        created_by: Some(owner),
                    },
                )
                .await
                .expect("card");
            cards.push(card.card_id);
        }
        lists.push(list.list_id);
    }

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let storage = storage.clone();
        let lists = lists.clone();
        let cards = cards.clone();
        handles.push(tokio::spawn(async move {
            for step in 0..MOVES_PER_WORKER {
                let card = cards[(worker * 7 + step * 5) % cards.len()];
                let list = lists[(worker + step) % lists.len()];
                let position = match step % 4 {
                    0 => 0,
                    1 => 9999,
                    2 => -3,
                    _ => (worker % 5) as i64,
                };
                storage
                    .move_card(card, list, position)
                    .await
                    .expect("concurrent move");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("worker");
    }

    assert!(storage
        .verify_ordering()
        .await
        .expect("verify")
        .is_empty());

    let mut seen: Vec<CardId> = Vec::new();
    for list in &lists {
        let in_list = storage.list_cards(*list).await.expect("cards");
        for (index, card) in in_list.iter().enumerate() {
            assert_eq!(card.position, index as i64);
        }
        seen.extend(in_list.into_iter().map(|card| card.card_id));
    }
    seen.sort();
    let mut expected = cards.clone();
    expected.sort();
    assert_eq!(seen, expected, "every card must sit in exactly one list");
}

#[tokio::test]
async fn board_snapshot_reflects_committed_moves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = file_backed_storage(&dir).await;

    let board = storage
        .seed_sample_data()
        .await
        .expect("seed")
        .expect("fresh database");
    let snapshot = storage
        .board_snapshot(board)
        .await
        .expect("snapshot")
        .expect("board");
    let todo = snapshot.lists[0].list.list_id;
    let done = snapshot.lists[2].list.list_id;
    let card = snapshot.lists[0].cards[0].card_id;

    let moved = storage.move_card(card, done, 0).await.expect("move");
    assert_eq!(moved.placements.len(), 2);

    let snapshot = storage
        .board_snapshot(board)
        .await
        .expect("snapshot")
        .expect("board");
    assert!(snapshot.find_list(todo).expect("todo").cards.is_empty());
    let done_cards: Vec<CardId> = snapshot
        .find_list(done)
        .expect("done")
        .cards
        .iter()
        .map(|card| card.card_id)
        .collect();
    assert_eq!(done_cards.len(), 2);
    assert_eq!(done_cards[0], card);
    assert_eq!(snapshot.find_card(card).map(|c| c.list_id), Some(done));
}
