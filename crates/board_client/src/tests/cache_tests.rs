use super::*;
use chrono::{DateTime, Utc};
use shared::{
    domain::{BoardId, BoardSummary, Priority, TaskList, UserId},
    ordering::PositionWrite,
};

const BOARD: BoardId = BoardId(1);
const TODO: ListId = ListId(10);
const DONE: ListId = ListId(20);

fn card(id: i64, list: ListId, position: i64) -> Card {
    Card {
        card_id: CardId(id),
        list_id: list,
        position,
        title: format!("card {id}"),
        description: None,
        checklist: Vec::new(),
        priority: Priority::Medium,
        created_by: None,
        created_at: DateTime::<Utc>::default(),
        updated_at: DateTime::<Utc>::default(),
    }
}

fn list(list_id: ListId, position: i64, cards: Vec<Card>) -> ListWithCards {
    ListWithCards {
        list: TaskList {
            list_id,
            board_id: BOARD,
            title: format!("list {list_id}"),
            position,
            version: 0,
        },
        cards,
    }
}

/// To Do: 1, 2, 3. Done: 4.
fn snapshot() -> BoardSnapshot {
    BoardSnapshot {
        board: BoardSummary {
            board_id: BOARD,
            title: "board".into(),
            description: None,
            owner_id: UserId(1),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        },
        lists: vec![
            list(TODO, 0, vec![card(1, TODO, 0), card(2, TODO, 1), card(3, TODO, 2)]),
            list(DONE, 1, vec![card(4, DONE, 0)]),
        ],
    }
}

fn order(snapshot: &BoardSnapshot, list_id: ListId) -> Vec<(i64, i64)> {
    snapshot
        .find_list(list_id)
        .expect("list")
        .cards
        .iter()
        .map(|card| (card.card_id.0, card.position))
        .collect()
}

#[test]
fn optimistic_cross_list_move_matches_server_layout() {
    let mut snap = snapshot();
    let plan = plan_card_move(&snap, CardId(2), DONE, 0).expect("plan");
    apply_card_placements(&mut snap, &plan.writes);

    assert_eq!(order(&snap, TODO), vec![(1, 0), (3, 1)]);
    assert_eq!(order(&snap, DONE), vec![(2, 0), (4, 1)]);
    assert_eq!(snap.find_card(CardId(2)).map(|c| c.list_id), Some(DONE));
}

#[test]
fn optimistic_same_list_move_backward() {
    let mut snap = snapshot();
    let plan = plan_card_move(&snap, CardId(3), TODO, 0).expect("plan");
    apply_card_placements(&mut snap, &plan.writes);

    assert_eq!(order(&snap, TODO), vec![(3, 0), (1, 1), (2, 2)]);
}

#[test]
fn planning_against_unknown_ids_fails() {
    let snap = snapshot();
    assert!(matches!(
        plan_card_move(&snap, CardId(99), TODO, 0),
        Err(ClientError::UnknownCard(CardId(99)))
    ));
    assert!(matches!(
        plan_card_move(&snap, CardId(1), ListId(99), 0),
        Err(ClientError::UnknownList(ListId(99)))
    ));
}

#[test]
fn card_deleted_event_closes_the_gap() {
    let mut snap = snapshot();
    let changed = apply_event(
        &mut snap,
        &BoardEvent::CardDeleted {
            board_id: BOARD,
            card_id: CardId(1),
            placements: vec![
                PositionWrite {
                    item: CardId(2),
                    container: TODO,
                    position: 0,
                },
                PositionWrite {
                    item: CardId(3),
                    container: TODO,
                    position: 1,
                },
            ],
        },
    );

    assert!(changed);
    assert_eq!(order(&snap, TODO), vec![(2, 0), (3, 1)]);
}

#[test]
fn events_for_other_boards_are_ignored() {
    let mut snap = snapshot();
    let before = snap.clone();
    let changed = apply_event(
        &mut snap,
        &BoardEvent::CardDeleted {
            board_id: BoardId(2),
            card_id: CardId(1),
            placements: Vec::new(),
        },
    );
    assert!(!changed);
    assert_eq!(snap, before);
}

#[test]
fn list_moved_event_reorders_lists() {
    let mut snap = snapshot();
    apply_event(
        &mut snap,
        &BoardEvent::ListMoved {
            board_id: BOARD,
            placements: vec![
                PositionWrite {
                    item: DONE,
                    container: BOARD,
                    position: 0,
                },
                PositionWrite {
                    item: TODO,
                    container: BOARD,
                    position: 1,
                },
            ],
        },
    );

    let lists: Vec<ListId> = snap.lists.iter().map(|l| l.list.list_id).collect();
    assert_eq!(lists, vec![DONE, TODO]);
}

#[test]
fn card_updated_event_patches_content_in_place() {
    let mut snap = snapshot();
    let mut edited = card(2, TODO, 1);
    edited.title = "renamed".into();
    edited.priority = Priority::High;

    assert!(apply_event(
        &mut snap,
        &BoardEvent::CardUpdated {
            board_id: BOARD,
            card: edited,
        },
    ));

    let cached = snap.find_card(CardId(2)).expect("card");
    assert_eq!(cached.title, "renamed");
    assert_eq!(cached.priority, Priority::High);
    assert_eq!(order(&snap, TODO), vec![(1, 0), (2, 1), (3, 2)]);
}

#[test]
fn list_deleted_event_drops_list_and_cards() {
    let mut snap = snapshot();
    apply_event(
        &mut snap,
        &BoardEvent::ListDeleted {
            board_id: BOARD,
            list_id: TODO,
            placements: vec![PositionWrite {
                item: DONE,
                container: BOARD,
                position: 0,
            }],
        },
    );

    assert_eq!(snap.lists.len(), 1);
    assert_eq!(snap.lists[0].list.position, 0);
    assert!(snap.find_card(CardId(1)).is_none());
}
