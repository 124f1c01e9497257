//! In-memory board snapshot maintenance. Everything here is synchronous and
//! side-effect free apart from the snapshot it is handed, so the same code
//! serves optimistic moves, server responses and feed events.

use shared::{
    domain::{Card, CardId, ListId},
    ordering::{self, Lane, MovePlan},
    protocol::{BoardEvent, BoardSnapshot, CardPlacement, ListPlacement, ListWithCards},
};

use crate::error::{ClientError, ClientResult};

/// Plans a card move against the cached snapshot using the same engine the
/// server runs, so the optimistic result matches the committed one whenever
/// the cache is current.
pub fn plan_card_move(
    snapshot: &BoardSnapshot,
    card_id: CardId,
    target_list_id: ListId,
    requested_position: i64,
) -> ClientResult<MovePlan<ListId, CardId>> {
    let source_list_id = snapshot
        .find_card(card_id)
        .map(|card| card.list_id)
        .ok_or(ClientError::UnknownCard(card_id))?;
    let source_items = card_ids(snapshot, source_list_id)?;
    let target_items = if source_list_id == target_list_id {
        None
    } else {
        Some(card_ids(snapshot, target_list_id)?)
    };

    ordering::plan_move(
        card_id,
        Lane::new(source_list_id, &source_items),
        target_items
            .as_deref()
            .map(|items| Lane::new(target_list_id, items)),
        requested_position,
    )
    .map_err(|_| ClientError::UnknownCard(card_id))
}

fn card_ids(snapshot: &BoardSnapshot, list_id: ListId) -> ClientResult<Vec<CardId>> {
    snapshot
        .find_list(list_id)
        .map(|list| list.cards.iter().map(|card| card.card_id).collect())
        .ok_or(ClientError::UnknownList(list_id))
}

/// Applies `(card, list, position)` writes. Cards whose id or destination
/// is not cached are skipped.
pub fn apply_card_placements(snapshot: &mut BoardSnapshot, placements: &[CardPlacement]) {
    for placement in placements {
        if snapshot.find_list(placement.container).is_none() {
            continue;
        }
        let Some(mut card) = take_card(snapshot, placement.item) else {
            continue;
        };
        card.list_id = placement.container;
        card.position = placement.position;
        if let Some(list) = list_mut(snapshot, placement.container) {
            list.cards.push(card);
        }
    }
    sort_cards(snapshot);
}

pub fn apply_list_placements(snapshot: &mut BoardSnapshot, placements: &[ListPlacement]) {
    for placement in placements {
        if placement.container != snapshot.board.board_id {
            continue;
        }
        if let Some(list) = list_mut(snapshot, placement.item) {
            list.list.position = placement.position;
        }
    }
    sort_lists(snapshot);
}

/// Folds a server event into the snapshot. Returns whether anything changed;
/// events for other boards are ignored.
pub fn apply_event(snapshot: &mut BoardSnapshot, event: &BoardEvent) -> bool {
    if event.board_id() != Some(snapshot.board.board_id) {
        return false;
    }

    match event {
        BoardEvent::BoardUpdated { board } => {
            snapshot.board = board.clone();
        }
        BoardEvent::ListCreated { list } => {
            if snapshot.find_list(list.list_id).is_some() {
                return false;
            }
            snapshot.lists.push(ListWithCards {
                list: list.clone(),
                cards: Vec::new(),
            });
            sort_lists(snapshot);
        }
        BoardEvent::ListRenamed { list } => match list_mut(snapshot, list.list_id) {
            Some(cached) => cached.list.title.clone_from(&list.title),
            None => return false,
        },
        BoardEvent::ListMoved { placements, .. } => apply_list_placements(snapshot, placements),
        BoardEvent::ListDeleted {
            list_id,
            placements,
            ..
        } => {
            snapshot.lists.retain(|list| list.list.list_id != *list_id);
            apply_list_placements(snapshot, placements);
        }
        BoardEvent::CardCreated { card, .. } | BoardEvent::CardUpdated { card, .. } => {
            return upsert_card(snapshot, card.clone());
        }
        BoardEvent::CardMoved {
            card, placements, ..
        } => {
            apply_card_placements(snapshot, placements);
            upsert_card(snapshot, card.clone());
        }
        BoardEvent::CardDeleted {
            card_id,
            placements,
            ..
        } => {
            take_card(snapshot, *card_id);
            apply_card_placements(snapshot, placements);
        }
        BoardEvent::MemberJoined { .. }
        | BoardEvent::InvitationCreated { .. }
        | BoardEvent::InvitationAnswered { .. }
        | BoardEvent::Error(_) => return false,
    }
    true
}

/// Replaces the cached copy of `card`, moving it if its list changed.
fn upsert_card(snapshot: &mut BoardSnapshot, card: Card) -> bool {
    take_card(snapshot, card.card_id);
    let Some(list) = list_mut(snapshot, card.list_id) else {
        return false;
    };
    list.cards.push(card);
    sort_cards(snapshot);
    true
}

fn take_card(snapshot: &mut BoardSnapshot, card_id: CardId) -> Option<Card> {
    snapshot.lists.iter_mut().find_map(|list| {
        let index = list.cards.iter().position(|card| card.card_id == card_id)?;
        Some(list.cards.remove(index))
    })
}

fn list_mut(snapshot: &mut BoardSnapshot, list_id: ListId) -> Option<&mut ListWithCards> {
    snapshot
        .lists
        .iter_mut()
        .find(|list| list.list.list_id == list_id)
}

fn sort_cards(snapshot: &mut BoardSnapshot) {
    for list in &mut snapshot.lists {
        list.cards.sort_by_key(|card| (card.position, card.card_id));
    }
}

fn sort_lists(snapshot: &mut BoardSnapshot) {
    snapshot
        .lists
        .sort_by_key(|list| (list.list.position, list.list.list_id));
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
