use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        BoardId, BoardSummary, Card, CardId, Invitation, InvitationId, ListId, MemberSummary,
        Priority, TaskList, UserId,
    },
    error::ApiError,
    ordering::PositionWrite,
};

/// A `(card, list, position)` write produced by the ordering engine.
pub type CardPlacement = PositionWrite<ListId, CardId>;
/// A `(list, board, position)` write produced by the ordering engine.
pub type ListPlacement = PositionWrite<BoardId, ListId>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBoardRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateBoardRequest {
    #[serde(default)]
    pub title: Option<String>,
    /// A blank string clears the description.
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateListRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameListRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveListRequest {
    pub new_position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCardRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub checklist: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

/// Partial card edit. `list_id`/`position` are deliberately absent: only
/// the move endpoint may change them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCardRequest {
    #[serde(default)]
    pub title: Option<String>,
    /// A blank string clears the description.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub checklist: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MoveCardRequest {
    pub new_list_id: ListId,
    pub new_position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteMemberRequest {
    pub invitee_id: UserId,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RespondInvitationRequest {
    pub accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListWithCards {
    #[serde(flatten)]
    pub list: TaskList,
    pub cards: Vec<Card>,
}

/// Full board state: lists in position order, each with its cards in
/// position order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    #[serde(flatten)]
    pub board: BoardSummary,
    pub lists: Vec<ListWithCards>,
}

impl BoardSnapshot {
    pub fn find_card(&self, card_id: CardId) -> Option<&Card> {
        self.lists
            .iter()
            .flat_map(|list| list.cards.iter())
            .find(|card| card.card_id == card_id)
    }

    pub fn find_list(&self, list_id: ListId) -> Option<&ListWithCards> {
        self.lists.iter().find(|list| list.list.list_id == list_id)
    }
}

/// Change notifications pushed to every websocket subscriber of a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BoardEvent {
    BoardUpdated {
        board: BoardSummary,
    },
    ListCreated {
        list: TaskList,
    },
    ListRenamed {
        list: TaskList,
    },
    ListMoved {
        board_id: BoardId,
        placements: Vec<ListPlacement>,
    },
    ListDeleted {
        board_id: BoardId,
        list_id: ListId,
        placements: Vec<ListPlacement>,
    },
    CardCreated {
        board_id: BoardId,
        card: Card,
    },
    CardUpdated {
        board_id: BoardId,
        card: Card,
    },
    CardMoved {
        board_id: BoardId,
        card: Card,
        placements: Vec<CardPlacement>,
    },
    CardDeleted {
        board_id: BoardId,
        card_id: CardId,
        placements: Vec<CardPlacement>,
    },
    MemberJoined {
        member: MemberSummary,
    },
    InvitationCreated {
        invitation: Invitation,
    },
    InvitationAnswered {
        board_id: BoardId,
        invitation_id: InvitationId,
        accepted: bool,
    },
    Error(ApiError),
}

impl BoardEvent {
    /// Board whose subscribers should see this event.
    pub fn board_id(&self) -> Option<BoardId> {
        match self {
            BoardEvent::BoardUpdated { board } => Some(board.board_id),
            BoardEvent::ListCreated { list } | BoardEvent::ListRenamed { list } => {
                Some(list.board_id)
            }
            BoardEvent::ListMoved { board_id, .. }
            | BoardEvent::ListDeleted { board_id, .. }
            | BoardEvent::CardCreated { board_id, .. }
            | BoardEvent::CardUpdated { board_id, .. }
            | BoardEvent::CardMoved { board_id, .. }
            | BoardEvent::CardDeleted { board_id, .. }
            | BoardEvent::InvitationAnswered { board_id, .. } => Some(*board_id),
            BoardEvent::MemberJoined { member } => Some(member.board_id),
            BoardEvent::InvitationCreated { invitation } => Some(invitation.board_id),
            BoardEvent::Error(_) => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
