use shared::{
    domain::{
        BoardId, BoardRole, BoardSummary, CardId, Invitation, InvitationId, InvitationStatus,
        ListId, MemberSummary, UserId, UserSummary,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        BoardEvent, BoardSnapshot, CreateBoardRequest, CreateCardRequest, CreateListRequest,
        CreateUserRequest, InviteMemberRequest, MoveCardRequest, MoveListRequest,
        RenameListRequest, RespondInvitationRequest, UpdateBoardRequest, UpdateCardRequest,
    },
};
use storage::{NewCard, Storage, StoreError};
use tracing::{debug, error, info, warn};

const MAX_TITLE_CHARS: usize = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn create_user(
    ctx: &ApiContext,
    req: &CreateUserRequest,
) -> Result<UserSummary, ApiError> {
    let username = required_text("username", &req.username)?;
    let user_id = ctx
        .storage
        .create_user(username, req.full_name.as_deref())
        .await
        .map_err(internal)?;
    ctx.storage
        .user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::internal(format!("user {user_id} vanished after insert")))
}

pub async fn list_boards(ctx: &ApiContext, user_id: UserId) -> Result<Vec<BoardSummary>, ApiError> {
    ctx.storage
        .list_boards_for_user(user_id)
        .await
        .map_err(internal)
}

pub async fn create_board(
    ctx: &ApiContext,
    user_id: UserId,
    req: &CreateBoardRequest,
) -> Result<BoardSummary, ApiError> {
    let title = required_text("board title", &req.title)?;
    ctx.storage
        .user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("user {user_id} not found")))?;

    let board_id = ctx
        .storage
        .create_board(title, req.description.as_deref(), user_id)
        .await
        .map_err(internal)?;
    info!(board_id = %board_id, owner = %user_id, "board created");
    ctx.storage
        .board(board_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::internal(format!("board {board_id} vanished after insert")))
}

pub async fn get_board(
    ctx: &ApiContext,
    user_id: UserId,
    board_id: BoardId,
) -> Result<BoardSnapshot, ApiError> {
    ensure_board_member(ctx, board_id, user_id).await?;
    ctx.storage
        .board_snapshot(board_id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| ApiError::not_found(format!("board {board_id} not found")))
}

pub async fn update_board(
    ctx: &ApiContext,
    user_id: UserId,
    board_id: BoardId,
    req: &UpdateBoardRequest,
) -> Result<BoardEvent, ApiError> {
    ensure_owner(ctx, board_id, user_id).await?;
    let title = req
        .title
        .as_deref()
        .map(|title| required_text("board title", title))
        .transpose()?;
    let board = ctx
        .storage
        .update_board(
            board_id,
            title,
            description_change(req.description.as_deref()),
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("board {board_id} not found")))?;
    Ok(BoardEvent::BoardUpdated { board })
}

pub async fn list_members(
    ctx: &ApiContext,
    user_id: UserId,
    board_id: BoardId,
) -> Result<Vec<MemberSummary>, ApiError> {
    ensure_board_member(ctx, board_id, user_id).await?;
    ctx.storage.list_members(board_id).await.map_err(internal)
}

pub async fn create_list(
    ctx: &ApiContext,
    user_id: UserId,
    board_id: BoardId,
    req: &CreateListRequest,
) -> Result<BoardEvent, ApiError> {
    let title = required_text("list title", &req.title)?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let list = ctx
        .storage
        .create_list(board_id, title)
        .await
        .map_err(map_store_error)?;
    Ok(BoardEvent::ListCreated { list })
}

pub async fn rename_list(
    ctx: &ApiContext,
    user_id: UserId,
    list_id: ListId,
    req: &RenameListRequest,
) -> Result<BoardEvent, ApiError> {
    let title = required_text("list title", &req.title)?;
    let board_id = board_of_list(ctx, list_id).await?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let list = ctx
        .storage
        .rename_list(list_id, title)
        .await
        .map_err(map_store_error)?;
    Ok(BoardEvent::ListRenamed { list })
}

pub async fn move_list(
    ctx: &ApiContext,
    user_id: UserId,
    list_id: ListId,
    req: &MoveListRequest,
) -> Result<BoardEvent, ApiError> {
    let board_id = board_of_list(ctx, list_id).await?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let moved = ctx
        .storage
        .move_list(list_id, req.new_position)
        .await
        .map_err(map_store_error)?;
    debug!(
        list_id = %list_id,
        position = moved.list.position,
        writes = moved.placements.len(),
        "list moved"
    );
    Ok(BoardEvent::ListMoved {
        board_id,
        placements: moved.placements,
    })
}

pub async fn delete_list(
    ctx: &ApiContext,
    user_id: UserId,
    list_id: ListId,
) -> Result<BoardEvent, ApiError> {
    let board_id = board_of_list(ctx, list_id).await?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let removal = ctx
        .storage
        .delete_list(list_id)
        .await
        .map_err(map_store_error)?;
    info!(
        list_id = %list_id,
        board_id = %board_id,
        removed_cards = removal.removed_cards,
        "list deleted"
    );
    Ok(BoardEvent::ListDeleted {
        board_id,
        list_id,
        placements: removal.placements,
    })
}

pub async fn create_card(
    ctx: &ApiContext,
    user_id: UserId,
    list_id: ListId,
    req: &CreateCardRequest,
) -> Result<BoardEvent, ApiError> {
    let title = required_text("card title", &req.title)?;
    let board_id = board_of_list(ctx, list_id).await?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let card = ctx
        .storage
        .create_card(
            list_id,
            NewCard {
                title: title.to_string(),
                description: req.description.clone(),
                checklist: req.checklist.clone(),
                priority: req.priority,
                created_by: Some(user_id),
            },
        )
        .await
        .map_err(map_store_error)?;
    Ok(BoardEvent::CardCreated { board_id, card })
}

pub async fn update_card(
    ctx: &ApiContext,
    user_id: UserId,
    card_id: CardId,
    req: &UpdateCardRequest,
) -> Result<BoardEvent, ApiError> {
    let title = req
        .title
        .as_deref()
        .map(|title| required_text("card title", title))
        .transpose()?;
    let board_id = board_of_card(ctx, card_id).await?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let card = ctx
        .storage
        .update_card(
            card_id,
            title,
            description_change(req.description.as_deref()),
            req.checklist.as_deref(),
            req.priority,
        )
        .await
        .map_err(map_store_error)?;
    Ok(BoardEvent::CardUpdated { board_id, card })
}

pub async fn delete_card(
    ctx: &ApiContext,
    user_id: UserId,
    card_id: CardId,
) -> Result<BoardEvent, ApiError> {
    let board_id = board_of_card(ctx, card_id).await?;
    ensure_board_member(ctx, board_id, user_id).await?;
    let removal = ctx
        .storage
        .delete_card(card_id)
        .await
        .map_err(map_store_error)?;
    Ok(BoardEvent::CardDeleted {
        board_id,
        card_id,
        placements: removal.placements,
    })
}

/// Moves a card within its board. Out-of-range positions are clamped by
/// the storage engine; moving onto the card's current slot succeeds with
/// no placements.
pub async fn move_card(
    ctx: &ApiContext,
    user_id: UserId,
    card_id: CardId,
    req: &MoveCardRequest,
) -> Result<BoardEvent, ApiError> {
    let board_id = board_of_card(ctx, card_id).await?;
    let target_board = board_of_list(ctx, req.new_list_id).await?;
    if target_board != board_id {
        return Err(ApiError::validation(format!(
            "list {} belongs to another board",
            req.new_list_id
        )));
    }
    ensure_board_member(ctx, board_id, user_id).await?;

    let moved = ctx
        .storage
        .move_card(card_id, req.new_list_id, req.new_position)
        .await
        .map_err(map_store_error)?;
    if req.new_position != moved.card.position {
        debug!(
            card_id = %card_id,
            requested = req.new_position,
            position = moved.card.position,
            "move position clamped"
        );
    }
    info!(
        card_id = %card_id,
        list_id = %moved.card.list_id,
        position = moved.card.position,
        writes = moved.placements.len(),
        "card moved"
    );
    Ok(BoardEvent::CardMoved {
        board_id,
        card: moved.card,
        placements: moved.placements,
    })
}

pub async fn invite_member(
    ctx: &ApiContext,
    user_id: UserId,
    board_id: BoardId,
    req: &InviteMemberRequest,
) -> Result<BoardEvent, ApiError> {
    ensure_owner(ctx, board_id, user_id).await?;
    if req.invitee_id == user_id {
        return Err(ApiError::validation("cannot invite yourself"));
    }
    ctx.storage
        .user(req.invitee_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("user {} not found", req.invitee_id)))?;
    if ctx
        .storage
        .membership_role(board_id, req.invitee_id)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::validation(format!(
            "user {} is already a member",
            req.invitee_id
        )));
    }

    let invitation = ctx
        .storage
        .create_invitation(board_id, user_id, req.invitee_id, req.message.as_deref())
        .await
        .map_err(internal)?;
    Ok(BoardEvent::InvitationCreated { invitation })
}

pub async fn list_invitations(
    ctx: &ApiContext,
    user_id: UserId,
    status: Option<InvitationStatus>,
) -> Result<Vec<Invitation>, ApiError> {
    ctx.storage
        .list_invitations_for_user(user_id, status)
        .await
        .map_err(internal)
}

/// Answers an invitation addressed to `user_id`. Accepting yields a
/// `MemberJoined` event after the `InvitationAnswered` one.
pub async fn respond_to_invitation(
    ctx: &ApiContext,
    user_id: UserId,
    invitation_id: InvitationId,
    req: &RespondInvitationRequest,
) -> Result<Vec<BoardEvent>, ApiError> {
    let invitation = ctx
        .storage
        .invitation(invitation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("invitation {invitation_id} not found")))?;
    if invitation.invitee_id != user_id {
        return Err(ApiError::forbidden("invitation is addressed to another user"));
    }
    if invitation.status != InvitationStatus::Pending {
        return Err(ApiError::validation(format!(
            "invitation was already {}",
            invitation.status.as_str()
        )));
    }

    let answered = ctx
        .storage
        .respond_to_invitation(invitation_id, req.accept)
        .await
        .map_err(map_store_error)?;
    let accepted = answered.status == InvitationStatus::Accepted;
    let mut events = vec![BoardEvent::InvitationAnswered {
        board_id: answered.board_id,
        invitation_id,
        accepted,
    }];
    if accepted {
        let member = ctx
            .storage
            .list_members(answered.board_id)
            .await
            .map_err(internal)?
            .into_iter()
            .find(|member| member.user_id == user_id);
        match member {
            Some(member) => events.push(BoardEvent::MemberJoined { member }),
            None => warn!(
                invitation_id = %invitation_id,
                user_id = %user_id,
                "accepted invitation left no membership row"
            ),
        }
    }
    Ok(events)
}

pub async fn ensure_board_member(
    ctx: &ApiContext,
    board_id: BoardId,
    user_id: UserId,
) -> Result<BoardRole, ApiError> {
    let role = ctx
        .storage
        .membership_role(board_id, user_id)
        .await
        .map_err(internal)?;
    if let Some(role) = role {
        return Ok(role);
    }
    let board = ctx.storage.board(board_id).await.map_err(internal)?;
    match board {
        None => Err(ApiError::not_found(format!("board {board_id} not found"))),
        Some(_) => Err(ApiError::forbidden("user is not a board member")),
    }
}

async fn ensure_owner(ctx: &ApiContext, board_id: BoardId, user_id: UserId) -> Result<(), ApiError> {
    match ensure_board_member(ctx, board_id, user_id).await? {
        BoardRole::Owner => Ok(()),
        BoardRole::Member => Err(ApiError::forbidden("only the board owner may do this")),
    }
}

async fn board_of_list(ctx: &ApiContext, list_id: ListId) -> Result<BoardId, ApiError> {
    ctx.storage
        .board_for_list(list_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("list {list_id} not found")))
}

async fn board_of_card(ctx: &ApiContext, card_id: CardId) -> Result<BoardId, ApiError> {
    ctx.storage
        .board_for_card(card_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("card {card_id} not found")))
}

fn required_text<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation(format!("{field} must not be blank")));
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::validation(format!(
            "{field} must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// A blank description in an edit clears the stored one.
fn description_change(description: Option<&str>) -> Option<Option<&str>> {
    description.map(|text| {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

fn map_store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound { entity, id } => {
            ApiError::new(ErrorCode::NotFound, format!("{entity} {id} not found"))
        }
        other => {
            error!(error = %other, "storage operation failed");
            ApiError::new(ErrorCode::Internal, other.to_string())
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "storage operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
