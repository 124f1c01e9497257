use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::{
        BoardId, BoardSummary, Card, CardId, Invitation, InvitationId, InvitationStatus, ListId,
        MemberSummary, UserId, UserSummary,
    },
    error::ApiError,
    protocol::{
        BoardEvent, BoardSnapshot, CreateBoardRequest, CreateCardRequest, CreateListRequest,
        CreateUserRequest, InviteMemberRequest, MoveCardRequest, MoveListRequest,
        RenameListRequest, RespondInvitationRequest, UpdateCardRequest,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

pub mod cache;
mod error;

pub use error::{ClientError, ClientResult};

/// HTTP client for one user, holding a cached snapshot of the board it has
/// open. Card moves are applied to the cache before the server confirms
/// them; a failed move throws the speculative state away and refetches.
pub struct BoardClient {
    http: Client,
    base_url: Url,
    user_id: UserId,
    open_board: Mutex<Option<BoardSnapshot>>,
}

impl BoardClient {
    pub fn new(server_url: &str, user_id: UserId) -> ClientResult<Self> {
        Ok(Self {
            http: Client::new(),
            base_url: normalize_base_url(server_url)?,
            user_id,
            open_board: Mutex::new(None),
        })
    }

    /// Creates (or looks up) `username` on the server and returns a client
    /// acting as that user.
    pub async fn register(
        server_url: &str,
        username: &str,
        full_name: Option<&str>,
    ) -> ClientResult<(Self, UserSummary)> {
        let base_url = normalize_base_url(server_url)?;
        let http = Client::new();
        let request = http.post(base_url.join("users")?).json(&CreateUserRequest {
            username: username.to_string(),
            full_name: full_name.map(str::to_string),
        });
        let user: UserSummary = decode(request.send().await?).await?;
        info!(user_id = %user.user_id, %username, "registered user");
        let client = Self {
            http,
            base_url,
            user_id: user.user_id,
            open_board: Mutex::new(None),
        };
        Ok((client, user))
    }

    /// Copy of the cached board, if one is open.
    pub async fn snapshot(&self) -> Option<BoardSnapshot> {
        self.open_board.lock().await.clone()
    }

    pub async fn list_boards(&self) -> ClientResult<Vec<BoardSummary>> {
        self.send(self.http.get(self.url("boards")?)).await
    }

    pub async fn create_board(
        &self,
        title: &str,
        description: Option<&str>,
    ) -> ClientResult<BoardSummary> {
        let request = self.http.post(self.url("boards")?).json(&CreateBoardRequest {
            title: title.to_string(),
            description: description.map(str::to_string),
        });
        self.send(request).await
    }

    /// Fetches `board_id` and makes it the cached board.
    pub async fn open_board(&self, board_id: BoardId) -> ClientResult<BoardSnapshot> {
        let snapshot = self.fetch_board(board_id).await?;
        *self.open_board.lock().await = Some(snapshot.clone());
        debug!(%board_id, lists = snapshot.lists.len(), "board opened");
        Ok(snapshot)
    }

    /// Replaces the cache with the server's current copy of the open board.
    pub async fn refresh(&self) -> ClientResult<BoardSnapshot> {
        let board_id = self.open_board_id().await?;
        self.open_board(board_id).await
    }

    pub async fn list_members(&self) -> ClientResult<Vec<MemberSummary>> {
        let board_id = self.open_board_id().await?;
        self.send(
            self.http
                .get(self.url(&format!("boards/{board_id}/members"))?),
        )
        .await
    }

    pub async fn create_list(&self, title: &str) -> ClientResult<BoardEvent> {
        let board_id = self.open_board_id().await?;
        let request = self
            .http
            .post(self.url(&format!("boards/{board_id}/lists"))?)
            .json(&CreateListRequest {
                title: title.to_string(),
            });
        self.mutate(request).await
    }

    pub async fn rename_list(&self, list_id: ListId, title: &str) -> ClientResult<BoardEvent> {
        let request = self
            .http
            .patch(self.url(&format!("lists/{list_id}"))?)
            .json(&RenameListRequest {
                title: title.to_string(),
            });
        self.mutate(request).await
    }

    pub async fn move_list(&self, list_id: ListId, new_position: i64) -> ClientResult<BoardEvent> {
        let request = self
            .http
            .put(self.url(&format!("lists/{list_id}/move"))?)
            .json(&MoveListRequest { new_position });
        self.mutate(request).await
    }

    pub async fn delete_list(&self, list_id: ListId) -> ClientResult<BoardEvent> {
        let request = self.http.delete(self.url(&format!("lists/{list_id}"))?);
        self.mutate(request).await
    }

    pub async fn create_card(
        &self,
        list_id: ListId,
        card: &CreateCardRequest,
    ) -> ClientResult<Card> {
        let request = self
            .http
            .post(self.url(&format!("lists/{list_id}/cards"))?)
            .json(card);
        match self.mutate(request).await? {
            BoardEvent::CardCreated { card, .. } => Ok(card),
            other => Err(unexpected("CardCreated", &other)),
        }
    }

    pub async fn update_card(
        &self,
        card_id: CardId,
        changes: &UpdateCardRequest,
    ) -> ClientResult<Card> {
        let request = self
            .http
            .patch(self.url(&format!("cards/{card_id}"))?)
            .json(changes);
        match self.mutate(request).await? {
            BoardEvent::CardUpdated { card, .. } => Ok(card),
            other => Err(unexpected("CardUpdated", &other)),
        }
    }

    pub async fn delete_card(&self, card_id: CardId) -> ClientResult<()> {
        let request = self.http.delete(self.url(&format!("cards/{card_id}"))?);
        self.mutate(request).await.map(|_| ())
    }

    /// Moves a card on the open board. The cache shows the move immediately;
    /// the server's answer then overwrites it. On any failure the speculative
    /// state is dropped, the board is refetched and the original error is
    /// returned. If the cache does not know the card or list, the board is
    /// refetched first and the server decides.
    pub async fn move_card(
        &self,
        card_id: CardId,
        new_list_id: ListId,
        new_position: i64,
    ) -> ClientResult<Card> {
        let request = self
            .http
            .put(self.url(&format!("cards/{card_id}/move"))?)
            .json(&MoveCardRequest {
                new_list_id,
                new_position,
            });

        let mut previous = self
            .apply_optimistic_move(card_id, new_list_id, new_position)
            .await?;
        if previous.is_none() {
            debug!(%card_id, %new_list_id, "cache missed the move; refetching first");
            self.refresh().await?;
            previous = self
                .apply_optimistic_move(card_id, new_list_id, new_position)
                .await?;
        }

        let moved = self
            .send::<BoardEvent>(request)
            .await
            .and_then(|event| {
                let card = match &event {
                    BoardEvent::CardMoved { card, .. } => card.clone(),
                    other => return Err(unexpected("CardMoved", other)),
                };
                Ok((card, event))
            });

        match moved {
            Ok((card, event)) => {
                if let Some(snapshot) = self.open_board.lock().await.as_mut() {
                    cache::apply_event(snapshot, &event);
                }
                Ok(card)
            }
            Err(err) => {
                warn!(%card_id, error = %err, "move rejected; discarding optimistic state");
                if let Some(previous) = previous {
                    *self.open_board.lock().await = Some(previous);
                }
                if let Err(refresh_err) = self.refresh().await {
                    warn!(error = %refresh_err, "refetch after failed move also failed");
                }
                Err(err)
            }
        }
    }

    /// Applies the engine plan to the cache and returns the snapshot as it
    /// was before. `None` when the cache does not hold the card or the
    /// target list.
    async fn apply_optimistic_move(
        &self,
        card_id: CardId,
        new_list_id: ListId,
        new_position: i64,
    ) -> ClientResult<Option<BoardSnapshot>> {
        let mut guard = self.open_board.lock().await;
        let snapshot = guard.as_mut().ok_or(ClientError::NoBoardOpen)?;
        let plan = match cache::plan_card_move(snapshot, card_id, new_list_id, new_position) {
            Ok(plan) => plan,
            Err(ClientError::UnknownCard(_) | ClientError::UnknownList(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let previous = snapshot.clone();
        cache::apply_card_placements(snapshot, &plan.writes);
        debug!(
            %card_id,
            list_id = %plan.container,
            position = plan.position,
            "move applied optimistically"
        );
        Ok(Some(previous))
    }

    pub async fn invite_member(
        &self,
        invitee_id: UserId,
        message: Option<&str>,
    ) -> ClientResult<Invitation> {
        let board_id = self.open_board_id().await?;
        let request = self
            .http
            .post(self.url(&format!("boards/{board_id}/invitations"))?)
            .json(&InviteMemberRequest {
                invitee_id,
                message: message.map(str::to_string),
            });
        match self.send(request).await? {
            BoardEvent::InvitationCreated { invitation } => Ok(invitation),
            other => Err(unexpected("InvitationCreated", &other)),
        }
    }

    pub async fn list_invitations(
        &self,
        status: Option<InvitationStatus>,
    ) -> ClientResult<Vec<Invitation>> {
        let mut request = self.http.get(self.url("invitations")?);
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        self.send(request).await
    }

    pub async fn respond_to_invitation(
        &self,
        invitation_id: InvitationId,
        accept: bool,
    ) -> ClientResult<Vec<BoardEvent>> {
        let request = self
            .http
            .post(self.url(&format!("invitations/{invitation_id}/respond"))?)
            .json(&RespondInvitationRequest { accept });
        self.send(request).await
    }

    /// Folds a feed event into the cache. Returns whether the cache changed.
    pub async fn apply_remote_event(&self, event: &BoardEvent) -> bool {
        match self.open_board.lock().await.as_mut() {
            Some(snapshot) => cache::apply_event(snapshot, event),
            None => false,
        }
    }

    async fn fetch_board(&self, board_id: BoardId) -> ClientResult<BoardSnapshot> {
        self.send(self.http.get(self.url(&format!("boards/{board_id}"))?))
            .await
    }

    async fn open_board_id(&self) -> ClientResult<BoardId> {
        self.open_board
            .lock()
            .await
            .as_ref()
            .map(|snapshot| snapshot.board.board_id)
            .ok_or(ClientError::NoBoardOpen)
    }

    /// Sends a mutation and folds the resulting event into the cache.
    async fn mutate(&self, request: RequestBuilder) -> ClientResult<BoardEvent> {
        let event: BoardEvent = self.send(request).await?;
        self.apply_remote_event(&event).await;
        Ok(event)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let response = request
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        Ok(self.base_url.join(path)?)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let error = response
        .json::<ApiError>()
        .await
        .unwrap_or_else(|e| ApiError::internal(format!("undecodable error body: {e}")));
    Err(ClientError::Api {
        status: status.as_u16(),
        error,
    })
}

fn normalize_base_url(server_url: &str) -> ClientResult<Url> {
    let mut url = Url::parse(server_url.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn unexpected(expected: &str, got: &BoardEvent) -> ClientError {
    ClientError::UnexpectedResponse(format!("expected {expected}, got {got:?}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
