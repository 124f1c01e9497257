use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};

use shared::{
    domain::{
        BoardId, BoardRole, BoardSummary, Card, CardId, Invitation, InvitationId,
        InvitationStatus, ListId, MemberSummary, Priority, TaskList, UserId, UserSummary,
    },
    protocol::{BoardSnapshot, ListWithCards},
};

mod error;
mod ordering;

pub use error::{Entity, StoreError, StoreResult};
pub use ordering::{
    CardMove, CardRemoval, ListMove, ListRemoval, NewCard, OrderScope, OrderingViolation,
};

const CARD_COLUMNS: &str = "c.id, c.list_id, c.position, c.title, c.description, c.checklist, c.priority, c.created_by, c.created_at, c.updated_at";
const LIST_COLUMNS: &str = "l.id, l.board_id, l.title, l.position, l.version";
const BOARD_COLUMNS: &str =
    "b.id, b.title, b.description, b.owner_user_id, b.created_at, b.updated_at";
const INVITATION_COLUMNS: &str = "i.id, i.board_id, i.inviter_id, i.invitee_id, i.status, i.message, i.created_at, i.responded_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub max_connections: u32,
    /// How long a writer waits for another transaction's write lock before
    /// giving up with a database error.
    pub busy_timeout: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, &StorageOptions::default()).await
    }

    pub async fn connect(database_url: &str, options: &StorageOptions) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, full_name: Option<&str>) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, full_name) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET full_name = COALESCE(excluded.full_name, users.full_name)
             RETURNING id",
        )
        .bind(username)
        .bind(full_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<UserSummary>> {
        let row = sqlx::query("SELECT id, username, full_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserSummary {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            full_name: r.get::<Option<String>, _>(2),
        }))
    }

    pub async fn create_board(
        &self,
        title: &str,
        description: Option<&str>,
        owner_user_id: UserId,
    ) -> Result<BoardId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO boards (title, description, owner_user_id) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(title)
        .bind(description)
        .bind(owner_user_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let board_id = BoardId(rec.get::<i64, _>(0));

        sqlx::query("INSERT INTO board_members (board_id, user_id, role) VALUES (?, ?, ?)")
            .bind(board_id.0)
            .bind(owner_user_id.0)
            .bind(BoardRole::Owner.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(board_id)
    }

    pub async fn board(&self, board_id: BoardId) -> Result<Option<BoardSummary>> {
        let row = sqlx::query(&format!("SELECT {BOARD_COLUMNS} FROM boards b WHERE b.id = ?"))
            .bind(board_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(board_from_row))
    }

    pub async fn update_board(
        &self,
        board_id: BoardId,
        title: Option<&str>,
        description: Option<Option<&str>>,
    ) -> Result<Option<BoardSummary>> {
        let updated = sqlx::query(
            "UPDATE boards
             SET title = COALESCE(?, title),
                 description = CASE WHEN ? THEN ? ELSE description END,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(title)
        .bind(description.is_some())
        .bind(description.flatten())
        .bind(board_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        self.board(board_id).await
    }

    pub async fn list_boards_for_user(&self, user_id: UserId) -> Result<Vec<BoardSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOARD_COLUMNS}
             FROM boards b
             INNER JOIN board_members m ON m.board_id = b.id
             WHERE m.user_id = ?
             ORDER BY b.id ASC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(board_from_row).collect())
    }

    pub async fn membership_role(
        &self,
        board_id: BoardId,
        user_id: UserId,
    ) -> Result<Option<BoardRole>> {
        let row = sqlx::query("SELECT role FROM board_members WHERE board_id = ? AND user_id = ?")
            .bind(board_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| BoardRole::parse(&r.get::<String, _>(0))))
    }

    pub async fn list_members(&self, board_id: BoardId) -> Result<Vec<MemberSummary>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, m.role
             FROM board_members m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.board_id = ?
             ORDER BY lower(u.username) ASC",
        )
        .bind(board_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| MemberSummary {
                board_id,
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                role: BoardRole::parse(&r.get::<String, _>(2)),
            })
            .collect())
    }

    pub async fn create_invitation(
        &self,
        board_id: BoardId,
        inviter_id: UserId,
        invitee_id: UserId,
        message: Option<&str>,
    ) -> Result<Invitation> {
        let rec = sqlx::query(
            "INSERT INTO invitations (board_id, inviter_id, invitee_id, message) VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(board_id.0)
        .bind(inviter_id.0)
        .bind(invitee_id.0)
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        let invitation_id = InvitationId(rec.get::<i64, _>(0));
        self.invitation(invitation_id)
            .await?
            .with_context(|| format!("invitation {invitation_id} vanished after insert"))
    }

    pub async fn invitation(&self, invitation_id: InvitationId) -> Result<Option<Invitation>> {
        let row = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations i WHERE i.id = ?"
        ))
        .bind(invitation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(invitation_from_row))
    }

    pub async fn list_invitations_for_user(
        &self,
        invitee_id: UserId,
        status: Option<InvitationStatus>,
    ) -> Result<Vec<Invitation>> {
        let rows = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS}
             FROM invitations i
             WHERE i.invitee_id = ? AND (? IS NULL OR i.status = ?)
             ORDER BY i.id DESC"
        ))
        .bind(invitee_id.0)
        .bind(status.map(InvitationStatus::as_str))
        .bind(status.map(InvitationStatus::as_str))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(invitation_from_row).collect())
    }

    /// Answers a pending invitation; accepting also adds the invitee as a
    /// board member. Answered invitations are returned unchanged.
    pub async fn respond_to_invitation(
        &self,
        invitation_id: InvitationId,
        accept: bool,
    ) -> StoreResult<Invitation> {
        let mut tx = self.pool.begin().await?;
        let status = if accept {
            InvitationStatus::Accepted
        } else {
            InvitationStatus::Declined
        };

        let answered = sqlx::query(
            "UPDATE invitations
             SET status = ?, responded_at = CURRENT_TIMESTAMP
             WHERE id = ? AND status = 'pending'
             RETURNING board_id, invitee_id",
        )
        .bind(status.as_str())
        .bind(invitation_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = answered {
            if accept {
                sqlx::query(
                    "INSERT INTO board_members (board_id, user_id, role) VALUES (?, ?, 'member')
                     ON CONFLICT(board_id, user_id) DO NOTHING",
                )
                .bind(row.get::<i64, _>(0))
                .bind(row.get::<i64, _>(1))
                .execute(&mut *tx)
                .await?;
            }
        }

        let row = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations i WHERE i.id = ?"
        ))
        .bind(invitation_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found(Entity::Invitation, invitation_id.0))?;
        tx.commit().await?;
        Ok(invitation_from_row(&row))
    }

    pub async fn list(&self, list_id: ListId) -> Result<Option<TaskList>> {
        let row = sqlx::query(&format!("SELECT {LIST_COLUMNS} FROM task_lists l WHERE l.id = ?"))
            .bind(list_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(list_from_row))
    }

    pub async fn board_for_list(&self, list_id: ListId) -> Result<Option<BoardId>> {
        let row = sqlx::query("SELECT board_id FROM task_lists WHERE id = ?")
            .bind(list_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| BoardId(r.get::<i64, _>(0))))
    }

    pub async fn board_for_card(&self, card_id: CardId) -> Result<Option<BoardId>> {
        let row = sqlx::query(
            "SELECT l.board_id FROM cards c INNER JOIN task_lists l ON l.id = c.list_id WHERE c.id = ?",
        )
        .bind(card_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| BoardId(r.get::<i64, _>(0))))
    }

    pub async fn card(&self, card_id: CardId) -> StoreResult<Option<Card>> {
        let row = sqlx::query(&format!("SELECT {CARD_COLUMNS} FROM cards c WHERE c.id = ?"))
            .bind(card_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    pub async fn list_cards(&self, list_id: ListId) -> StoreResult<Vec<Card>> {
        let rows = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM cards c WHERE c.list_id = ? ORDER BY c.position ASC, c.id ASC"
        ))
        .bind(list_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(card_from_row).collect()
    }

    /// Reads a board with its lists and cards in position order. Runs in one
    /// read transaction so the result never mixes two commits.
    pub async fn board_snapshot(&self, board_id: BoardId) -> StoreResult<Option<BoardSnapshot>> {
        let mut tx = self.pool.begin().await?;
        let Some(board_row) =
            sqlx::query(&format!("SELECT {BOARD_COLUMNS} FROM boards b WHERE b.id = ?"))
                .bind(board_id.0)
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(None);
        };

        let list_rows = sqlx::query(&format!(
            "SELECT {LIST_COLUMNS} FROM task_lists l WHERE l.board_id = ? ORDER BY l.position ASC, l.id ASC"
        ))
        .bind(board_id.0)
        .fetch_all(&mut *tx)
        .await?;

        let card_rows = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS}
             FROM cards c
             INNER JOIN task_lists l ON l.id = c.list_id
             WHERE l.board_id = ?
             ORDER BY c.list_id ASC, c.position ASC, c.id ASC"
        ))
        .bind(board_id.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut lists: Vec<ListWithCards> = list_rows
            .iter()
            .map(|row| ListWithCards {
                list: list_from_row(row),
                cards: Vec::new(),
            })
            .collect();
        for row in &card_rows {
            let card = card_from_row(row)?;
            if let Some(list) = lists
                .iter_mut()
                .find(|list| list.list.list_id == card.list_id)
            {
                list.cards.push(card);
            }
        }

        Ok(Some(BoardSnapshot {
            board: board_from_row(&board_row),
            lists,
        }))
    }

    /// Creates the demo board used by fresh installs. Does nothing once any
    /// board exists.
    pub async fn seed_sample_data(&self) -> Result<Option<BoardId>> {
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM boards")
            .fetch_one(&self.pool)
            .await?;
        if existing > 0 {
            return Ok(None);
        }

        let owner = self.create_user("demo", Some("Demo User")).await?;
        let board_id = self
            .create_board("My Task Board", None, owner)
            .await
            .context("failed to create sample board")?;

        let samples = [
            ("To Do", "Design wireframes", "Create wireframes for the main interface"),
            ("In Progress", "Setup backend", "Initialize the board API service"),
            ("Done", "Create logo", "Design company logo"),
        ];
        for (list_title, card_title, description) in samples {
            let list = self.create_list(board_id, list_title).await?;
            self.create_card(
                list.list_id,
                NewCard {
                    title: card_title.to_string(),
                    description: Some(description.to_string()),
                    checklist: Vec::new(),
                    priority: Priority::Medium,
                    created_by: Some(owner),
                },
            )
            .await?;
        }

        Ok(Some(board_id))
    }
}

fn board_from_row(r: &SqliteRow) -> BoardSummary {
    BoardSummary {
        board_id: BoardId(r.get::<i64, _>(0)),
        title: r.get::<String, _>(1),
        description: r.get::<Option<String>, _>(2),
        owner_id: UserId(r.get::<i64, _>(3)),
        created_at: r.get::<DateTime<Utc>, _>(4),
        updated_at: r.get::<DateTime<Utc>, _>(5),
    }
}

fn list_from_row(r: &SqliteRow) -> TaskList {
    TaskList {
        list_id: ListId(r.get::<i64, _>(0)),
        board_id: BoardId(r.get::<i64, _>(1)),
        title: r.get::<String, _>(2),
        position: r.get::<i64, _>(3),
        version: r.get::<i64, _>(4),
    }
}

fn card_from_row(r: &SqliteRow) -> StoreResult<Card> {
    let card_id = r.get::<i64, _>(0);
    let checklist_raw = r.get::<String, _>(5);
    let checklist = serde_json::from_str::<Vec<String>>(&checklist_raw).map_err(|e| {
        StoreError::Corrupt {
            entity: Entity::Card,
            id: card_id,
            reason: format!("checklist is not a JSON string array: {e}"),
        }
    })?;

    Ok(Card {
        card_id: CardId(card_id),
        list_id: ListId(r.get::<i64, _>(1)),
        position: r.get::<i64, _>(2),
        title: r.get::<String, _>(3),
        description: r.get::<Option<String>, _>(4),
        checklist,
        priority: Priority::parse(&r.get::<String, _>(6)),
        created_by: r.get::<Option<i64>, _>(7).map(UserId),
        created_at: r.get::<DateTime<Utc>, _>(8),
        updated_at: r.get::<DateTime<Utc>, _>(9),
    })
}

fn invitation_from_row(r: &SqliteRow) -> Invitation {
    Invitation {
        invitation_id: InvitationId(r.get::<i64, _>(0)),
        board_id: BoardId(r.get::<i64, _>(1)),
        inviter_id: UserId(r.get::<i64, _>(2)),
        invitee_id: UserId(r.get::<i64, _>(3)),
        status: InvitationStatus::parse(&r.get::<String, _>(4)),
        message: r.get::<Option<String>, _>(5),
        created_at: r.get::<DateTime<Utc>, _>(6),
        responded_at: r.get::<Option<DateTime<Utc>>, _>(7),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
