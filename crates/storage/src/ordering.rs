//! Position-mutating operations. Every function here runs inside a single
//! transaction whose first statement is a write, so SQLite hands out the
//! write lock before any position is read and two shift computations can
//! never interleave. Dropping the transaction on an error path rolls back
//! every write it made.

use std::collections::BTreeMap;

use shared::{
    domain::{BoardId, Card, CardId, ListId, Priority, TaskList, UserId},
    ordering::{self, DenseViolation, Lane, PositionWrite},
    protocol::{CardPlacement, ListPlacement},
};
use sqlx::{Row, SqliteConnection};

use crate::{
    card_from_row, list_from_row, Entity, Storage, StoreError, StoreResult, CARD_COLUMNS,
    LIST_COLUMNS,
};

#[derive(Debug, Clone)]
pub struct NewCard {
    pub title: String,
    pub description: Option<String>,
    pub checklist: Vec<String>,
    pub priority: Priority,
    pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardMove {
    pub card: Card,
    /// Placements written by this move. Empty for a move onto the card's
    /// current slot.
    pub placements: Vec<CardPlacement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRemoval {
    pub list_id: ListId,
    pub placements: Vec<CardPlacement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMove {
    pub list: TaskList,
    pub placements: Vec<ListPlacement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRemoval {
    pub board_id: BoardId,
    pub removed_cards: u64,
    pub placements: Vec<ListPlacement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    List(ListId),
    Board(BoardId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingViolation {
    pub scope: OrderScope,
    pub violation: DenseViolation,
}

impl Storage {
    /// Moves a card to `target_position` of `target_list_id`, clamping the
    /// position into `[0, N]` where N counts the destination without the
    /// moving card.
    pub async fn move_card(
        &self,
        card_id: CardId,
        target_list_id: ListId,
        target_position: i64,
    ) -> StoreResult<CardMove> {
        let mut tx = self.pool.begin().await?;
        lock_list(&mut tx, target_list_id).await?;

        let source_list_id = sqlx::query("SELECT list_id FROM cards WHERE id = ?")
            .bind(card_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| ListId(r.get::<i64, _>(0)))
            .ok_or_else(|| StoreError::not_found(Entity::Card, card_id.0))?;

        let cross_list = source_list_id != target_list_id;
        if cross_list {
            lock_list(&mut tx, source_list_id).await?;
        }

        let source_items = ordered_card_ids(&mut tx, source_list_id).await?;
        let target_items = if cross_list {
            Some(ordered_card_ids(&mut tx, target_list_id).await?)
        } else {
            None
        };

        let plan = ordering::plan_move(
            card_id,
            Lane::new(source_list_id, &source_items),
            target_items
                .as_deref()
                .map(|items| Lane::new(target_list_id, items)),
            target_position,
        )
        .map_err(|e| StoreError::Corrupt {
            entity: Entity::List,
            id: source_list_id.0,
            reason: e.to_string(),
        })?;

        if plan.is_noop() {
            // nothing to write, and the version bump must not survive either
            let card = fetch_card(&mut tx, card_id).await?;
            tx.rollback().await?;
            return Ok(CardMove {
                card,
                placements: Vec::new(),
            });
        }

        write_card_placements(&mut tx, &plan.writes).await?;
        let card = fetch_card(&mut tx, card_id).await?;
        tx.commit().await?;

        Ok(CardMove {
            card,
            placements: plan.writes,
        })
    }

    /// Creates a card at the tail of `list_id`.
    pub async fn create_card(&self, list_id: ListId, card: NewCard) -> StoreResult<Card> {
        let mut tx = self.pool.begin().await?;
        lock_list(&mut tx, list_id).await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cards WHERE list_id = ?")
            .bind(list_id.0)
            .fetch_one(&mut *tx)
            .await?;
        let position = ordering::append_position(usize::try_from(count).unwrap_or_default());
        let checklist = serde_json::to_string(&card.checklist).map_err(|e| {
            StoreError::Corrupt {
                entity: Entity::Card,
                id: 0,
                reason: format!("checklist could not be encoded: {e}"),
            }
        })?;

        let rec = sqlx::query(
            "INSERT INTO cards (list_id, position, title, description, checklist, priority, created_by)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(list_id.0)
        .bind(position)
        .bind(card.title.as_str())
        .bind(card.description.as_deref())
        .bind(checklist)
        .bind(card.priority.as_str())
        .bind(card.created_by.map(|id| id.0))
        .fetch_one(&mut *tx)
        .await?;
        let card_id = CardId(rec.get::<i64, _>(0));

        let card = fetch_card(&mut tx, card_id).await?;
        tx.commit().await?;
        Ok(card)
    }

    /// Edits the non-positional fields of a card. `None` leaves a field as is;
    /// `Some(None)` clears the description.
    pub async fn update_card(
        &self,
        card_id: CardId,
        title: Option<&str>,
        description: Option<Option<&str>>,
        checklist: Option<&[String]>,
        priority: Option<Priority>,
    ) -> StoreResult<Card> {
        let checklist = checklist
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                entity: Entity::Card,
                id: card_id.0,
                reason: format!("checklist could not be encoded: {e}"),
            })?;

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE cards
             SET title = COALESCE(?, title),
                 description = CASE WHEN ? THEN ? ELSE description END,
                 checklist = COALESCE(?, checklist),
                 priority = COALESCE(?, priority),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(title)
        .bind(description.is_some())
        .bind(description.flatten())
        .bind(checklist)
        .bind(priority.map(Priority::as_str))
        .bind(card_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::not_found(Entity::Card, card_id.0));
        }

        let card = fetch_card(&mut tx, card_id).await?;
        tx.commit().await?;
        Ok(card)
    }

    /// Deletes a card and closes the gap it leaves in its list.
    pub async fn delete_card(&self, card_id: CardId) -> StoreResult<CardRemoval> {
        let mut tx = self.pool.begin().await?;
        let list_id = sqlx::query(
            "UPDATE task_lists SET version = version + 1
             WHERE id = (SELECT list_id FROM cards WHERE id = ?)
             RETURNING id",
        )
        .bind(card_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| ListId(r.get::<i64, _>(0)))
        .ok_or_else(|| StoreError::not_found(Entity::Card, card_id.0))?;

        let items = ordered_card_ids(&mut tx, list_id).await?;
        let writes = ordering::plan_removal(card_id, Lane::new(list_id, &items)).map_err(|e| {
            StoreError::Corrupt {
                entity: Entity::List,
                id: list_id.0,
                reason: e.to_string(),
            }
        })?;

        sqlx::query("DELETE FROM cards WHERE id = ?")
            .bind(card_id.0)
            .execute(&mut *tx)
            .await?;
        write_card_placements(&mut tx, &writes).await?;
        tx.commit().await?;

        Ok(CardRemoval {
            list_id,
            placements: writes,
        })
    }

    /// Creates a list at the tail of `board_id`.
    pub async fn create_list(&self, board_id: BoardId, title: &str) -> StoreResult<TaskList> {
        let mut tx = self.pool.begin().await?;
        lock_board(&mut tx, board_id).await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_lists WHERE board_id = ?")
            .bind(board_id.0)
            .fetch_one(&mut *tx)
            .await?;
        let position = ordering::append_position(usize::try_from(count).unwrap_or_default());

        let rec = sqlx::query(
            "INSERT INTO task_lists (board_id, title, position) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(board_id.0)
        .bind(title)
        .bind(position)
        .fetch_one(&mut *tx)
        .await?;
        let list_id = ListId(rec.get::<i64, _>(0));

        let list = fetch_list(&mut tx, list_id).await?;
        tx.commit().await?;
        Ok(list)
    }

    pub async fn rename_list(&self, list_id: ListId, title: &str) -> StoreResult<TaskList> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE task_lists SET title = ? WHERE id = ?")
            .bind(title)
            .bind(list_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::not_found(Entity::List, list_id.0));
        }
        let list = fetch_list(&mut tx, list_id).await?;
        tx.commit().await?;
        Ok(list)
    }

    /// Reorders a list within its board, clamping like `move_card`.
    pub async fn move_list(&self, list_id: ListId, target_position: i64) -> StoreResult<ListMove> {
        let mut tx = self.pool.begin().await?;
        let board_id = lock_list(&mut tx, list_id).await?;
        lock_board(&mut tx, board_id).await?;

        let items = ordered_list_ids(&mut tx, board_id).await?;
        let plan = ordering::plan_move(list_id, Lane::new(board_id, &items), None, target_position)
            .map_err(|e| StoreError::Corrupt {
                entity: Entity::Board,
                id: board_id.0,
                reason: e.to_string(),
            })?;

        if plan.is_noop() {
            let list = fetch_list(&mut tx, list_id).await?;
            tx.rollback().await?;
            return Ok(ListMove {
                list,
                placements: Vec::new(),
            });
        }

        write_list_placements(&mut tx, &plan.writes).await?;
        let list = fetch_list(&mut tx, list_id).await?;
        tx.commit().await?;
        Ok(ListMove {
            list,
            placements: plan.writes,
        })
    }

    /// Deletes a list together with its cards and renumbers the board's
    /// remaining lists.
    pub async fn delete_list(&self, list_id: ListId) -> StoreResult<ListRemoval> {
        let mut tx = self.pool.begin().await?;
        let board_id = lock_list(&mut tx, list_id).await?;
        lock_board(&mut tx, board_id).await?;

        let items = ordered_list_ids(&mut tx, board_id).await?;
        let writes = ordering::plan_removal(list_id, Lane::new(board_id, &items)).map_err(|e| {
            StoreError::Corrupt {
                entity: Entity::Board,
                id: board_id.0,
                reason: e.to_string(),
            }
        })?;

        let removed_cards = sqlx::query("DELETE FROM cards WHERE list_id = ?")
            .bind(list_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM task_lists WHERE id = ?")
            .bind(list_id.0)
            .execute(&mut *tx)
            .await?;
        write_list_placements(&mut tx, &writes).await?;
        tx.commit().await?;

        Ok(ListRemoval {
            board_id,
            removed_cards,
            placements: writes,
        })
    }

    /// Scans every list and board for positions that break the dense
    /// `0..count` rule.
    pub async fn verify_ordering(&self) -> StoreResult<Vec<OrderingViolation>> {
        let mut tx = self.pool.begin().await?;
        let card_positions = grouped_positions(
            &mut tx,
            "SELECT list_id, id, position FROM cards ORDER BY list_id ASC, position ASC, id ASC",
        )
        .await?;
        let list_positions = grouped_positions(
            &mut tx,
            "SELECT board_id, id, position FROM task_lists ORDER BY board_id ASC, position ASC, id ASC",
        )
        .await?;
        tx.commit().await?;

        let mut violations = Vec::new();
        for (list_id, slots) in card_positions {
            let positions: Vec<i64> = slots.iter().map(|(_, position)| *position).collect();
            violations.extend(ordering::dense_violations(&positions).into_iter().map(
                |violation| OrderingViolation {
                    scope: OrderScope::List(ListId(list_id)),
                    violation,
                },
            ));
        }
        for (board_id, slots) in list_positions {
            let positions: Vec<i64> = slots.iter().map(|(_, position)| *position).collect();
            violations.extend(ordering::dense_violations(&positions).into_iter().map(
                |violation| OrderingViolation {
                    scope: OrderScope::Board(BoardId(board_id)),
                    violation,
                },
            ));
        }
        Ok(violations)
    }

    /// Renumbers every list and board back to `0..count`, keeping the
    /// current relative order (ties broken by id). Returns the number of
    /// rows rewritten.
    pub async fn repair_ordering(&self) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        // take the write lock before reading
        sqlx::query("UPDATE task_lists SET version = version + 1")
            .execute(&mut *tx)
            .await?;

        let card_positions = grouped_positions(
            &mut tx,
            "SELECT list_id, id, position FROM cards ORDER BY list_id ASC, position ASC, id ASC",
        )
        .await?;
        let list_positions = grouped_positions(
            &mut tx,
            "SELECT board_id, id, position FROM task_lists ORDER BY board_id ASC, position ASC, id ASC",
        )
        .await?;

        let mut rewritten = 0;
        for (list_id, slots) in card_positions {
            let slots: Vec<(CardId, i64)> = slots
                .into_iter()
                .map(|(id, position)| (CardId(id), position))
                .collect();
            let writes = ordering::plan_renumber(ListId(list_id), &slots);
            rewritten += writes.len();
            write_card_placements(&mut tx, &writes).await?;
        }
        for (board_id, slots) in list_positions {
            let slots: Vec<(ListId, i64)> = slots
                .into_iter()
                .map(|(id, position)| (ListId(id), position))
                .collect();
            let writes = ordering::plan_renumber(BoardId(board_id), &slots);
            rewritten += writes.len();
            write_list_placements(&mut tx, &writes).await?;
        }

        if rewritten == 0 {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(rewritten)
    }
}

/// Bumps the list's version, taking the write lock. Returns its board.
async fn lock_list(conn: &mut SqliteConnection, list_id: ListId) -> StoreResult<BoardId> {
    sqlx::query("UPDATE task_lists SET version = version + 1 WHERE id = ? RETURNING board_id")
        .bind(list_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .map(|r| BoardId(r.get::<i64, _>(0)))
        .ok_or_else(|| StoreError::not_found(Entity::List, list_id.0))
}

async fn lock_board(conn: &mut SqliteConnection, board_id: BoardId) -> StoreResult<()> {
    let updated = sqlx::query("UPDATE boards SET updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(board_id.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(StoreError::not_found(Entity::Board, board_id.0));
    }
    Ok(())
}

async fn ordered_card_ids(conn: &mut SqliteConnection, list_id: ListId) -> StoreResult<Vec<CardId>> {
    let rows = sqlx::query("SELECT id FROM cards WHERE list_id = ? ORDER BY position ASC, id ASC")
        .bind(list_id.0)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| CardId(r.get::<i64, _>(0)))
        .collect())
}

async fn ordered_list_ids(
    conn: &mut SqliteConnection,
    board_id: BoardId,
) -> StoreResult<Vec<ListId>> {
    let rows =
        sqlx::query("SELECT id FROM task_lists WHERE board_id = ? ORDER BY position ASC, id ASC")
            .bind(board_id.0)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|r| ListId(r.get::<i64, _>(0)))
        .collect())
}

/// Runs a `(container, id, position)` query and groups the rows by
/// container, keeping query order inside each group.
async fn grouped_positions(
    conn: &mut SqliteConnection,
    sql: &str,
) -> StoreResult<BTreeMap<i64, Vec<(i64, i64)>>> {
    let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
    let mut grouped: BTreeMap<i64, Vec<(i64, i64)>> = BTreeMap::new();
    for r in rows {
        grouped
            .entry(r.get::<i64, _>(0))
            .or_default()
            .push((r.get::<i64, _>(1), r.get::<i64, _>(2)));
    }
    Ok(grouped)
}

async fn write_card_placements(
    conn: &mut SqliteConnection,
    writes: &[PositionWrite<ListId, CardId>],
) -> StoreResult<()> {
    for write in writes {
        sqlx::query("UPDATE cards SET list_id = ?, position = ? WHERE id = ?")
            .bind(write.container.0)
            .bind(write.position)
            .bind(write.item.0)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn write_list_placements(
    conn: &mut SqliteConnection,
    writes: &[PositionWrite<BoardId, ListId>],
) -> StoreResult<()> {
    for write in writes {
        sqlx::query("UPDATE task_lists SET board_id = ?, position = ? WHERE id = ?")
            .bind(write.container.0)
            .bind(write.position)
            .bind(write.item.0)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn fetch_card(conn: &mut SqliteConnection, card_id: CardId) -> StoreResult<Card> {
    let row = sqlx::query(&format!("SELECT {CARD_COLUMNS} FROM cards c WHERE c.id = ?"))
        .bind(card_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found(Entity::Card, card_id.0))?;
    card_from_row(&row)
}

async fn fetch_list(conn: &mut SqliteConnection, list_id: ListId) -> StoreResult<TaskList> {
    let row = sqlx::query(&format!("SELECT {LIST_COLUMNS} FROM task_lists l WHERE l.id = ?"))
        .bind(list_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found(Entity::List, list_id.0))?;
    Ok(list_from_row(&row))
}
