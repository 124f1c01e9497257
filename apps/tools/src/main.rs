use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shared::domain::{BoardId, CardId, ListId, Priority, UserId};
use storage::{NewCard, OrderScope, Storage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Administer a task board database")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/taskboard.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply migrations and create the sample board if the database is empty.
    Init,
    CreateUser {
        username: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    CreateBoard {
        owner_user_id: i64,
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    CreateList {
        board_id: i64,
        title: String,
    },
    CreateCard {
        list_id: i64,
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
    },
    /// Move a card; out-of-range positions are clamped.
    MoveCard {
        card_id: i64,
        list_id: i64,
        position: i64,
    },
    /// Print the lists and cards of a board in position order.
    Show {
        board_id: i64,
    },
    /// Report every list or board whose positions are not 0..n-1.
    Verify,
    /// Renumber broken lists and boards, keeping their current order.
    Repair,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PriorityArg {
    Low,
    Medium,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::Init => match storage.seed_sample_data().await? {
            Some(board_id) => println!("seeded sample board_id={board_id}"),
            None => println!("database already has boards; nothing seeded"),
        },
        Command::CreateUser {
            username,
            full_name,
        } => {
            let user_id = storage
                .create_user(&username, full_name.as_deref())
                .await?;
            println!("created user_id={user_id}");
        }
        Command::CreateBoard {
            owner_user_id,
            title,
            description,
        } => {
            let board_id = storage
                .create_board(&title, description.as_deref(), UserId(owner_user_id))
                .await?;
            println!("created board_id={board_id}");
        }
        Command::CreateList { board_id, title } => {
            let list = storage.create_list(BoardId(board_id), &title).await?;
            println!(
                "created list_id={} position={}",
                list.list_id, list.position
            );
        }
        Command::CreateCard {
            list_id,
            title,
            description,
            priority,
        } => {
            let card = storage
                .create_card(
                    ListId(list_id),
                    NewCard {
                        title,
                        description,
                        checklist: Vec::new(),
                        priority: priority.into(),
                        created_by: None,
                    },
                )
                .await?;
            println!(
                "created card_id={} position={}",
                card.card_id, card.position
            );
        }
        Command::MoveCard {
            card_id,
            list_id,
            position,
        } => {
            let moved = storage
                .move_card(CardId(card_id), ListId(list_id), position)
                .await?;
            info!(writes = moved.placements.len(), "card moved");
            println!(
                "card_id={} list_id={} position={}",
                moved.card.card_id, moved.card.list_id, moved.card.position
            );
        }
        Command::Show { board_id } => {
            let Some(snapshot) = storage.board_snapshot(BoardId(board_id)).await? else {
                bail!("board {board_id} not found");
            };
            println!("{} (board_id={})", snapshot.board.title, board_id);
            for list in &snapshot.lists {
                println!(
                    "  [{}] {} (list_id={})",
                    list.list.position, list.list.title, list.list.list_id
                );
                for card in &list.cards {
                    println!(
                        "    [{}] {} (card_id={}, {})",
                        card.position,
                        card.title,
                        card.card_id,
                        card.priority.as_str()
                    );
                }
            }
        }
        Command::Verify => {
            let violations = storage.verify_ordering().await?;
            if violations.is_empty() {
                println!("ordering ok");
                return Ok(());
            }
            for v in &violations {
                let scope = match v.scope {
                    OrderScope::List(list_id) => format!("list {list_id}"),
                    OrderScope::Board(board_id) => format!("board {board_id}"),
                };
                warn!(%scope, violation = ?v.violation, "ordering violation");
                println!("{scope}: {:?}", v.violation);
            }
            bail!("{} ordering violations found", violations.len());
        }
        Command::Repair => {
            let rewritten = storage.repair_ordering().await?;
            println!("rewrote {rewritten} positions");
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
