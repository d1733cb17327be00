//! Operator command surface for the `MathQuest` progress database.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_command`] runs a single
//! [`Command`] against an already opened [`SqliteProgressStore`]. Every
//! command prints pretty JSON on stdout.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use mathquest_progress_core::{
    now_utc, parse_rfc3339_utc, GameDataUpdate, GameSessionInput, LevelScoreUpdate, ProgressError,
    UserDocument, UserId,
};
use mathquest_progress_store_sqlite::SqliteProgressStore;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "mq")]
#[command(about = "MathQuest progress CLI")]
pub struct Cli {
    #[arg(long, env = "MATHQUEST_DB", default_value = "./mathquest.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Score {
        #[command(subcommand)]
        command: ScoreCommand,
    },
    Session {
        #[command(subcommand)]
        command: Box<SessionCommand>,
    },
    Streak {
        #[command(subcommand)]
        command: StreakCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Applies pending schema migrations and prints the resulting status.
    Migrate,
    /// Prints schema status without migrating.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Show(UserShowArgs),
    Update(UserUpdateArgs),
    /// Imports a JSON array of exported user documents.
    Import(UserImportArgs),
}

#[derive(Debug, Args)]
pub struct UserShowArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Args)]
pub struct UserUpdateArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    level: Option<u32>,
    #[arg(long)]
    total_score: Option<u64>,
    #[arg(long)]
    experience: Option<u64>,
    #[arg(long)]
    last_played_at: Option<String>,
    /// JSON object keyed by level, e.g. `{"3":{"highScore":80}}`.
    #[arg(long)]
    level_scores_json: Option<String>,
}

#[derive(Debug, Args)]
pub struct UserImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ScoreCommand {
    /// Computes the score delta without writing anything.
    Delta(ScoreArgs),
    /// Records a finished level and returns its delta.
    Submit(ScoreSubmitArgs),
}

#[derive(Debug, Args)]
pub struct ScoreArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    level: u32,
    #[arg(long)]
    score: u32,
}

#[derive(Debug, Args)]
pub struct ScoreSubmitArgs {
    #[command(flatten)]
    score: ScoreArgs,
    #[arg(long)]
    played_at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Log(SessionLogArgs),
    List(SessionListArgs),
}

#[derive(Debug, Args)]
pub struct SessionLogArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    grade: u8,
    #[arg(long)]
    level: u32,
    #[arg(long)]
    score: u32,
    #[arg(long)]
    total_questions: u32,
    #[arg(long)]
    percentage: Option<u32>,
    #[arg(long)]
    start_time: String,
    #[arg(long)]
    end_time: String,
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Debug, Args)]
pub struct SessionListArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum StreakCommand {
    /// Copies legacy `dailyStreak` values into `playStreak`.
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteProgressStore::open(&cli.db)?;
    match cli.command {
        Command::Db {
            command: DbCommand::Status,
        } => print_json(&store.schema_status()?),
        command => {
            store.migrate()?;
            run_command(command, &mut store)
        }
    }
}

/// Executes one command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, validation, or persistence fails.
pub fn run_command(command: Command, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        Command::Db { command } => match command {
            DbCommand::Migrate => {
                store.migrate()?;
                print_json(&store.schema_status()?)
            }
            DbCommand::Status => print_json(&store.schema_status()?),
        },
        Command::User { command } => match *command {
            UserCommand::Show(args) => {
                let user_id = parse_user_id(&args.user_id)?;
                let record = store
                    .get_user(&user_id)?
                    .ok_or_else(|| ProgressError::UserNotFound(user_id.to_string()))?;
                print_json(&record)
            }
            UserCommand::Update(args) => {
                let user_id = parse_user_id(&args.user_id)?;
                let update = GameDataUpdate {
                    level: args.level,
                    total_score: args.total_score,
                    experience: args.experience,
                    last_played_at: args
                        .last_played_at
                        .as_deref()
                        .map(parse_utc)
                        .transpose()?,
                    level_scores: args
                        .level_scores_json
                        .as_deref()
                        .map(parse_level_scores_json)
                        .transpose()?,
                };
                let record = store.update_user_game_data(&user_id, &update)?;
                print_json(&record)
            }
            UserCommand::Import(args) => {
                let raw = std::fs::read_to_string(&args.file)
                    .with_context(|| format!("failed to read {}", args.file.display()))?;
                let documents: Vec<UserDocument> = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid user documents in {}", args.file.display()))?;
                print_json(&store.import_user_documents(documents)?)
            }
        },
        Command::Score { command } => match command {
            ScoreCommand::Delta(args) => {
                let user_id = parse_user_id(&args.user_id)?;
                print_json(&store.score_delta_for(&user_id, args.level, args.score))
            }
            ScoreCommand::Submit(args) => {
                let user_id = parse_user_id(&args.score.user_id)?;
                let played_at = match args.played_at.as_deref() {
                    Some(raw) => parse_utc(raw)?,
                    None => now_utc(),
                };
                let delta = store.record_level_score(
                    &user_id,
                    args.score.level,
                    args.score.score,
                    played_at,
                )?;
                print_json(&delta)
            }
        },
        Command::Session { command } => match *command {
            SessionCommand::Log(args) => {
                let input = GameSessionInput {
                    user_id: parse_user_id(&args.user_id)?,
                    grade: args.grade,
                    level: args.level,
                    score: args.score,
                    total_questions: args.total_questions,
                    percentage: args.percentage,
                    start_time: parse_utc(&args.start_time)?,
                    end_time: parse_utc(&args.end_time)?,
                    duration: args.duration,
                };
                print_json(&store.save_game_session(input)?)
            }
            SessionCommand::List(args) => {
                let user_id = parse_user_id(&args.user_id)?;
                print_json(&store.list_sessions_for_user(&user_id, args.limit)?)
            }
        },
        Command::Streak {
            command: StreakCommand::Migrate { dry_run },
        } => print_json(&store.migrate_streaks(dry_run)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::parse(raw).map_err(|err| anyhow!("invalid user id: {err}"))
}

fn parse_utc(raw: &str) -> Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn parse_level_scores_json(raw: &str) -> Result<BTreeMap<u32, LevelScoreUpdate>> {
    serde_json::from_str(raw)
        .with_context(|| format!("level_scores_json must map levels to {{\"highScore\": n}}: {raw}"))
}
