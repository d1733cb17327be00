use std::path::PathBuf;

use anyhow::{Context, Result};
use mathquest_progress_core::{
    GameDataUpdate, GameSessionInput, ProgressError, ScoreDelta, StreakMigrationReport, UserId,
    UserRecord,
};
use mathquest_progress_store_sqlite::{SaveGameDataFailed, SchemaStatus, SqliteProgressStore};
use serde::Serialize;
use time::OffsetDateTime;
use ulid::Ulid;

/// Operation facade used by the HTTP handlers. Each call opens its own store
/// handle so it can run on the blocking pool.
#[derive(Debug, Clone)]
pub struct ProgressApi {
    db_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogOutcome {
    pub logged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameCompletion {
    pub delta: ScoreDelta,
    pub session_logged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Ulid>,
}

impl ProgressApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteProgressStore> {
        SqliteProgressStore::open(&self.db_path)
    }

    pub fn migrate(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.migrate()?;
        store.schema_status()
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    pub fn get_user(&self, user_id: &UserId) -> Result<UserRecord> {
        self.open_store()?
            .get_user(user_id)?
            .ok_or_else(|| ProgressError::UserNotFound(user_id.to_string()).into())
    }

    /// Read-only delta preview. Fails open, including when the database
    /// cannot be opened at all.
    #[must_use]
    pub fn score_delta(&self, user_id: &UserId, level: u32, score: u32) -> ScoreDelta {
        match self.open_store() {
            Ok(store) => store.score_delta_for(user_id, level, score),
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    level,
                    error = format!("{err:#}"),
                    "progress store unavailable; scoring as first play"
                );
                ScoreDelta::first_play(score)
            }
        }
    }

    pub fn update_game_data(
        &self,
        user_id: &UserId,
        update: &GameDataUpdate,
    ) -> Result<UserRecord> {
        let mut store = self.open_store().context(SaveGameDataFailed)?;
        store.update_user_game_data(user_id, update)
    }

    pub fn record_level_score(
        &self,
        user_id: &UserId,
        level: u32,
        score: u32,
        played_at: OffsetDateTime,
    ) -> Result<ScoreDelta> {
        let mut store = self.open_store().context(SaveGameDataFailed)?;
        store.record_level_score(user_id, level, score, played_at)
    }

    /// Best-effort append. Write failures are logged and reported as
    /// `logged: false`; they never reach the player.
    #[must_use]
    pub fn log_session(&self, input: GameSessionInput) -> SessionLogOutcome {
        let user_id = input.user_id.clone();
        match self
            .open_store()
            .and_then(|store| store.save_game_session(input))
        {
            Ok(session) => SessionLogOutcome {
                logged: true,
                session_id: Some(session.session_id),
            },
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = format!("{err:#}"),
                    "failed to log game session"
                );
                SessionLogOutcome {
                    logged: false,
                    session_id: None,
                }
            }
        }
    }

    /// Records the level result atomically, then logs the session best-effort.
    pub fn complete_game(&self, input: GameSessionInput) -> Result<GameCompletion> {
        input.validate().context("session validation failed")?;

        let delta =
            self.record_level_score(&input.user_id, input.level, input.score, input.end_time)?;
        let outcome = self.log_session(input);

        Ok(GameCompletion {
            delta,
            session_logged: outcome.logged,
            session_id: outcome.session_id,
        })
    }

    pub fn migrate_streaks(&self, dry_run: bool) -> Result<StreakMigrationReport> {
        self.open_store()?.migrate_streaks(dry_run)
    }
}
