#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use mathquest_progress_core::{
    apply_level_result, format_rfc3339, migrated_play_streak, now_utc, parse_rfc3339_utc,
    resolve_score_delta, GameDataUpdate, GameSession, GameSessionInput, LevelScore,
    ProgressError, ScoreDelta, StreakMigrationReport, UserDocument, UserId, UserRecord,
};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Message surfaced to players when cumulative progress cannot be persisted.
pub const SAVE_GAME_DATA_FAILED: &str = "unable to save game data";

/// Outermost context of a failed player-facing write. Callers find it with
/// `anyhow::Error::downcast_ref` instead of matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveGameDataFailed;

impl std::fmt::Display for SaveGameDataFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(SAVE_GAME_DATA_FAILED)
    }
}

const PROGRESS_SCHEMA_VERSION: i64 = 1;

const SCHEMA_PROGRESS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  total_score INTEGER NOT NULL DEFAULT 0 CHECK (total_score >= 0),
  experience INTEGER NOT NULL DEFAULT 0 CHECK (experience >= 0),
  level INTEGER NOT NULL DEFAULT 1 CHECK (level >= 0),
  last_played_at TEXT,
  daily_streak_json TEXT,
  play_streak_json TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS level_scores (
  user_id TEXT NOT NULL,
  level INTEGER NOT NULL CHECK (level >= 0),
  high_score INTEGER NOT NULL CHECK (high_score >= 0),
  plays INTEGER NOT NULL DEFAULT 0 CHECK (plays >= 0),
  last_score INTEGER NOT NULL DEFAULT 0 CHECK (last_score >= 0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, level),
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TRIGGER IF NOT EXISTS trg_level_scores_high_score_monotonic
BEFORE UPDATE OF high_score ON level_scores
WHEN typeof(OLD.high_score) = 'integer' AND NEW.high_score < OLD.high_score
BEGIN
  SELECT RAISE(ABORT, 'level_scores.high_score MUST NOT decrease');
END;

CREATE TABLE IF NOT EXISTS game_sessions (
  session_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  grade INTEGER NOT NULL CHECK (grade >= 0),
  level INTEGER NOT NULL CHECK (level >= 0),
  score INTEGER NOT NULL CHECK (score >= 0),
  total_questions INTEGER NOT NULL CHECK (total_questions >= 0),
  percentage INTEGER NOT NULL CHECK (percentage BETWEEN 0 AND 100),
  start_time TEXT NOT NULL,
  end_time TEXT NOT NULL,
  duration INTEGER NOT NULL CHECK (duration >= 0),
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_game_sessions_no_update
BEFORE UPDATE ON game_sessions
BEGIN
  SELECT RAISE(FAIL, 'game_sessions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_game_sessions_no_delete
BEFORE DELETE ON game_sessions
BEGIN
  SELECT RAISE(FAIL, 'game_sessions is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_game_sessions_user_seq
  ON game_sessions(user_id, session_seq);
";

const SELECT_USER: &str = "SELECT
    user_id, total_score, experience, level, last_played_at,
    daily_streak_json, play_streak_json, created_at, updated_at
 FROM users
 WHERE user_id = ?1";

const SELECT_SESSION_COLUMNS: &str = "SELECT
    session_id, user_id, grade, level, score, total_questions,
    percentage, start_time, end_time, duration, created_at
 FROM game_sessions";

pub struct SqliteProgressStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

impl SqliteProgressStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PROGRESS_V1)
            .context("failed to apply progress schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROGRESS_SCHEMA_VERSION, now],
            )
            .context("failed to register progress schema migration")?;

        tracing::debug!(version = PROGRESS_SCHEMA_VERSION, "progress schema applied");
        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to read schema version")?
        } else {
            0
        };

        let pending_versions = ((current_version + 1)..=PROGRESS_SCHEMA_VERSION).collect();

        Ok(SchemaStatus {
            current_version,
            target_version: PROGRESS_SCHEMA_VERSION,
            pending_versions,
        })
    }

    pub fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        load_user(&self.conn, user_id)
    }

    /// Computes the high-score delta from the stored snapshot.
    ///
    /// Never fails: when the lookup errors the score counts as a first play
    /// and the failure is logged.
    #[must_use]
    pub fn score_delta_for(&self, user_id: &UserId, level: u32, new_score: u32) -> ScoreDelta {
        let lookup = self.get_user(user_id);
        let (delta, lookup_error) =
            resolve_score_delta(lookup.as_ref().map(Option::as_ref), level, new_score);

        if let Some(err) = lookup_error {
            tracing::warn!(
                user_id = %user_id,
                level,
                error = format!("{err:#}"),
                "user lookup failed; scoring as first play"
            );
        }

        delta
    }

    /// Merges cumulative game data into the user's record, creating it if needed.
    pub fn update_user_game_data(
        &mut self,
        user_id: &UserId,
        update: &GameDataUpdate,
    ) -> Result<UserRecord> {
        self.merge_game_data(user_id, update)
            .context(SaveGameDataFailed)
    }

    /// Records one finished level inside a single write transaction, so the
    /// high-score comparison and the write cannot interleave with another
    /// writer.
    pub fn record_level_score(
        &mut self,
        user_id: &UserId,
        level: u32,
        new_score: u32,
        played_at: OffsetDateTime,
    ) -> Result<ScoreDelta> {
        self.apply_level_score(user_id, level, new_score, played_at)
            .context(SaveGameDataFailed)
    }

    /// Appends an immutable session with a server-assigned id and timestamp.
    pub fn save_game_session(&self, input: GameSessionInput) -> Result<GameSession> {
        let session = input
            .into_session(Ulid::new(), now_utc())
            .context("session validation failed")?;

        self.conn
            .execute(
                "INSERT INTO game_sessions(
                    session_id, user_id, grade, level, score, total_questions,
                    percentage, start_time, end_time, duration, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    session.session_id.to_string(),
                    session.user_id.as_str(),
                    i64::from(session.grade),
                    i64::from(session.level),
                    i64::from(session.score),
                    i64::from(session.total_questions),
                    i64::from(session.percentage),
                    sql_timestamp(session.start_time)?,
                    sql_timestamp(session.end_time)?,
                    i64::try_from(session.duration).context("duration exceeds storage range")?,
                    sql_timestamp(session.created_at)?,
                ],
            )
            .context("failed to append game session")?;

        Ok(session)
    }

    /// Lists a user's sessions, most recent first.
    pub fn list_sessions_for_user(
        &self,
        user_id: &UserId,
        limit: Option<usize>,
    ) -> Result<Vec<GameSession>> {
        let mut query = format!(
            "{SELECT_SESSION_COLUMNS}
             WHERE user_id = ?1
             ORDER BY session_seq DESC"
        );

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id.as_str()], parse_session_row)?;
        collect_rows(rows)
    }

    /// Copies legacy `dailyStreak` values into `playStreak` where it is unset.
    ///
    /// Users are visited one at a time. Re-running after a complete pass
    /// migrates nothing.
    pub fn migrate_streaks(&self, dry_run: bool) -> Result<StreakMigrationReport> {
        let candidates = {
            let mut stmt = self.conn.prepare(
                "SELECT user_id, daily_streak_json, play_streak_json
                 FROM users
                 ORDER BY user_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            collect_rows(rows)?
        };

        let total = candidates.len();
        let mut migrated = 0_usize;

        for (user_id, daily_streak_json, play_streak_json) in candidates {
            let daily_streak = daily_streak_json
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .with_context(|| format!("invalid stored dailyStreak for user {user_id}"))?;
            let play_streak = play_streak_json
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .with_context(|| format!("invalid stored playStreak for user {user_id}"))?;

            let Some(streak) = migrated_play_streak(daily_streak.as_ref(), play_streak.as_ref())
            else {
                continue;
            };

            if dry_run {
                migrated += 1;
                continue;
            }

            let now = sql_timestamp(now_utc())?;
            let changed = self
                .conn
                .execute(
                    "UPDATE users
                     SET play_streak_json = ?1, updated_at = ?2
                     WHERE user_id = ?3 AND play_streak_json IS NULL",
                    params![streak.to_string(), now, user_id],
                )
                .with_context(|| format!("failed to migrate streak for user {user_id}"))?;
            migrated += changed;

            tracing::debug!(user_id, play_streak = streak, "migrated legacy streak");
        }

        tracing::info!(migrated, total, dry_run, "streak migration finished");

        Ok(StreakMigrationReport {
            migrated,
            total,
            dry_run,
        })
    }

    /// Inserts exported user documents, skipping ids that already exist.
    pub fn import_user_documents(&mut self, documents: Vec<UserDocument>) -> Result<ImportReport> {
        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;

        let mut imported = 0_usize;
        let mut skipped = 0_usize;
        for document in documents {
            if load_user(&tx, &document.user_id)?.is_some() {
                skipped += 1;
                continue;
            }
            write_user(&tx, &document.into_record(now))?;
            imported += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        tracing::info!(imported, skipped, "imported user documents");

        Ok(ImportReport { imported, skipped })
    }

    fn merge_game_data(&mut self, user_id: &UserId, update: &GameDataUpdate) -> Result<UserRecord> {
        update.validate().context("game data validation failed")?;

        let now = now_utc();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start game data transaction")?;

        let mut record =
            load_user(&tx, user_id)?.unwrap_or_else(|| UserRecord::new(user_id.clone(), now));
        update.apply_to(&mut record, now);
        write_user(&tx, &record)?;

        tx.commit().context("failed to commit game data transaction")?;
        Ok(record)
    }

    fn apply_level_score(
        &mut self,
        user_id: &UserId,
        level: u32,
        new_score: u32,
        played_at: OffsetDateTime,
    ) -> Result<ScoreDelta> {
        if played_at.offset() != time::UtcOffset::UTC {
            return Err(anyhow::Error::new(ProgressError::Validation(
                "playedAt MUST be UTC".to_string(),
            ))
            .context("level score validation failed"));
        }

        let now = now_utc();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start level score transaction")?;

        let mut record =
            load_user(&tx, user_id)?.unwrap_or_else(|| UserRecord::new(user_id.clone(), now));
        let delta = apply_level_result(&mut record, level, new_score, played_at, now);
        write_user(&tx, &record)?;

        tx.commit().context("failed to commit level score transaction")?;
        Ok(delta)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn load_user(conn: &Connection, user_id: &UserId) -> Result<Option<UserRecord>> {
    let row = conn
        .query_row(SELECT_USER, params![user_id.as_str()], parse_user_row)
        .optional()
        .with_context(|| format!("failed to load user record {user_id}"))?;

    let Some(mut record) = row else {
        return Ok(None);
    };
    record.level_scores = load_level_scores(conn, user_id)?;
    Ok(Some(record))
}

fn load_level_scores(conn: &Connection, user_id: &UserId) -> Result<BTreeMap<u32, LevelScore>> {
    let mut stmt = conn.prepare(
        "SELECT level, high_score, plays, last_score, updated_at
         FROM level_scores
         WHERE user_id = ?1
         ORDER BY level ASC",
    )?;

    let rows = stmt.query_map(params![user_id.as_str()], |row| {
        let level = to_u32(0, row.get(0)?)?;
        Ok((
            level,
            LevelScore {
                high_score: lenient_score(row, 1)?,
                plays: to_u32(2, row.get(2)?)?,
                last_score: to_u32(3, row.get(3)?)?,
                updated_at: parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?,
            },
        ))
    })?;

    Ok(collect_rows(rows)?.into_iter().collect())
}

fn write_user(conn: &Connection, record: &UserRecord) -> Result<()> {
    let daily_streak_json = record
        .daily_streak
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize dailyStreak")?;
    let play_streak_json = record
        .play_streak
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize playStreak")?;

    conn.execute(
        "INSERT INTO users(
            user_id, total_score, experience, level, last_played_at,
            daily_streak_json, play_streak_json, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(user_id) DO UPDATE SET
           total_score = excluded.total_score,
           experience = excluded.experience,
           level = excluded.level,
           last_played_at = excluded.last_played_at,
           daily_streak_json = excluded.daily_streak_json,
           play_streak_json = excluded.play_streak_json,
           updated_at = excluded.updated_at",
        params![
            record.user_id.as_str(),
            i64::try_from(record.total_score).context("total_score exceeds storage range")?,
            i64::try_from(record.experience).context("experience exceeds storage range")?,
            i64::from(record.level),
            record.last_played_at.map(sql_timestamp).transpose()?,
            daily_streak_json,
            play_streak_json,
            sql_timestamp(record.created_at)?,
            sql_timestamp(record.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to write user record {}", record.user_id))?;

    for (level, entry) in &record.level_scores {
        conn.execute(
            "INSERT INTO level_scores(user_id, level, high_score, plays, last_score, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, level) DO UPDATE SET
               high_score = CASE
                 WHEN typeof(level_scores.high_score) = 'integer'
                      AND level_scores.high_score > excluded.high_score
                 THEN level_scores.high_score
                 ELSE excluded.high_score
               END,
               plays = excluded.plays,
               last_score = excluded.last_score,
               updated_at = excluded.updated_at",
            params![
                record.user_id.as_str(),
                i64::from(*level),
                i64::from(entry.high_score),
                i64::from(entry.plays),
                i64::from(entry.last_score),
                sql_timestamp(entry.updated_at)?,
            ],
        )
        .with_context(|| {
            format!(
                "failed to write level {level} score for user {}",
                record.user_id
            )
        })?;
    }

    Ok(())
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let user_id_raw: String = row.get(0)?;
    let last_played_at: Option<String> = row.get(4)?;
    let daily_streak_json: Option<String> = row.get(5)?;
    let play_streak_json: Option<String> = row.get(6)?;

    let daily_streak = daily_streak_json
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Value>(raw).map_err(|err| {
                invalid_data(5, Type::Text, format!("invalid daily_streak_json: {err}"))
            })
        })
        .transpose()?;
    let play_streak = play_streak_json
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Value>(raw).map_err(|err| {
                invalid_data(6, Type::Text, format!("invalid play_streak_json: {err}"))
            })
        })
        .transpose()?;

    Ok(UserRecord {
        user_id: UserId::parse(&user_id_raw).map_err(to_sql_error)?,
        total_score: to_u64(1, row.get(1)?)?,
        experience: to_u64(2, row.get(2)?)?,
        level: to_u32(3, row.get(3)?)?,
        last_played_at: last_played_at
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .map_err(to_sql_error)?,
        level_scores: BTreeMap::new(),
        daily_streak,
        play_streak,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?,
    })
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameSession> {
    let session_id_raw: String = row.get(0)?;
    let user_id_raw: String = row.get(1)?;
    let grade_raw: i64 = row.get(2)?;

    let session_id = Ulid::from_string(&session_id_raw).map_err(|_| {
        invalid_data(0, Type::Text, format!("invalid ULID: {session_id_raw}"))
    })?;
    let grade = u8::try_from(grade_raw)
        .map_err(|_| invalid_data(2, Type::Integer, format!("invalid grade: {grade_raw}")))?;

    Ok(GameSession {
        session_id,
        user_id: UserId::parse(&user_id_raw).map_err(to_sql_error)?,
        grade,
        level: to_u32(3, row.get(3)?)?,
        score: to_u32(4, row.get(4)?)?,
        total_questions: to_u32(5, row.get(5)?)?,
        percentage: to_u32(6, row.get(6)?)?,
        start_time: parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?,
        end_time: parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?,
        duration: to_u64(9, row.get(9)?)?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(10)?).map_err(to_sql_error)?,
    })
}

/// Reads a stored high score, treating anything that is not a non-negative
/// integer in range as 0.
fn lenient_score(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u32> {
    Ok(match row.get_ref(index)? {
        ValueRef::Integer(raw) => u32::try_from(raw).unwrap_or(0),
        _ => 0,
    })
}

fn to_u32(index: usize, raw: i64) -> rusqlite::Result<u32> {
    u32::try_from(raw)
        .map_err(|_| invalid_data(index, Type::Integer, format!("value out of range: {raw}")))
}

fn to_u64(index: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw)
        .map_err(|_| invalid_data(index, Type::Integer, format!("value out of range: {raw}")))
}

fn invalid_data(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(err: ProgressError) -> rusqlite::Error {
    invalid_data(0, Type::Text, err.to_string())
}

fn sql_timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
