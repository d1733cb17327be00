//! Progress model for `MathQuest` players.
//!
//! Everything in this crate is a pure computation over snapshots that the
//! caller has already fetched: per-level high-score reconciliation, merging of
//! cumulative game data, session normalization and the legacy streak rename.
//! Persistence lives in `mathquest-progress-store-sqlite`.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const MAX_USER_ID_LEN: usize = 128;
pub const DEFAULT_PLAYER_LEVEL: u32 = 1;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
}

/// Opaque account identifier, used as the primary key of a user record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parses a user id.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when the id is blank, too long,
    /// or contains a path separator or control character.
    pub fn parse(raw: &str) -> Result<Self, ProgressError> {
        if raw.trim().is_empty() {
            return Err(ProgressError::Validation(
                "user_id MUST be provided".to_string(),
            ));
        }

        if raw.len() > MAX_USER_ID_LEN {
            return Err(ProgressError::Validation(format!(
                "user_id MUST be at most {MAX_USER_ID_LEN} bytes"
            )));
        }

        if raw.chars().any(|ch| ch == '/' || ch.is_control()) {
            return Err(ProgressError::Validation(
                "user_id MUST NOT contain '/' or control characters".to_string(),
            ));
        }

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = ProgressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LevelScore {
    pub high_score: u32,
    pub plays: u32,
    pub last_score: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: UserId,
    pub total_score: u64,
    pub experience: u64,
    pub level: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_played_at: Option<OffsetDateTime>,
    pub level_scores: BTreeMap<u32, LevelScore>,
    /// Raw value of the retired `dailyStreak` field, kept as it was imported.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub daily_streak: Option<Value>,
    /// Raw `playStreak`. `Some(Value::Null)` is a field that exists with a
    /// null value, which the streak migration leaves alone.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub play_streak: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UserRecord {
    #[must_use]
    pub fn new(user_id: UserId, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            total_score: 0,
            experience: 0,
            level: DEFAULT_PLAYER_LEVEL,
            last_played_at: None,
            level_scores: BTreeMap::new(),
            daily_streak: None,
            play_streak: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn high_score(&self, level: u32) -> Option<u32> {
        self.level_scores.get(&level).map(|entry| entry.high_score)
    }
}

/// A user document as exported from the previous document store.
///
/// Every field except `userId` may be missing. `dailyStreak: null` counts as
/// present, which matters to the streak migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserDocument {
    pub user_id: UserId,
    #[serde(default)]
    pub total_score: Option<u64>,
    #[serde(default)]
    pub experience: Option<u64>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_played_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub level_scores: BTreeMap<u32, LevelScoreUpdate>,
    #[serde(default, deserialize_with = "present_value")]
    pub daily_streak: Option<Value>,
    #[serde(default, deserialize_with = "present_value")]
    pub play_streak: Option<Value>,
}

impl UserDocument {
    #[must_use]
    pub fn into_record(self, now: OffsetDateTime) -> UserRecord {
        let mut record = UserRecord::new(self.user_id, now);
        record.total_score = self.total_score.unwrap_or_default();
        record.experience = self.experience.unwrap_or_default();
        record.level = self.level.unwrap_or(DEFAULT_PLAYER_LEVEL);
        record.last_played_at = self.last_played_at;
        record.level_scores = self
            .level_scores
            .into_iter()
            .map(|(level, entry)| {
                (
                    level,
                    LevelScore {
                        high_score: entry.high_score,
                        plays: 0,
                        last_score: entry.high_score,
                        updated_at: now,
                    },
                )
            })
            .collect();
        record.daily_streak = self.daily_streak;
        record.play_streak = self.play_streak;
        record
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDelta {
    pub score_diff: u32,
    pub is_new_high_score: bool,
    pub old_high_score: u32,
}

impl ScoreDelta {
    #[must_use]
    pub fn first_play(new_score: u32) -> Self {
        Self {
            score_diff: new_score,
            is_new_high_score: true,
            old_high_score: 0,
        }
    }
}

/// Reconciles a fresh score against the stored personal best for `level`.
///
/// A missing user record and a missing level entry are both treated as the
/// first play of that level, so the whole score counts toward the total.
#[must_use]
pub fn compute_score_delta(user: Option<&UserRecord>, level: u32, new_score: u32) -> ScoreDelta {
    let Some(old_high_score) = user.and_then(|record| record.high_score(level)) else {
        return ScoreDelta::first_play(new_score);
    };

    if new_score > old_high_score {
        ScoreDelta {
            score_diff: new_score - old_high_score,
            is_new_high_score: true,
            old_high_score,
        }
    } else {
        ScoreDelta {
            score_diff: 0,
            is_new_high_score: false,
            old_high_score,
        }
    }
}

/// Fail-open variant of [`compute_score_delta`] for callers whose lookup may
/// have errored. A failed lookup yields the first-play delta and hands the
/// error back so the caller can report it.
#[must_use]
pub fn resolve_score_delta<E>(
    lookup: Result<Option<&UserRecord>, E>,
    level: u32,
    new_score: u32,
) -> (ScoreDelta, Option<E>) {
    match lookup {
        Ok(user) => (compute_score_delta(user, level, new_score), None),
        Err(err) => (ScoreDelta::first_play(new_score), Some(err)),
    }
}

/// Applies one finished level to a user snapshot and returns the delta used.
///
/// The level entry gains a play, `highScore` only moves up, and the
/// cumulative total grows by exactly `score_diff`.
pub fn apply_level_result(
    record: &mut UserRecord,
    level: u32,
    new_score: u32,
    played_at: OffsetDateTime,
    now: OffsetDateTime,
) -> ScoreDelta {
    let delta = compute_score_delta(Some(record), level, new_score);

    let entry = record.level_scores.entry(level).or_insert(LevelScore {
        high_score: 0,
        plays: 0,
        last_score: 0,
        updated_at: now,
    });
    entry.plays = entry.plays.saturating_add(1);
    entry.last_score = new_score;
    if delta.is_new_high_score {
        entry.high_score = new_score;
    }
    entry.updated_at = now;

    record.total_score = record
        .total_score
        .saturating_add(u64::from(delta.score_diff));
    record.last_played_at = Some(played_at);
    record.updated_at = now;

    delta
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LevelScoreUpdate {
    pub high_score: u32,
}

/// Partial update of a user's cumulative fields. `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameDataUpdate {
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub total_score: Option<u64>,
    #[serde(default)]
    pub experience: Option<u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_played_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub level_scores: Option<BTreeMap<u32, LevelScoreUpdate>>,
}

impl GameDataUpdate {
    /// Validates an update before it is merged.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when a timestamp is not UTC.
    pub fn validate(&self) -> Result<(), ProgressError> {
        if let Some(last_played_at) = self.last_played_at {
            require_utc("lastPlayedAt", last_played_at)?;
        }
        Ok(())
    }

    /// Merges the update into `record` and stamps `updated_at`.
    ///
    /// Incoming level entries can raise a stored `highScore` but never lower it.
    pub fn apply_to(&self, record: &mut UserRecord, now: OffsetDateTime) {
        if let Some(level) = self.level {
            record.level = level;
        }
        if let Some(total_score) = self.total_score {
            record.total_score = total_score;
        }
        if let Some(experience) = self.experience {
            record.experience = experience;
        }
        if let Some(last_played_at) = self.last_played_at {
            record.last_played_at = Some(last_played_at);
        }
        if let Some(level_scores) = &self.level_scores {
            for (level, update) in level_scores {
                let entry = record.level_scores.entry(*level).or_insert(LevelScore {
                    high_score: 0,
                    plays: 0,
                    last_score: 0,
                    updated_at: now,
                });
                if update.high_score > entry.high_score {
                    entry.high_score = update.high_score;
                    entry.updated_at = now;
                }
            }
        }
        record.updated_at = now;
    }
}

/// Session payload as submitted by the game client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSessionInput {
    pub user_id: UserId,
    pub grade: u8,
    pub level: u32,
    pub score: u32,
    pub total_questions: u32,
    #[serde(default)]
    pub percentage: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    pub session_id: Ulid,
    pub user_id: UserId,
    pub grade: u8,
    pub level: u32,
    pub score: u32,
    pub total_questions: u32,
    pub percentage: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub duration: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl GameSessionInput {
    /// Validates a session payload before append.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when timestamps are not UTC, the
    /// session ends before it starts, or `percentage` exceeds 100.
    pub fn validate(&self) -> Result<(), ProgressError> {
        require_utc("startTime", self.start_time)?;
        require_utc("endTime", self.end_time)?;

        if self.end_time < self.start_time {
            return Err(ProgressError::Validation(
                "endTime MUST NOT be before startTime".to_string(),
            ));
        }

        if let Some(percentage) = self.percentage {
            if percentage > 100 {
                return Err(ProgressError::Validation(
                    "percentage MUST be in [0, 100]".to_string(),
                ));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn derived_percentage(&self) -> u32 {
        if let Some(percentage) = self.percentage {
            return percentage;
        }
        if self.total_questions == 0 {
            return 0;
        }

        let scaled = u64::from(self.score) * 100;
        let total = u64::from(self.total_questions);
        let rounded = (scaled + total / 2) / total;
        u32::try_from(rounded.min(100)).unwrap_or(100)
    }

    #[must_use]
    pub fn derived_duration(&self) -> u64 {
        if let Some(duration) = self.duration {
            return duration;
        }
        let elapsed = (self.end_time - self.start_time).whole_seconds();
        u64::try_from(elapsed).unwrap_or(0)
    }

    /// Freezes the input into an immutable session with server-assigned fields.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when [`Self::validate`] fails.
    pub fn into_session(
        self,
        session_id: Ulid,
        created_at: OffsetDateTime,
    ) -> Result<GameSession, ProgressError> {
        self.validate()?;
        let percentage = self.derived_percentage();
        let duration = self.derived_duration();

        Ok(GameSession {
            session_id,
            user_id: self.user_id,
            grade: self.grade,
            level: self.level,
            score: self.score,
            total_questions: self.total_questions,
            percentage,
            start_time: self.start_time,
            end_time: self.end_time,
            duration,
            created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreakMigrationReport {
    pub migrated: usize,
    pub total: usize,
    pub dry_run: bool,
}

/// Coerces a legacy `dailyStreak` value into a streak count.
///
/// Falsy values (`0`, `null`, `false`, `""`) and anything non-numeric become 0.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn legacy_streak_value(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|raw| raw.trunc() as i64))
            .unwrap_or(0),
        Value::Bool(true) => 1,
        Value::String(raw) => raw.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

/// Returns the `playStreak` to write for a user, or `None` when the user is
/// left alone: either no legacy field exists or `playStreak` is present,
/// even as `null`.
#[must_use]
pub fn migrated_play_streak(
    daily_streak: Option<&Value>,
    play_streak: Option<&Value>,
) -> Option<i64> {
    if play_streak.is_some() {
        return None;
    }
    daily_streak.map(legacy_streak_value)
}

fn require_utc(field: &str, value: OffsetDateTime) -> Result<(), ProgressError> {
    if value.offset() != UtcOffset::UTC {
        return Err(ProgressError::Validation(format!(
            "{field} MUST be UTC (offset Z)"
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProgressError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    require_utc("timestamp", parsed)?;
    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProgressError::Encoding`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProgressError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressError::Encoding(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_user() -> UserRecord {
        UserRecord::new(
            must_ok(UserId::parse("player-1")),
            must_utc("2026-02-07T12:00:00Z"),
        )
    }

    fn fixture_user_with_high_score(level: u32, high_score: u32) -> UserRecord {
        let mut user = fixture_user();
        user.level_scores.insert(
            level,
            LevelScore {
                high_score,
                plays: 1,
                last_score: high_score,
                updated_at: must_utc("2026-02-07T12:00:00Z"),
            },
        );
        user
    }

    fn fixture_session_input() -> GameSessionInput {
        GameSessionInput {
            user_id: must_ok(UserId::parse("player-1")),
            grade: 3,
            level: 2,
            score: 7,
            total_questions: 10,
            percentage: None,
            start_time: must_utc("2026-02-07T12:00:00Z"),
            end_time: must_utc("2026-02-07T12:02:30Z"),
            duration: None,
        }
    }

    #[test]
    fn new_high_score_reports_difference_over_previous_best() {
        let user = fixture_user_with_high_score(3, 80);
        let delta = compute_score_delta(Some(&user), 3, 95);
        assert_eq!(
            delta,
            ScoreDelta {
                score_diff: 15,
                is_new_high_score: true,
                old_high_score: 80,
            }
        );
    }

    #[test]
    fn lower_score_keeps_previous_best() {
        let user = fixture_user_with_high_score(3, 80);
        let delta = compute_score_delta(Some(&user), 3, 50);
        assert_eq!(
            delta,
            ScoreDelta {
                score_diff: 0,
                is_new_high_score: false,
                old_high_score: 80,
            }
        );
    }

    #[test]
    fn equal_score_is_not_a_new_high_score() {
        let user = fixture_user_with_high_score(3, 80);
        let delta = compute_score_delta(Some(&user), 3, 80);
        assert!(!delta.is_new_high_score);
        assert_eq!(delta.score_diff, 0);
    }

    #[test]
    fn missing_user_counts_as_first_play() {
        let delta = compute_score_delta(None, 9, 42);
        assert_eq!(delta, ScoreDelta::first_play(42));
    }

    #[test]
    fn zero_score_on_unplayed_level_is_still_a_new_high_score() {
        let user = fixture_user_with_high_score(3, 80);
        let delta = compute_score_delta(Some(&user), 4, 0);
        assert_eq!(delta, ScoreDelta::first_play(0));
    }

    #[test]
    fn failed_lookup_fails_open_and_returns_error() {
        let (delta, err) = resolve_score_delta::<&str>(Err("lookup failed"), 3, 30);
        assert_eq!(delta, ScoreDelta::first_play(30));
        assert_eq!(err, Some("lookup failed"));
    }

    #[test]
    fn apply_level_result_accumulates_total_by_diff_only() {
        let mut user = fixture_user();
        let now = must_utc("2026-02-07T13:00:00Z");

        let first = apply_level_result(&mut user, 1, 60, now, now);
        let second = apply_level_result(&mut user, 1, 40, now, now);
        let third = apply_level_result(&mut user, 1, 75, now, now);

        assert_eq!(first.score_diff, 60);
        assert_eq!(second.score_diff, 0);
        assert_eq!(third.score_diff, 15);
        assert_eq!(user.total_score, 75);
        assert_eq!(user.high_score(1), Some(75));
        let entry = user.level_scores.get(&1);
        assert_eq!(entry.map(|item| item.plays), Some(3));
        assert_eq!(entry.map(|item| item.last_score), Some(75));
        assert_eq!(user.last_played_at, Some(now));
    }

    #[test]
    fn game_data_merge_keeps_absent_fields() {
        let mut user = fixture_user();
        user.total_score = 120;
        user.experience = 30;
        let update = GameDataUpdate {
            experience: Some(45),
            ..GameDataUpdate::default()
        };

        let now = must_utc("2026-02-08T09:00:00Z");
        update.apply_to(&mut user, now);

        assert_eq!(user.total_score, 120);
        assert_eq!(user.experience, 45);
        assert_eq!(user.level, DEFAULT_PLAYER_LEVEL);
        assert_eq!(user.updated_at, now);
    }

    #[test]
    fn game_data_merge_never_lowers_high_score() {
        let mut user = fixture_user_with_high_score(2, 90);
        let mut level_scores = BTreeMap::new();
        level_scores.insert(2, LevelScoreUpdate { high_score: 40 });
        level_scores.insert(5, LevelScoreUpdate { high_score: 12 });
        let update = GameDataUpdate {
            level_scores: Some(level_scores),
            ..GameDataUpdate::default()
        };

        update.apply_to(&mut user, must_utc("2026-02-08T09:00:00Z"));

        assert_eq!(user.high_score(2), Some(90));
        assert_eq!(user.high_score(5), Some(12));
    }

    #[test]
    fn game_data_update_accepts_partial_camel_case_json() {
        let update: GameDataUpdate = must_ok(serde_json::from_value(json!({
            "totalScore": 300,
            "levelScores": { "3": { "highScore": 95 } }
        })));
        assert_eq!(update.total_score, Some(300));
        assert_eq!(update.level, None);
        let high_score = update
            .level_scores
            .as_ref()
            .and_then(|scores| scores.get(&3))
            .map(|entry| entry.high_score);
        assert_eq!(high_score, Some(95));
    }

    #[test]
    fn user_id_rejects_blank_and_path_like_values() {
        assert!(UserId::parse("   ").is_err());
        assert!(UserId::parse("users/abc").is_err());
        assert!(UserId::parse(&"x".repeat(MAX_USER_ID_LEN + 1)).is_err());
        assert!(UserId::parse("uid_7Fq2").is_ok());
    }

    #[test]
    fn user_id_deserialization_is_validated() {
        let parsed = serde_json::from_value::<UserId>(json!(""));
        assert!(parsed.is_err());
    }

    #[test]
    fn session_derives_percentage_and_duration() {
        let session = must_ok(
            fixture_session_input().into_session(Ulid::new(), must_utc("2026-02-07T12:03:00Z")),
        );
        assert_eq!(session.percentage, 70);
        assert_eq!(session.duration, 150);
    }

    #[test]
    fn session_percentage_rounds_and_handles_zero_questions() {
        let mut input = fixture_session_input();
        input.score = 2;
        input.total_questions = 3;
        assert_eq!(input.derived_percentage(), 67);

        input.total_questions = 0;
        assert_eq!(input.derived_percentage(), 0);
    }

    #[test]
    fn session_keeps_client_supplied_percentage_and_duration() {
        let mut input = fixture_session_input();
        input.percentage = Some(55);
        input.duration = Some(12);
        let session = must_ok(input.into_session(Ulid::new(), now_utc()));
        assert_eq!(session.percentage, 55);
        assert_eq!(session.duration, 12);
    }

    #[test]
    fn session_rejects_end_before_start() {
        let mut input = fixture_session_input();
        input.end_time = must_utc("2026-02-07T11:59:59Z");
        assert!(matches!(
            input.validate(),
            Err(ProgressError::Validation(message)) if message.contains("endTime")
        ));
    }

    #[test]
    fn session_rejects_percentage_over_hundred() {
        let mut input = fixture_session_input();
        input.percentage = Some(101);
        assert!(input.validate().is_err());
    }

    #[test]
    fn streak_copies_legacy_value_when_play_streak_absent() {
        assert_eq!(migrated_play_streak(Some(&json!(6)), None), Some(6));
    }

    #[test]
    fn streak_leaves_existing_play_streak_alone() {
        assert_eq!(migrated_play_streak(Some(&json!(6)), Some(&json!(2))), None);
        assert_eq!(migrated_play_streak(Some(&json!(6)), Some(&json!(0))), None);
        assert_eq!(migrated_play_streak(Some(&json!(6)), Some(&json!(2.5))), None);
    }

    #[test]
    fn streak_treats_null_play_streak_as_present() {
        assert_eq!(migrated_play_streak(Some(&json!(4)), Some(&Value::Null)), None);
    }

    #[test]
    fn streak_without_legacy_field_is_not_migrated() {
        assert_eq!(migrated_play_streak(None, None), None);
    }

    #[test]
    fn falsy_legacy_streak_values_migrate_as_zero() {
        for value in [json!(0), json!(null), json!(false), json!(""), json!({})] {
            assert_eq!(migrated_play_streak(Some(&value), None), Some(0), "{value}");
        }
    }

    #[test]
    fn numeric_like_legacy_streak_values_are_coerced() {
        assert_eq!(legacy_streak_value(&json!(4.8)), 4);
        assert_eq!(legacy_streak_value(&json!("9")), 9);
        assert_eq!(legacy_streak_value(&json!(true)), 1);
    }

    #[test]
    fn user_document_distinguishes_null_from_missing_daily_streak() {
        let with_null: UserDocument = must_ok(serde_json::from_value(json!({
            "userId": "legacy-1",
            "dailyStreak": null
        })));
        let missing: UserDocument = must_ok(serde_json::from_value(json!({
            "userId": "legacy-2"
        })));
        assert_eq!(with_null.daily_streak, Some(Value::Null));
        assert_eq!(missing.daily_streak, None);
    }

    #[test]
    fn user_document_keeps_null_and_fractional_play_streak() {
        let with_null: UserDocument = must_ok(serde_json::from_value(json!({
            "userId": "legacy-4",
            "dailyStreak": 4,
            "playStreak": null
        })));
        let fractional: UserDocument = must_ok(serde_json::from_value(json!({
            "userId": "legacy-5",
            "playStreak": 2.5
        })));
        assert_eq!(with_null.play_streak, Some(Value::Null));
        assert_eq!(fractional.play_streak, Some(json!(2.5)));

        let record = with_null.into_record(must_utc("2026-02-07T12:00:00Z"));
        assert_eq!(
            migrated_play_streak(record.daily_streak.as_ref(), record.play_streak.as_ref()),
            None
        );
    }

    #[test]
    fn user_document_fills_defaults() {
        let document: UserDocument = must_ok(serde_json::from_value(json!({
            "userId": "legacy-3",
            "totalScore": 410,
            "levelScores": { "1": { "highScore": 70 } },
            "dailyStreak": 4
        })));
        let record = document.into_record(must_utc("2026-02-07T12:00:00Z"));
        assert_eq!(record.total_score, 410);
        assert_eq!(record.level, DEFAULT_PLAYER_LEVEL);
        assert_eq!(record.high_score(1), Some(70));
        assert_eq!(record.daily_streak, Some(json!(4)));
        assert_eq!(record.play_streak, None);
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }

    proptest! {
        #[test]
        fn prop_higher_score_yields_exact_difference(old in 0u32..1_000_000, gain in 1u32..1_000_000) {
            let user = fixture_user_with_high_score(1, old);
            let delta = compute_score_delta(Some(&user), 1, old + gain);
            prop_assert!(delta.is_new_high_score);
            prop_assert_eq!(delta.score_diff, gain);
            prop_assert_eq!(delta.old_high_score, old);
        }

        #[test]
        fn prop_lower_or_equal_score_yields_zero(old in 0u32..1_000_000, drop in 0u32..1_000_000) {
            let user = fixture_user_with_high_score(1, old);
            let delta = compute_score_delta(Some(&user), 1, old.saturating_sub(drop));
            prop_assert!(!delta.is_new_high_score);
            prop_assert_eq!(delta.score_diff, 0);
        }

        #[test]
        fn prop_first_play_counts_whole_score(level in 0u32..500, score in any::<u32>()) {
            let user = fixture_user();
            prop_assert_eq!(compute_score_delta(Some(&user), level, score), ScoreDelta::first_play(score));
        }

        #[test]
        fn prop_high_score_is_monotonic(scores in prop::collection::vec(0u32..10_000, 1..60)) {
            let mut user = fixture_user();
            let now = must_utc("2026-02-07T12:00:00Z");
            let mut previous = 0_u32;
            for score in &scores {
                let _ = apply_level_result(&mut user, 1, *score, now, now);
                let current = user.high_score(1).unwrap_or(0);
                prop_assert!(current >= previous);
                previous = current;
            }
            let best = scores.iter().copied().max().unwrap_or(0);
            prop_assert_eq!(user.high_score(1), Some(best));
            prop_assert_eq!(user.total_score, u64::from(best));
        }
    }
}
