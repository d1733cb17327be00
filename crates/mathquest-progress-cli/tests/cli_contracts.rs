#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::{params, Connection};
use serde_json::Value;
use ulid::Ulid;

fn mq_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mq"))
}

fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("mathquest-cli-{}.sqlite3", Ulid::new()))
}

fn mq_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(mq_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run mq command {:?}: {err}", args),
    }
}

fn mq_json(db_path: &Path, args: &[&str]) -> Value {
    let output = mq_output(db_path, args);
    assert!(
        output.status.success(),
        "mq {:?} failed: stderr={}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn open_connection(db_path: &Path) -> Connection {
    match Connection::open(db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open fixture database: {err}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(mq_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["db", "user", "score", "session", "streak"] {
        assert!(
            stdout.contains(required),
            "help output missing {required}: {stdout}"
        );
    }
}

#[test]
fn db_migrate_reports_current_schema() {
    let db_path = unique_temp_db_path();

    let status = mq_json(&db_path, &["db", "migrate"]);
    assert_eq!(status["currentVersion"], status["targetVersion"]);
    assert_eq!(status["pendingVersions"], serde_json::json!([]));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn score_flow_reports_deltas_and_accumulates_total() {
    let db_path = unique_temp_db_path();

    let first = mq_json(
        &db_path,
        &[
            "score", "submit", "--user-id", "player-1", "--level", "3", "--score", "80",
        ],
    );
    assert_eq!(first["scoreDiff"], 80);
    assert_eq!(first["isNewHighScore"], true);

    let preview = mq_json(
        &db_path,
        &["score", "delta", "--user-id", "player-1", "--level", "3", "--score", "95"],
    );
    assert_eq!(preview["scoreDiff"], 15);
    assert_eq!(preview["oldHighScore"], 80);

    let lower = mq_json(
        &db_path,
        &["score", "submit", "--user-id", "player-1", "--level", "3", "--score", "50"],
    );
    assert_eq!(lower["scoreDiff"], 0);
    assert_eq!(lower["isNewHighScore"], false);

    let user = mq_json(&db_path, &["user", "show", "--user-id", "player-1"]);
    assert_eq!(user["totalScore"], 80);
    assert_eq!(user["levelScores"]["3"]["highScore"], 80);
    assert_eq!(user["levelScores"]["3"]["plays"], 2);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn session_log_derives_fields_and_lists_newest_first() {
    let db_path = unique_temp_db_path();
    let base = [
        "session",
        "log",
        "--user-id",
        "player-1",
        "--grade",
        "2",
        "--level",
        "1",
        "--total-questions",
        "3",
        "--start-time",
        "2026-02-07T12:00:00Z",
        "--end-time",
        "2026-02-07T12:00:45Z",
    ];

    let mut first_args = base.to_vec();
    first_args.extend(["--score", "2"]);
    let first = mq_json(&db_path, &first_args);
    assert_eq!(first["percentage"], 67);
    assert_eq!(first["duration"], 45);

    let mut second_args = base.to_vec();
    second_args.extend(["--score", "3"]);
    let second = mq_json(&db_path, &second_args);

    let listed = mq_json(&db_path, &["session", "list", "--user-id", "player-1"]);
    let sessions = match listed.as_array() {
        Some(values) => values,
        None => panic!("session list must be an array: {listed}"),
    };
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["sessionId"], second["sessionId"]);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn invalid_session_exits_non_zero() {
    let db_path = unique_temp_db_path();
    let output = mq_output(
        &db_path,
        &[
            "session",
            "log",
            "--user-id",
            "player-1",
            "--grade",
            "2",
            "--level",
            "1",
            "--score",
            "1",
            "--total-questions",
            "3",
            "--start-time",
            "2026-02-07T12:00:00Z",
            "--end-time",
            "2026-02-07T11:00:00Z",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("session validation failed"));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn streak_migration_is_idempotent_across_runs() {
    let db_path = unique_temp_db_path();
    let import_path = std::env::temp_dir().join(format!("mathquest-import-{}.json", Ulid::new()));
    let documents = serde_json::json!([
        { "userId": "legacy-a", "dailyStreak": 4 },
        { "userId": "legacy-b", "dailyStreak": "" },
        { "userId": "modern-c", "dailyStreak": 9, "playStreak": 2 },
        { "userId": "fresh-d" }
    ]);
    if let Err(err) = std::fs::write(&import_path, documents.to_string()) {
        panic!("failed to write import fixture: {err}");
    }

    let import_arg = import_path.to_string_lossy().into_owned();
    let imported = mq_json(&db_path, &["user", "import", "--file", import_arg.as_str()]);
    assert_eq!(imported["imported"], 4);

    let dry_run = mq_json(&db_path, &["streak", "migrate", "--dry-run"]);
    assert_eq!(dry_run["migrated"], 2);
    assert_eq!(dry_run["dryRun"], true);

    let first = mq_json(&db_path, &["streak", "migrate"]);
    assert_eq!(first["migrated"], 2);
    assert_eq!(first["total"], 4);

    let second = mq_json(&db_path, &["streak", "migrate"]);
    assert_eq!(second["migrated"], 0);

    let conn = open_connection(&db_path);
    let streaks: Vec<(String, Option<String>)> = {
        let mut stmt = match conn.prepare(
            "SELECT user_id, play_streak_json FROM users WHERE user_id IN (?1, ?2) ORDER BY user_id",
        ) {
            Ok(stmt) => stmt,
            Err(err) => panic!("failed to prepare streak query: {err}"),
        };
        let rows = match stmt.query_map(params!["legacy-a", "legacy-b"], |row| {
            Ok((row.get(0)?, row.get(1)?))
        }) {
            Ok(rows) => rows,
            Err(err) => panic!("failed to query streaks: {err}"),
        };
        rows.map(|row| match row {
            Ok(value) => value,
            Err(err) => panic!("failed to read streak row: {err}"),
        })
        .collect()
    };
    assert_eq!(
        streaks,
        vec![
            ("legacy-a".to_string(), Some("4".to_string())),
            ("legacy-b".to_string(), Some("0".to_string())),
        ]
    );

    let _ = std::fs::remove_file(&import_path);
    let _ = std::fs::remove_file(&db_path);
}
