mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use mathquest_progress_core::{
    now_utc, GameDataUpdate, GameSessionInput, ProgressError, ScoreDelta, UserId, UserRecord,
};
use mathquest_progress_store_sqlite::{SaveGameDataFailed, SchemaStatus, SAVE_GAME_DATA_FAILED};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::api::{GameCompletion, ProgressApi, SessionLogOutcome};

const SERVICE_CONTRACT_VERSION: &str = "progress.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutPolicy {
    Abandon,
    AwaitCompletion,
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: ProgressApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    admin_secret: Option<Arc<str>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ScoreDeltaRequest {
    level: u32,
    score: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LevelScoreRequest {
    score: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    played_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
struct AdminMigrateQuery {
    secret: Option<String>,
    dry_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminMigrateResponse {
    success: bool,
    migrated: usize,
    total: usize,
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    admin_enabled: bool,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    slow_write_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    user_not_found_total: AtomicU64,
    save_failed_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    unauthorized_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    slow_write_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    user_not_found_total: u64,
    save_failed_total: u64,
    schema_unavailable_total: u64,
    unauthorized_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessChecks {
    current_schema_version: i64,
    target_schema_version: i64,
    pending_migrations: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Parser)]
#[command(name = "mathquest-progress-service")]
#[command(about = "HTTP service for MathQuest player progress")]
struct Args {
    #[arg(long, env = "MATHQUEST_DB", default_value = "./mathquest.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "MATHQUEST_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "MATHQUEST_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Shared secret for `/api/admin/*`. Admin calls are rejected when unset.
    #[arg(long, env = "MATHQUEST_ADMIN_SECRET", hide_env_values = true)]
    admin_secret: Option<String>,
    /// Serve without applying schema migrations first.
    #[arg(long)]
    skip_migrate: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_path_with_telemetry(&self, rejection: &PathRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
            None,
        )
    }

    fn validation_failure(&self, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
    }

    fn parse_user_id(&self, raw: &str) -> Result<UserId, ServiceFailure> {
        UserId::parse(raw).map_err(|err| self.validation_failure(format!("invalid user id: {err}")))
    }

    fn admin_authorized(&self, provided: Option<&str>) -> bool {
        match (self.admin_secret.as_deref(), provided) {
            (Some(expected), Some(provided)) => secrets_match(expected, provided),
            _ => false,
        }
    }

    /// Maps an operation error onto a failure using the typed errors carried
    /// in the chain. Message text is never searched because it can contain
    /// caller-supplied ids.
    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();

        match err.downcast_ref::<ProgressError>() {
            Some(ProgressError::UserNotFound(_)) => {
                return Self::failure(StatusCode::NOT_FOUND, "user_not_found", message, None);
            }
            Some(ProgressError::Validation(_)) => {
                return Self::failure(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    diagnostic_text(err),
                    None,
                );
            }
            _ => {}
        }

        if err.downcast_ref::<SaveGameDataFailed>().is_some() {
            return Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "save_failed",
                SAVE_GAME_DATA_FAILED,
                Some(json!({ "cause": diagnostic_text(err) })),
            );
        }

        let root = err.root_cause().to_string().to_ascii_lowercase();
        if root.contains("no such table") || root.contains("schema") || root.contains("database")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    /// Runs a read on the blocking pool. A read that outlives the operation
    /// timeout is abandoned and reported as a failure.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ProgressApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_with_policy(
            TimeoutPolicy::Abandon,
            default_status,
            default_code,
            operation_label,
            op,
        )
        .await
    }

    /// Runs a write on the blocking pool and always waits for its outcome.
    /// A started write keeps running once its task is spawned, so the
    /// response has to report what actually happened to the database.
    async fn run_write<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ProgressApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_with_policy(
            TimeoutPolicy::AwaitCompletion,
            default_status,
            default_code,
            operation_label,
            op,
        )
        .await
    }

    async fn run_with_policy<T, F>(
        &self,
        policy: TimeoutPolicy,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ProgressApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let mut handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = match tokio::time::timeout(self.operation_timeout, &mut handle).await {
            Ok(join_result) => join_result,
            Err(_) if policy == TimeoutPolicy::AwaitCompletion => {
                self.telemetry
                    .slow_write_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = %self.operation_timeout.as_millis(),
                    "write exceeded operation timeout; waiting for it to finish"
                );
                handle.await
            }
            Err(_) => {
                self.telemetry.record_failure(default_code, true);
                return Err(Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeoutMs": self.operation_timeout.as_millis() })),
                ));
            }
        };

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                tracing::debug!(
                    operation = operation_label,
                    code = failure.code,
                    error = diagnostic_text(&err),
                    "operation failed"
                );
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "user_not_found" => &self.user_not_found_total,
            "save_failed" => &self.save_failed_total,
            "schema_unavailable" => &self.schema_unavailable_total,
            "unauthorized" => &self.unauthorized_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            slow_write_total: self.slow_write_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            user_not_found_total: self.user_not_found_total.load(Ordering::Relaxed),
            save_failed_total: self.save_failed_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            unauthorized_total: self.unauthorized_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

/// Compares secrets without short-circuiting on the first differing byte.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    let mut diff = expected.len() ^ provided.len();
    for (index, byte) in expected.iter().enumerate() {
        let other = provided.get(index).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

fn diagnostic_text(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/users/:user_id", get(user_show))
        .route("/v1/users/:user_id/score-delta", post(user_score_delta))
        .route("/v1/users/:user_id/game-data", post(user_game_data))
        .route(
            "/v1/users/:user_id/levels/:level/scores",
            post(user_level_score),
        )
        .route("/v1/sessions", post(session_log))
        .route("/v1/games/complete", post(game_complete))
        .route("/api/admin/migrate-streak", post(admin_migrate_streak))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let api = ProgressApi::new(args.db.clone());

    if !args.skip_migrate {
        let migrate_api = api.clone();
        let status = tokio::task::spawn_blocking(move || migrate_api.migrate()).await??;
        tracing::info!(
            schema_version = status.current_version,
            "progress schema is current"
        );
    }

    let admin_secret = args
        .admin_secret
        .filter(|secret| !secret.is_empty())
        .map(Arc::<str>::from);
    if admin_secret.is_none() {
        tracing::warn!("no admin secret configured; admin endpoints will reject every request");
    }

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
        admin_secret,
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "serving progress API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        admin_enabled: state.admin_secret.is_some(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let schema_status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_status",
            |api| api.schema_status(),
        )
        .await?;

    let is_ready = schema_status.pending_versions.is_empty()
        && schema_status.current_version == schema_status.target_version;
    let checks = ReadinessChecks {
        current_schema_version: schema_status.current_version,
        target_schema_version: schema_status.target_version,
        pending_migrations: schema_status.pending_versions.len(),
    };

    if is_ready {
        return Ok(Json(envelope(ReadinessResponse {
            status: "ready",
            checks,
        })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; run /v1/db/migrate before serving traffic",
        Some(json!({
            "currentVersion": schema_status.current_version,
            "targetVersion": schema_status.target_version,
            "pendingVersions": schema_status.pending_versions,
        })),
    ))
}

async fn db_migrate(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceFailure> {
    let status = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "migration_failed",
            "migrate",
            |api| api.migrate(),
        )
        .await?;
    Ok(Json(envelope(status)))
}

async fn user_show(
    State(state): State<ServiceState>,
    Path(raw_user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<UserRecord>>, ServiceFailure> {
    let user_id = state.parse_user_id(&raw_user_id)?;
    let record = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "user_lookup_failed",
            "user_show",
            move |api| api.get_user(&user_id),
        )
        .await?;
    Ok(Json(envelope(record)))
}

async fn user_score_delta(
    State(state): State<ServiceState>,
    Path(raw_user_id): Path<String>,
    payload: Result<Json<ScoreDeltaRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ScoreDelta>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let user_id = state.parse_user_id(&raw_user_id)?;

    let lookup_user = user_id.clone();
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "score_delta_failed",
            "score_delta",
            move |api| Ok(api.score_delta(&lookup_user, request.level, request.score)),
        )
        .await;

    let delta = result.unwrap_or_else(|failure| {
        tracing::warn!(
            user_id = %user_id,
            level = request.level,
            error = %failure.message,
            "score delta lookup did not complete; scoring as first play"
        );
        ScoreDelta::first_play(request.score)
    });
    Ok(Json(envelope(delta)))
}

async fn user_game_data(
    State(state): State<ServiceState>,
    Path(raw_user_id): Path<String>,
    payload: Result<Json<GameDataUpdate>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<UserRecord>>, ServiceFailure> {
    let Json(update) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let user_id = state.parse_user_id(&raw_user_id)?;
    let record = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "save_failed",
            "update_game_data",
            move |api| api.update_game_data(&user_id, &update),
        )
        .await?;
    Ok(Json(envelope(record)))
}

async fn user_level_score(
    State(state): State<ServiceState>,
    path: Result<Path<(String, u32)>, PathRejection>,
    payload: Result<Json<LevelScoreRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ScoreDelta>>, ServiceFailure> {
    let Path((raw_user_id, level)) =
        path.map_err(|rejection| state.invalid_path_with_telemetry(&rejection))?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let user_id = state.parse_user_id(&raw_user_id)?;
    let played_at = request.played_at.unwrap_or_else(now_utc);

    let delta = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "save_failed",
            "record_level_score",
            move |api| api.record_level_score(&user_id, level, request.score, played_at),
        )
        .await?;
    Ok(Json(envelope(delta)))
}

async fn session_log(
    State(state): State<ServiceState>,
    payload: Result<Json<GameSessionInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SessionLogOutcome>>, ServiceFailure> {
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    input
        .validate()
        .map_err(|err| state.validation_failure(format!("session validation failed: {err}")))?;

    let result = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "session_log_failed",
            "log_session",
            move |api| Ok(api.log_session(input)),
        )
        .await;

    let outcome = result.unwrap_or_else(|failure| {
        tracing::warn!(error = %failure.message, "session log did not complete");
        SessionLogOutcome {
            logged: false,
            session_id: None,
        }
    });
    Ok(Json(envelope(outcome)))
}

async fn game_complete(
    State(state): State<ServiceState>,
    payload: Result<Json<GameSessionInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<GameCompletion>>, ServiceFailure> {
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let completion = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "save_failed",
            "complete_game",
            move |api| api.complete_game(input),
        )
        .await?;
    Ok(Json(envelope(completion)))
}

async fn admin_migrate_streak(
    State(state): State<ServiceState>,
    query: Result<Query<AdminMigrateQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        state.telemetry.record_failure("validation_error", false);
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Bad Request" })),
        )
            .into_response();
    };

    if !state.admin_authorized(query.secret.as_deref()) {
        state.telemetry.record_failure("unauthorized", false);
        tracing::warn!("rejected streak migration request: invalid admin secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    let dry_run = query.dry_run.unwrap_or(false);
    let result = state
        .run_write(
            StatusCode::INTERNAL_SERVER_ERROR,
            "migration_failed",
            "migrate_streaks",
            move |api| api.migrate_streaks(dry_run),
        )
        .await;

    match result {
        Ok(report) => Json(AdminMigrateResponse {
            success: true,
            migrated: report.migrated,
            total: report.total,
            dry_run: report.dry_run,
        })
        .into_response(),
        Err(failure) => (
            failure.status,
            Json(json!({ "success": false, "error": failure.message })),
        )
            .into_response(),
    }
}
