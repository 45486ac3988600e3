use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::rollout::{
    PluginBackup, RollbackAttempt, RollbackTrigger, Rollout, RolloutStatus, RolloutStrategy,
    UpgradeOutcome,
};
use crate::rollout::{
    self, NewRollout,
    backup::{self, NewBackup},
    rollback::{self, RollbackCompletion},
};

const MUTATOR_ROLES: &[&str] = &["ops_plugins", "pay_admin"];
const AUTO_CHECK_ROLES: &[&str] = &["ops_plugins", "pay_admin", "sira_service"];

#[derive(Debug, Deserialize)]
pub struct CreateRolloutBody {
    pub plugin_name: String,
    pub version: String,
    pub percentage: f64,
    pub strategy: RolloutStrategy,
    pub target_countries: Option<Vec<String>>,
    pub target_tiers: Option<Vec<String>>,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_error_threshold() -> f64 {
    0.05
}

fn default_metadata() -> serde_json::Value {
    json!({})
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateRolloutBody>,
) -> Result<Json<Rollout>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let conn = state.db.lock().await;
    let rollout = rollout::create_rollout(
        &conn,
        &NewRollout {
            plugin_name: body.plugin_name,
            version: body.version,
            percentage: body.percentage,
            strategy: body.strategy,
            target_countries: body.target_countries,
            target_tiers: body.target_tiers,
            error_threshold: body.error_threshold,
            metadata: body.metadata,
        },
    )?;
    Ok(Json(rollout))
}

pub async fn list(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<Json<Vec<Rollout>>, ApiError> {
    let conn = state.db.lock().await;
    Ok(Json(rollout::list_rollouts(&conn)?))
}

pub async fn get_one(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Rollout>, ApiError> {
    let conn = state.db.lock().await;
    Ok(Json(rollout::get_rollout(&conn, &id)?))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: RolloutStatus,
    pub reason: Option<String>,
}

pub async fn set_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Rollout>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let mut conn = state.db.lock().await;
    let rollout = rollout::set_status(&mut conn, &id, body.status, body.reason.as_deref())?;
    Ok(Json(rollout))
}

#[derive(Debug, Deserialize)]
pub struct ShouldUpgradeQuery {
    pub merchant: String,
    pub plugin: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub tier: String,
}

/// Called server-to-server by plugin agents; deliberately unauthenticated.
pub async fn should_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ShouldUpgradeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db.lock().await;
    let upgrade = rollout::should_upgrade(
        &conn,
        &query.merchant,
        &query.plugin,
        &query.country,
        &query.tier,
    )?;
    Ok(Json(json!({ "upgrade": upgrade })))
}

#[derive(Debug, Deserialize)]
pub struct UpgradeLogBody {
    pub merchant: String,
    pub plugin: String,
    pub version: String,
    pub status: UpgradeOutcome,
}

/// Upgrade outcome report from a plugin agent; feeds the auto-pause sweep.
pub async fn record_upgrade(
    State(state): State<AppState>,
    Json(body): Json<UpgradeLogBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db.lock().await;
    rollout::record_upgrade(&conn, &body.merchant, &body.plugin, &body.version, body.status)?;
    Ok(Json(json!({ "recorded": true })))
}

pub async fn auto_check(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_any(AUTO_CHECK_ROLES)?;
    let mut conn = state.db.lock().await;
    let paused = rollout::auto_check(&mut conn)?;
    Ok(Json(json!({ "paused": paused })))
}

// ── Backups ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBackupBody {
    pub merchant: String,
    pub plugin: String,
    pub version: String,
    pub path: String,
    pub db_snapshot: Option<String>,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

pub async fn create_backup(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateBackupBody>,
) -> Result<Json<PluginBackup>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let conn = state.db.lock().await;
    let created = backup::create_backup(
        &conn,
        &NewBackup {
            merchant: body.merchant,
            plugin: body.plugin,
            version: body.version,
            path: body.path,
            db_snapshot: body.db_snapshot,
            size_bytes: body.size_bytes,
            metadata: body.metadata,
        },
        backup::DEFAULT_RETENTION_SECS,
    )?;
    Ok(Json(created))
}

#[derive(Debug, Deserialize)]
pub struct LatestBackupQuery {
    pub merchant: String,
    pub plugin: String,
    pub version: Option<String>,
}

pub async fn latest_backup(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<LatestBackupQuery>,
) -> Result<Json<Option<PluginBackup>>, ApiError> {
    let conn = state.db.lock().await;
    let found = backup::get_latest_backup(
        &conn,
        &query.merchant,
        &query.plugin,
        query.version.as_deref(),
    )?;
    Ok(Json(found))
}

pub async fn cleanup_backups(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let conn = state.db.lock().await;
    let removed = backup::cleanup_expired(&conn)?;
    Ok(Json(json!({ "removed": removed })))
}

// ── Rollbacks ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitiateRollbackBody {
    pub merchant: String,
    pub plugin: String,
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub trigger: Option<RollbackTrigger>,
    pub reason: Option<String>,
}

pub async fn initiate_rollback(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<InitiateRollbackBody>,
) -> Result<Json<RollbackAttempt>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let mut conn = state.db.lock().await;
    let attempt = rollback::initiate_rollback(
        &mut conn,
        &body.merchant,
        &body.plugin,
        &body.from_version,
        &body.to_version,
        body.trigger.unwrap_or(RollbackTrigger::Manual),
        body.reason.as_deref(),
    )?;
    Ok(Json(attempt))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRollbackBody {
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub files_restored: Option<bool>,
    pub db_restored: Option<bool>,
}

pub async fn complete_rollback(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<CompleteRollbackBody>,
) -> Result<Json<RollbackAttempt>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let mut conn = state.db.lock().await;
    let attempt = rollback::complete_rollback(
        &mut conn,
        &id,
        &RollbackCompletion {
            success: body.success,
            error_message: body.error_message,
            duration_ms: body.duration_ms,
            files_restored: body.files_restored,
            db_restored: body.db_restored,
        },
    )?;
    Ok(Json(attempt))
}
