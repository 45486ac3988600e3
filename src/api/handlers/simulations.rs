use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::simulation::{AnonymizedError, JournalEntry, SimulationRun};
use crate::simulator::{self, SimError};

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub seed: u64,
    pub sdk_language: String,
    #[serde(default = "default_scenario")]
    pub scenario: serde_json::Value,
    pub patch_reference: Option<String>,
}

fn default_scenario() -> serde_json::Value {
    json!({})
}

pub async fn enqueue(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(body): Json<EnqueueBody>,
) -> Result<Json<SimulationRun>, ApiError> {
    let conn = state.db.lock().await;
    let run = simulator::enqueue_run(
        &conn,
        body.seed,
        &body.sdk_language,
        body.scenario,
        body.patch_reference.as_deref(),
    )?;
    Ok(Json(run))
}

pub async fn get_one(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SimulationRun>, ApiError> {
    let conn = state.db.lock().await;
    let run = simulator::get_run(&conn, &id)?.ok_or(SimError::RunNotFound(id))?;
    Ok(Json(run))
}

pub async fn journal(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    let conn = state.db.lock().await;
    Ok(Json(simulator::journal_entries(&conn, &id)?))
}

pub async fn errors(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<AnonymizedError>>, ApiError> {
    let conn = state.db.lock().await;
    Ok(Json(simulator::anonymized_errors_of(&conn, &id)?))
}
