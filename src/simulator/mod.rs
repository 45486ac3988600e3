pub mod harness;
pub mod sandbox;
pub mod worker;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

use crate::model::simulation::{
    AnonymizedError, JournalEntry, JournalEvent, RunMetrics, RunStatus, SimulationRun,
};
use crate::store::now_ts;

/// Hard wall clock per run; enforced by killing the sandbox.
pub const MAX_RUN_TIME_MS: u64 = 180_000;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("simulation run `{0}` not found")]
    RunNotFound(String),
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

/// Per-language sandbox image. Storefront platforms map onto the language
/// their SDK embeds in.
pub fn image_for(sdk_language: &str) -> &'static str {
    match sdk_language {
        "node" | "shopify" => "sunupay-sim-node",
        "php" | "woocommerce" => "sunupay-sim-php",
        "python" => "sunupay-sim-python",
        "ruby" => "sunupay-sim-ruby",
        _ => "sunupay-sim-generic",
    }
}

pub fn enqueue_run(
    conn: &Connection,
    seed: u64,
    sdk_language: &str,
    scenario: serde_json::Value,
    patch_reference: Option<&str>,
) -> Result<SimulationRun, SimError> {
    let run = SimulationRun {
        id: uuid::Uuid::new_v4().to_string(),
        seed,
        sdk_language: sdk_language.to_string(),
        scenario,
        patch_reference: patch_reference.map(str::to_string),
        status: RunStatus::Queued,
        container_id: None,
        metrics: None,
        artifact_key: None,
        exit_code: None,
        error_message: None,
        started_at: None,
        completed_at: None,
        created_at: now_ts(),
    };
    conn.execute(
        "INSERT INTO simulation_runs (id, seed, sdk_language, scenario, patch_reference, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.id,
            run.seed as i64,
            run.sdk_language,
            run.scenario.to_string(),
            run.patch_reference,
            run.status,
            run.created_at,
        ],
    )?;
    Ok(run)
}

/// Claim the oldest queued run: mark it running and journal `started`, in
/// one transaction so a second worker cannot claim it too.
pub fn dequeue_next(conn: &mut Connection) -> Result<Option<String>, SimError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let run_id: Option<String> = tx
        .query_row(
            "SELECT id FROM simulation_runs WHERE status = 'queued'
             ORDER BY created_at, rowid LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(run_id) = run_id else {
        return Ok(None);
    };

    tx.execute(
        "UPDATE simulation_runs SET status = 'running', started_at = ?2 WHERE id = ?1",
        params![run_id, now_ts()],
    )?;
    journal(&tx, &run_id, JournalEvent::Started, None)?;
    tx.commit()?;
    Ok(Some(run_id))
}

pub fn get_run(conn: &Connection, run_id: &str) -> Result<Option<SimulationRun>, SimError> {
    let run = conn
        .query_row(
            "SELECT id, seed, sdk_language, scenario, patch_reference, status, container_id,
                    metrics, artifact_key, exit_code, error_message, started_at, completed_at,
                    created_at
             FROM simulation_runs WHERE id = ?1",
            params![run_id],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

/// Append a journal entry. The terminal entry is unique per run: once one
/// exists, further terminal events are dropped.
pub fn journal(
    conn: &Connection,
    run_id: &str,
    event: JournalEvent,
    detail: Option<&str>,
) -> Result<(), SimError> {
    if event.is_terminal() {
        let terminal_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM simulation_journal WHERE run_id = ?1 AND event != 'started'",
            params![run_id],
            |row| row.get(0),
        )?;
        if terminal_count > 0 {
            return Ok(());
        }
    }
    conn.execute(
        "INSERT INTO simulation_journal (run_id, event, detail, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![run_id, event, detail, now_ts()],
    )?;
    Ok(())
}

pub fn journal_entries(conn: &Connection, run_id: &str) -> Result<Vec<JournalEntry>, SimError> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, event, detail, created_at
         FROM simulation_journal WHERE run_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                run_id: row.get(1)?,
                event: row.get(2)?,
                detail: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn upsert_patch(
    conn: &Connection,
    reference: &str,
    patch_code: &str,
    rollback_code: Option<&str>,
) -> Result<(), SimError> {
    conn.execute(
        "INSERT INTO sim_patches (reference, patch_code, rollback_code)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (reference) DO UPDATE SET patch_code = ?2, rollback_code = ?3",
        params![reference, patch_code, rollback_code],
    )?;
    Ok(())
}

pub fn get_patch(
    conn: &Connection,
    reference: &str,
) -> Result<Option<(String, Option<String>)>, SimError> {
    let patch = conn
        .query_row(
            "SELECT patch_code, rollback_code FROM sim_patches WHERE reference = ?1",
            params![reference],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(patch)
}

pub fn anonymized_errors_of(
    conn: &Connection,
    run_id: &str,
) -> Result<Vec<AnonymizedError>, SimError> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, error_signature, category, sdk_language, frequency, context_hash
         FROM anonymized_errors WHERE run_id = ?1 ORDER BY error_signature",
    )?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            Ok(AnonymizedError {
                id: row.get(0)?,
                run_id: row.get(1)?,
                error_signature: row.get(2)?,
                category: row.get(3)?,
                sdk_language: row.get(4)?,
                frequency: row.get(5)?,
                context_hash: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SimulationRun> {
    let metrics: Option<String> = row.get(7)?;
    Ok(SimulationRun {
        id: row.get(0)?,
        seed: row.get::<_, i64>(1)? as u64,
        sdk_language: row.get(2)?,
        scenario: serde_json::from_str(&row.get::<_, String>(3)?)
            .unwrap_or(serde_json::Value::Null),
        patch_reference: row.get(4)?,
        status: row.get(5)?,
        container_id: row.get(6)?,
        metrics: metrics.and_then(|m| serde_json::from_str::<RunMetrics>(&m).ok()),
        artifact_key: row.get(8)?,
        exit_code: row.get(9)?,
        error_message: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        created_at: row.get(13)?,
    })
}
