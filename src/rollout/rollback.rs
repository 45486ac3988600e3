use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::model::rollout::{RollbackAttempt, RollbackTrigger};
use crate::store::{now_ms, now_ts};

use super::{RolloutError, backup};

#[derive(Debug, Clone)]
pub struct RollbackCompletion {
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub files_restored: Option<bool>,
    pub db_restored: Option<bool>,
}

/// Open a rollback attempt. Requires a completed, unexpired backup of the
/// version being restored.
pub fn initiate_rollback(
    conn: &mut Connection,
    merchant: &str,
    plugin: &str,
    from_version: &str,
    to_version: &str,
    trigger: RollbackTrigger,
    reason: Option<&str>,
) -> Result<RollbackAttempt, RolloutError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if backup::get_latest_backup(&tx, merchant, plugin, Some(to_version))?.is_none() {
        return Err(RolloutError::BackupRequired {
            merchant: merchant.to_string(),
            plugin: plugin.to_string(),
            version: to_version.to_string(),
        });
    }

    let attempt = RollbackAttempt {
        id: uuid::Uuid::new_v4().to_string(),
        merchant: merchant.to_string(),
        plugin: plugin.to_string(),
        from_version: from_version.to_string(),
        to_version: to_version.to_string(),
        trigger,
        reason: reason.map(str::to_string),
        started_at: now_ts(),
        completed_at: None,
        success: None,
        error_message: None,
        duration_ms: None,
        files_restored: None,
        db_restored: None,
    };
    tx.execute(
        "INSERT INTO rollback_attempts
             (id, merchant, plugin, from_version, to_version, trigger_kind, reason, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            attempt.id,
            attempt.merchant,
            attempt.plugin,
            attempt.from_version,
            attempt.to_version,
            attempt.trigger,
            attempt.reason,
            attempt.started_at,
        ],
    )?;
    tx.commit()?;
    Ok(attempt)
}

/// Close a rollback attempt. Terminal: a completed attempt is immutable.
/// Also stamps the pair's latest upgrade log with the attempt outcome, the
/// log keeping only the last attempt.
pub fn complete_rollback(
    conn: &mut Connection,
    attempt_id: &str,
    completion: &RollbackCompletion,
) -> Result<RollbackAttempt, RolloutError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut attempt = get_attempt(&tx, attempt_id)?
        .ok_or_else(|| RolloutError::AttemptNotFound(attempt_id.to_string()))?;
    if attempt.completed_at.is_some() {
        return Err(RolloutError::AttemptCompleted(attempt_id.to_string()));
    }

    let completed_at = now_ts();
    let duration_ms = completion
        .duration_ms
        .unwrap_or_else(|| (now_ms() - attempt.started_at * 1000).max(0));

    tx.execute(
        "UPDATE rollback_attempts
         SET completed_at = ?2, success = ?3, error_message = ?4, duration_ms = ?5,
             files_restored = ?6, db_restored = ?7
         WHERE id = ?1",
        params![
            attempt_id,
            completed_at,
            completion.success,
            completion.error_message,
            duration_ms,
            completion.files_restored,
            completion.db_restored,
        ],
    )?;

    let rollback_status = if completion.success { "success" } else { "failed" };
    tx.execute(
        "UPDATE plugin_upgrade_logs SET rollback_status = ?3
         WHERE id = (SELECT id FROM plugin_upgrade_logs
                     WHERE merchant = ?1 AND plugin = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1)",
        params![attempt.merchant, attempt.plugin, rollback_status],
    )?;

    tx.commit()?;

    attempt.completed_at = Some(completed_at);
    attempt.success = Some(completion.success);
    attempt.error_message = completion.error_message.clone();
    attempt.duration_ms = Some(duration_ms);
    attempt.files_restored = completion.files_restored;
    attempt.db_restored = completion.db_restored;
    Ok(attempt)
}

pub fn get_attempt(
    conn: &Connection,
    attempt_id: &str,
) -> Result<Option<RollbackAttempt>, RolloutError> {
    let attempt = conn
        .query_row(
            "SELECT id, merchant, plugin, from_version, to_version, trigger_kind, reason,
                    started_at, completed_at, success, error_message, duration_ms,
                    files_restored, db_restored
             FROM rollback_attempts WHERE id = ?1",
            params![attempt_id],
            |row| {
                Ok(RollbackAttempt {
                    id: row.get(0)?,
                    merchant: row.get(1)?,
                    plugin: row.get(2)?,
                    from_version: row.get(3)?,
                    to_version: row.get(4)?,
                    trigger: row.get(5)?,
                    reason: row.get(6)?,
                    started_at: row.get(7)?,
                    completed_at: row.get(8)?,
                    success: row.get(9)?,
                    error_message: row.get(10)?,
                    duration_ms: row.get(11)?,
                    files_restored: row.get(12)?,
                    db_restored: row.get(13)?,
                })
            },
        )
        .optional()?;
    Ok(attempt)
}
