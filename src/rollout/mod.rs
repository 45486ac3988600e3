pub mod backup;
pub mod hashing;
pub mod rollback;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;
use tracing::info;

use crate::model::rollout::{Rollout, RolloutStatus, RolloutStrategy, UpgradeOutcome};
use crate::store::now_ts;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("percentage {0} is outside [0, 100]")]
    PercentageOutOfRange(f64),
    #[error("error threshold {0} is outside [0, 1]")]
    ThresholdOutOfRange(f64),
    #[error("rollout `{0}` not found")]
    NotFound(String),
    #[error("rollout `{id}` is terminal ({status}) and cannot transition")]
    Terminal { id: String, status: RolloutStatus },
    #[error("no completed, unexpired backup for {merchant}/{plugin} version {version}")]
    BackupRequired {
        merchant: String,
        plugin: String,
        version: String,
    },
    #[error("rollback attempt `{0}` not found")]
    AttemptNotFound(String),
    #[error("rollback attempt `{0}` is already completed")]
    AttemptCompleted(String),
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct NewRollout {
    pub plugin_name: String,
    pub version: String,
    pub percentage: f64,
    pub strategy: RolloutStrategy,
    pub target_countries: Option<Vec<String>>,
    pub target_tiers: Option<Vec<String>>,
    pub error_threshold: f64,
    pub metadata: serde_json::Value,
}

pub fn create_rollout(conn: &Connection, new: &NewRollout) -> Result<Rollout, RolloutError> {
    if !(0.0..=100.0).contains(&new.percentage) {
        return Err(RolloutError::PercentageOutOfRange(new.percentage));
    }
    if !(0.0..=1.0).contains(&new.error_threshold) {
        return Err(RolloutError::ThresholdOutOfRange(new.error_threshold));
    }

    let rollout = Rollout {
        id: uuid::Uuid::new_v4().to_string(),
        plugin_name: new.plugin_name.clone(),
        version: new.version.clone(),
        percentage: new.percentage,
        strategy: new.strategy,
        target_countries: new.target_countries.clone(),
        target_tiers: new.target_tiers.clone(),
        error_threshold: new.error_threshold,
        status: RolloutStatus::Active,
        metadata: new.metadata.clone(),
        created_at: now_ts(),
    };
    conn.execute(
        "INSERT INTO rollouts
             (id, plugin_name, version, percentage, strategy, target_countries,
              target_tiers, error_threshold, status, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            rollout.id,
            rollout.plugin_name,
            rollout.version,
            rollout.percentage,
            rollout.strategy,
            rollout
                .target_countries
                .as_ref()
                .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "[]".into())),
            rollout
                .target_tiers
                .as_ref()
                .map(|t| serde_json::to_string(t).unwrap_or_else(|_| "[]".into())),
            rollout.error_threshold,
            rollout.status,
            rollout.metadata.to_string(),
            rollout.created_at,
        ],
    )?;
    Ok(rollout)
}

/// Latest rollout for a plugin, the one targeting queries resolve against.
pub fn latest_rollout(conn: &Connection, plugin: &str) -> Result<Option<Rollout>, RolloutError> {
    let rollout = conn
        .query_row(
            &format!("{ROLLOUT_SELECT} WHERE plugin_name = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"),
            params![plugin],
            rollout_from_row,
        )
        .optional()?;
    Ok(rollout)
}

pub fn get_rollout(conn: &Connection, id: &str) -> Result<Rollout, RolloutError> {
    conn.query_row(
        &format!("{ROLLOUT_SELECT} WHERE id = ?1"),
        params![id],
        rollout_from_row,
    )
    .optional()?
    .ok_or_else(|| RolloutError::NotFound(id.to_string()))
}

pub fn list_rollouts(conn: &Connection) -> Result<Vec<Rollout>, RolloutError> {
    let mut stmt =
        conn.prepare(&format!("{ROLLOUT_SELECT} ORDER BY created_at DESC, rowid DESC"))?;
    let rows = stmt
        .query_map([], rollout_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Operator-driven status change. Terminal states are monotonic.
pub fn set_status(
    conn: &mut Connection,
    id: &str,
    to: RolloutStatus,
    reason: Option<&str>,
) -> Result<Rollout, RolloutError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let rollout = transition(&tx, id, to, reason)?;
    tx.commit()?;
    Ok(rollout)
}

fn transition(
    conn: &Connection,
    id: &str,
    to: RolloutStatus,
    reason: Option<&str>,
) -> Result<Rollout, RolloutError> {
    let mut rollout = get_rollout(conn, id)?;
    if rollout.status.is_terminal() {
        return Err(RolloutError::Terminal { id: id.to_string(), status: rollout.status });
    }

    if let Some(reason) = reason {
        if let serde_json::Value::Object(map) = &mut rollout.metadata {
            map.insert("pause_reason".to_string(), serde_json::Value::String(reason.to_string()));
        } else {
            rollout.metadata = serde_json::json!({ "pause_reason": reason });
        }
    }
    rollout.status = to;

    conn.execute(
        "UPDATE rollouts SET status = ?2, metadata = ?3 WHERE id = ?1",
        params![id, rollout.status, rollout.metadata.to_string()],
    )?;
    Ok(rollout)
}

/// Deterministic admission decision for one merchant against one plugin.
pub fn should_upgrade(
    conn: &Connection,
    merchant: &str,
    plugin: &str,
    country: &str,
    tier: &str,
) -> Result<bool, RolloutError> {
    let Some(rollout) = latest_rollout(conn, plugin)? else {
        return Ok(false);
    };
    if rollout.status != RolloutStatus::Active {
        return Ok(false);
    }

    let in_target = match rollout.strategy {
        RolloutStrategy::Random => true,
        RolloutStrategy::Geo => rollout
            .target_countries
            .as_ref()
            .is_some_and(|c| c.iter().any(|x| x == country)),
        RolloutStrategy::MerchantTier => rollout
            .target_tiers
            .as_ref()
            .is_some_and(|t| t.iter().any(|x| x == tier)),
    };
    if !in_target {
        return Ok(false);
    }

    Ok(hashing::admitted(merchant, plugin, rollout.percentage))
}

/// Outcome of an applied upgrade, reported back by the plugin agent. Feeds
/// the auto-pause error rate.
pub fn record_upgrade(
    conn: &Connection,
    merchant: &str,
    plugin: &str,
    version: &str,
    outcome: UpgradeOutcome,
) -> Result<(), RolloutError> {
    conn.execute(
        "INSERT INTO plugin_upgrade_logs (id, merchant, plugin, version, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            merchant,
            plugin,
            version,
            outcome,
            now_ts(),
        ],
    )?;
    Ok(())
}

/// Scheduled sweep: pause every active rollout whose observed error rate
/// exceeds its threshold. Returns the number paused. This is the only
/// unattended path from `active` to `paused`.
pub fn auto_check(conn: &mut Connection) -> Result<u32, RolloutError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let active: Vec<Rollout> = {
        let mut stmt = tx.prepare(&format!("{ROLLOUT_SELECT} WHERE status = 'active'"))?;
        let rows = stmt
            .query_map([], rollout_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut paused = 0u32;
    for rollout in active {
        let (total, failed): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'failed'), 0)
             FROM plugin_upgrade_logs
             WHERE plugin = ?1 AND version = ?2 AND created_at >= ?3",
            params![rollout.plugin_name, rollout.version, rollout.created_at],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            continue;
        }
        let rate = failed as f64 / total as f64;
        if rate > rollout.error_threshold {
            let reason = format!(
                "auto-pause: error rate {rate:.4} over {total} upgrades exceeds threshold {:.4}",
                rollout.error_threshold
            );
            transition(&tx, &rollout.id, RolloutStatus::Paused, Some(&reason))?;
            info!(
                plugin = %rollout.plugin_name,
                version = %rollout.version,
                rate,
                "rollout auto-paused"
            );
            paused += 1;
        }
    }

    tx.commit()?;
    Ok(paused)
}

// ── Row access ──────────────────────────────────────────────────────

const ROLLOUT_SELECT: &str = "SELECT id, plugin_name, version, percentage, strategy,
        target_countries, target_tiers, error_threshold, status, metadata, created_at
 FROM rollouts";

fn rollout_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rollout> {
    Ok(Rollout {
        id: row.get(0)?,
        plugin_name: row.get(1)?,
        version: row.get(2)?,
        percentage: row.get(3)?,
        strategy: row.get(4)?,
        target_countries: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        target_tiers: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        error_threshold: row.get(7)?,
        status: row.get(8)?,
        metadata: serde_json::from_str(&row.get::<_, String>(9)?)
            .unwrap_or(serde_json::Value::Null),
        created_at: row.get(10)?,
    })
}
