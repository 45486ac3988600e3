use rusqlite::{Connection, OptionalExtension, params};

use crate::model::rollout::{BackupStatus, PluginBackup};
use crate::store::now_ts;

use super::RolloutError;

/// Default retention for pre-upgrade backups.
pub const DEFAULT_RETENTION_SECS: i64 = 30 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct NewBackup {
    pub merchant: String,
    pub plugin: String,
    pub version: String,
    pub path: String,
    pub db_snapshot: Option<String>,
    pub size_bytes: i64,
    pub metadata: serde_json::Value,
}

/// Record a completed pre-upgrade backup. Every upgrade must create one
/// before touching the merchant's install; rollbacks refuse to run without
/// a live one.
pub fn create_backup(
    conn: &Connection,
    new: &NewBackup,
    retention_secs: i64,
) -> Result<PluginBackup, RolloutError> {
    let now = now_ts();
    let backup = PluginBackup {
        id: uuid::Uuid::new_v4().to_string(),
        merchant: new.merchant.clone(),
        plugin: new.plugin.clone(),
        version: new.version.clone(),
        path: new.path.clone(),
        db_snapshot: new.db_snapshot.clone(),
        size_bytes: new.size_bytes,
        status: BackupStatus::Completed,
        expires_at: now + retention_secs,
        metadata: new.metadata.clone(),
        created_at: now,
    };
    conn.execute(
        "INSERT INTO plugin_backups
             (id, merchant, plugin, version, path, db_snapshot, size_bytes,
              status, expires_at, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            backup.id,
            backup.merchant,
            backup.plugin,
            backup.version,
            backup.path,
            backup.db_snapshot,
            backup.size_bytes,
            backup.status,
            backup.expires_at,
            backup.metadata.to_string(),
            backup.created_at,
        ],
    )?;
    Ok(backup)
}

/// Newest `completed` backup that has not expired, optionally pinned to a
/// version.
pub fn get_latest_backup(
    conn: &Connection,
    merchant: &str,
    plugin: &str,
    version: Option<&str>,
) -> Result<Option<PluginBackup>, RolloutError> {
    let now = now_ts();
    let backup = match version {
        Some(v) => conn
            .query_row(
                &format!(
                    "{BACKUP_SELECT}
                     WHERE merchant = ?1 AND plugin = ?2 AND version = ?3
                       AND status = 'completed' AND expires_at > ?4
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![merchant, plugin, v, now],
                backup_from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "{BACKUP_SELECT}
                     WHERE merchant = ?1 AND plugin = ?2
                       AND status = 'completed' AND expires_at > ?3
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![merchant, plugin, now],
                backup_from_row,
            )
            .optional()?,
    };
    Ok(backup)
}

/// Drop backups past their retention window. Returns the count removed.
pub fn cleanup_expired(conn: &Connection) -> Result<u32, RolloutError> {
    let n = conn.execute(
        "DELETE FROM plugin_backups WHERE expires_at <= ?1",
        params![now_ts()],
    )?;
    Ok(n as u32)
}

const BACKUP_SELECT: &str = "SELECT id, merchant, plugin, version, path, db_snapshot,
        size_bytes, status, expires_at, metadata, created_at
 FROM plugin_backups";

fn backup_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PluginBackup> {
    Ok(PluginBackup {
        id: row.get(0)?,
        merchant: row.get(1)?,
        plugin: row.get(2)?,
        version: row.get(3)?,
        path: row.get(4)?,
        db_snapshot: row.get(5)?,
        size_bytes: row.get(6)?,
        status: row.get(7)?,
        expires_at: row.get(8)?,
        metadata: serde_json::from_str(&row.get::<_, String>(9)?)
            .unwrap_or(serde_json::Value::Null),
        created_at: row.get(10)?,
    })
}
