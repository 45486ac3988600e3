//! TTL expiry worker.
//!
//! Periodically expires approval requests past `expires_at`. The local
//! transitions (status, audit, linked ops action) commit first; the bus
//! announcement is best-effort afterwards, so at-least-once scheduling of
//! the worker can never duplicate a business transition — re-running over
//! an already-expired request is a no-op.

use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior, params};
use tracing::{info, warn};

use crate::events::EventBus;
use crate::model::approval::OpsActionStatus;
use crate::store::{Db, now_ts};

use super::ApprovalError;

/// A request this sweep expired, with what the announcement needs.
#[derive(Debug, Clone)]
pub struct ExpiredRequest {
    pub id: String,
    pub request_type: String,
    pub reference_id: Option<String>,
}

/// Expire every signable request whose TTL has passed. Idempotent: expired
/// requests no longer match the filter.
pub fn expire_due(conn: &mut Connection, now: i64) -> Result<Vec<ExpiredRequest>, ApprovalError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let due: Vec<ExpiredRequest> = {
        let mut stmt = tx.prepare(
            "SELECT id, request_type, reference_id FROM approval_requests
             WHERE status IN ('open', 'partially_approved') AND expires_at <= ?1",
        )?;
        let rows = stmt
            .query_map(params![now], |row| {
                Ok(ExpiredRequest {
                    id: row.get(0)?,
                    request_type: row.get(1)?,
                    reference_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for request in &due {
        tx.execute(
            "UPDATE approval_requests SET status = 'expired' WHERE id = ?1",
            params![request.id],
        )?;
        super::audit(&tx, &request.id, "expired", None, None)?;
        if let Some(reference_id) = &request.reference_id {
            tx.execute(
                "UPDATE ops_actions SET status = ?2 WHERE id = ?1",
                params![reference_id, OpsActionStatus::Rejected],
            )?;
        }
    }

    tx.commit()?;
    Ok(due)
}

/// One sweep: expire locally, then announce. Returns the count processed.
pub async fn sweep(db: &Db, bus: &dyn EventBus) -> anyhow::Result<u32> {
    let expired = {
        let mut conn = db.lock().await;
        expire_due(&mut conn, now_ts())?
    };

    for request in &expired {
        let payload = serde_json::json!({
            "request_id": request.id,
            "request_type": request.request_type,
            "reference_id": request.reference_id,
        });
        if let Err(err) = bus.publish("approval.request.expired", &payload).await {
            warn!(request_id = %request.id, error = %format!("{err:#}"), "expiry event publish failed");
        }
    }

    Ok(expired.len() as u32)
}

/// Long-running loop for the `expiry-worker` process.
pub async fn run(db: Db, bus: Arc<dyn EventBus>, interval: std::time::Duration) {
    info!(interval_secs = interval.as_secs(), "approval expiry worker started");
    loop {
        match sweep(&db, bus.as_ref()).await {
            Ok(0) => {}
            Ok(count) => info!(count, "expired approval requests"),
            Err(err) => warn!(error = %format!("{err:#}"), "expiry sweep failed"),
        }
        tokio::time::sleep(interval).await;
    }
}
