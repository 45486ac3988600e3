pub mod expiry;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

use crate::model::approval::{
    ApprovalPolicy, ApprovalRequest, ApprovalStatus, OpsAction, OpsActionStatus, Signature,
};
use crate::store::now_ts;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval policy `{0}` not found")]
    PolicyNotFound(String),
    #[error("approval request `{0}` not found")]
    NotFound(String),
    #[error("approval request `{id}` is {status} and accepts no further action")]
    Terminal { id: String, status: ApprovalStatus },
    #[error("approval request `{0}` has expired")]
    Expired(String),
    #[error("`{signer}` has already signed this request")]
    AlreadySigned { signer: String },
    #[error("`{signer}` holds none of the roles this policy allows")]
    RoleNotAllowed { signer: String },
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

/// Result of a signature: the updated request, and whether this signature
/// was the one that crossed the threshold. The `approved` announcement
/// happens exactly once, on the crossing signature.
#[derive(Debug)]
pub struct SignOutcome {
    pub request: ApprovalRequest,
    pub newly_approved: bool,
}

pub fn create_request(
    conn: &mut Connection,
    request_type: &str,
    reference_id: Option<&str>,
    policy_id: &str,
    requested_by: &str,
    metadata: serde_json::Value,
) -> Result<ApprovalRequest, ApprovalError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let policy = load_policy(&tx, policy_id)?
        .ok_or_else(|| ApprovalError::PolicyNotFound(policy_id.to_string()))?;

    let now = now_ts();
    let request = ApprovalRequest {
        id: uuid::Uuid::new_v4().to_string(),
        request_type: request_type.to_string(),
        reference_id: reference_id.map(str::to_string),
        policy_id: policy_id.to_string(),
        required_threshold: policy.required_signatures,
        requested_by: requested_by.to_string(),
        status: ApprovalStatus::Open,
        expires_at: now + policy.ttl_seconds,
        metadata,
        created_at: now,
    };
    tx.execute(
        "INSERT INTO approval_requests
             (id, request_type, reference_id, policy_id, required_threshold,
              requested_by, status, expires_at, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            request.id,
            request.request_type,
            request.reference_id,
            request.policy_id,
            request.required_threshold,
            request.requested_by,
            request.status,
            request.expires_at,
            request.metadata.to_string(),
            request.created_at,
        ],
    )?;
    audit(&tx, &request.id, "created", Some(requested_by), None)?;
    tx.commit()?;
    Ok(request)
}

/// Append one signature under the request's row lock and advance the status.
pub fn sign(
    conn: &mut Connection,
    request_id: &str,
    signer: &str,
    signer_roles: &[String],
    comment: Option<&str>,
) -> Result<SignOutcome, ApprovalError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_ts();

    let mut request = load_request(&tx, request_id)?
        .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

    if request.status.is_terminal() {
        return Err(ApprovalError::Terminal { id: request.id, status: request.status });
    }
    if now >= request.expires_at {
        return Err(ApprovalError::Expired(request.id));
    }

    let already: i64 = tx.query_row(
        "SELECT COUNT(*) FROM approval_signatures WHERE request_id = ?1 AND signer = ?2",
        params![request_id, signer],
        |row| row.get(0),
    )?;
    if already > 0 {
        return Err(ApprovalError::AlreadySigned { signer: signer.to_string() });
    }

    let policy = load_policy(&tx, &request.policy_id)?
        .ok_or_else(|| ApprovalError::PolicyNotFound(request.policy_id.clone()))?;
    if !signer_roles.iter().any(|r| policy.allowed_roles.contains(r)) {
        return Err(ApprovalError::RoleNotAllowed { signer: signer.to_string() });
    }

    tx.execute(
        "INSERT INTO approval_signatures (id, request_id, signer, roles, signed_at, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            request_id,
            signer,
            serde_json::to_string(signer_roles).unwrap_or_else(|_| "[]".into()),
            now,
            comment,
        ],
    )?;
    audit(&tx, request_id, "signed", Some(signer), comment)?;

    let signature_count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM approval_signatures WHERE request_id = ?1",
        params![request_id],
        |row| row.get(0),
    )?;

    let mut newly_approved = false;
    if signature_count >= request.required_threshold as i64 {
        request.status = ApprovalStatus::Approved;
        newly_approved = true;
        audit(&tx, request_id, "approved", None, None)?;
        if let Some(reference_id) = &request.reference_id {
            set_ops_action_status(&tx, reference_id, OpsActionStatus::Authorized)?;
        }
    } else if request.status == ApprovalStatus::Open {
        request.status = ApprovalStatus::PartiallyApproved;
    }

    tx.execute(
        "UPDATE approval_requests SET status = ?2 WHERE id = ?1",
        params![request_id, request.status],
    )?;

    tx.commit()?;
    Ok(SignOutcome { request, newly_approved })
}

/// Terminal rejection by one qualified operator.
pub fn reject(
    conn: &mut Connection,
    request_id: &str,
    signer: &str,
    reason: &str,
) -> Result<ApprovalRequest, ApprovalError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut request = load_request(&tx, request_id)?
        .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;
    if request.status.is_terminal() {
        return Err(ApprovalError::Terminal { id: request.id, status: request.status });
    }

    request.status = ApprovalStatus::Rejected;
    tx.execute(
        "UPDATE approval_requests SET status = 'rejected' WHERE id = ?1",
        params![request_id],
    )?;
    audit(&tx, request_id, "rejected", Some(signer), Some(reason))?;
    if let Some(reference_id) = &request.reference_id {
        set_ops_action_status(&tx, reference_id, OpsActionStatus::Rejected)?;
    }

    tx.commit()?;
    Ok(request)
}

pub fn get_request(
    conn: &Connection,
    request_id: &str,
) -> Result<(ApprovalRequest, Vec<Signature>), ApprovalError> {
    let request = load_request(conn, request_id)?
        .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;
    let signatures = signatures_of(conn, request_id)?;
    Ok((request, signatures))
}

pub fn list_requests(
    conn: &Connection,
    status: Option<ApprovalStatus>,
    request_type: Option<&str>,
) -> Result<Vec<ApprovalRequest>, ApprovalError> {
    let mut sql = format!("{REQUEST_SELECT} WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(status) = status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status.as_str().to_string()));
    }
    if let Some(request_type) = request_type {
        sql.push_str(" AND request_type = ?");
        params_vec.push(Box::new(request_type.to_string()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            request_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Gated privileged operation; created `pending_approval` and linked from a
/// request via `reference_id`.
pub fn create_ops_action(
    conn: &Connection,
    action_type: &str,
    payload: serde_json::Value,
) -> Result<OpsAction, ApprovalError> {
    let action = OpsAction {
        id: uuid::Uuid::new_v4().to_string(),
        action_type: action_type.to_string(),
        status: OpsActionStatus::PendingApproval,
        payload,
        created_at: now_ts(),
    };
    conn.execute(
        "INSERT INTO ops_actions (id, action_type, status, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            action.id,
            action.action_type,
            action.status,
            action.payload.to_string(),
            action.created_at,
        ],
    )?;
    Ok(action)
}

pub fn get_ops_action(conn: &Connection, id: &str) -> Result<Option<OpsAction>, ApprovalError> {
    let action = conn
        .query_row(
            "SELECT id, action_type, status, payload, created_at FROM ops_actions WHERE id = ?1",
            params![id],
            |row| {
                Ok(OpsAction {
                    id: row.get(0)?,
                    action_type: row.get(1)?,
                    status: row.get(2)?,
                    payload: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(action)
}

fn set_ops_action_status(
    conn: &Connection,
    id: &str,
    status: OpsActionStatus,
) -> Result<(), ApprovalError> {
    conn.execute(
        "UPDATE ops_actions SET status = ?2 WHERE id = ?1",
        params![id, status],
    )?;
    Ok(())
}

pub(crate) fn audit(
    conn: &Connection,
    request_id: &str,
    event: &str,
    actor: Option<&str>,
    detail: Option<&str>,
) -> Result<(), ApprovalError> {
    conn.execute(
        "INSERT INTO approval_audit (request_id, event, actor, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![request_id, event, actor, detail, now_ts()],
    )?;
    Ok(())
}

// ── Row access ──────────────────────────────────────────────────────

const REQUEST_SELECT: &str = "SELECT id, request_type, reference_id, policy_id,
        required_threshold, requested_by, status, expires_at, metadata, created_at
 FROM approval_requests";

fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    Ok(ApprovalRequest {
        id: row.get(0)?,
        request_type: row.get(1)?,
        reference_id: row.get(2)?,
        policy_id: row.get(3)?,
        required_threshold: row.get(4)?,
        requested_by: row.get(5)?,
        status: row.get(6)?,
        expires_at: row.get(7)?,
        metadata: serde_json::from_str(&row.get::<_, String>(8)?)
            .unwrap_or(serde_json::Value::Null),
        created_at: row.get(9)?,
    })
}

pub(crate) fn load_request(
    conn: &Connection,
    request_id: &str,
) -> Result<Option<ApprovalRequest>, ApprovalError> {
    let request = conn
        .query_row(
            &format!("{REQUEST_SELECT} WHERE id = ?1"),
            params![request_id],
            request_from_row,
        )
        .optional()?;
    Ok(request)
}

pub fn signatures_of(
    conn: &Connection,
    request_id: &str,
) -> Result<Vec<Signature>, ApprovalError> {
    let mut stmt = conn.prepare(
        "SELECT id, request_id, signer, roles, signed_at, comment
         FROM approval_signatures WHERE request_id = ?1 ORDER BY signed_at, rowid",
    )?;
    let rows = stmt
        .query_map(params![request_id], |row| {
            Ok(Signature {
                id: row.get(0)?,
                request_id: row.get(1)?,
                signer: row.get(2)?,
                roles: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                signed_at: row.get(4)?,
                comment: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_policy(conn: &Connection, policy_id: &str) -> Result<Option<ApprovalPolicy>, ApprovalError> {
    let policy = conn
        .query_row(
            "SELECT policy_id, required_signatures, allowed_roles, ttl_seconds
             FROM approval_policies WHERE policy_id = ?1",
            params![policy_id],
            |row| {
                Ok(ApprovalPolicy {
                    policy_id: row.get(0)?,
                    required_signatures: row.get(1)?,
                    allowed_roles: serde_json::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or_default(),
                    ttl_seconds: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(policy)
}
