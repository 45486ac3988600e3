pub mod sira;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::model::payout::{
    Advance, KycStatus, PayoutParent, PayoutPriority, PayoutSlice, PayoutStatus,
    RecommendedAction, Seller, SellerEscrow, SiraRecommendation,
};
use crate::store::{now_ms, now_ts};
use self::sira::{PayoutContext, PayoutMode, Recommendation, RiskOracle, fallback_recommendation};

const ESCROW_REASON: &str = "sira_risk_hold";
const DEFAULT_TREASURY: &str = "TREAS-DEFAULT";
const PRIORITY_SCORE_CUTOFF: i64 = 85;
const ADVANCE_FEE_PCT: i64 = 5;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("idempotency key is required")]
    MissingIdempotencyKey,
    #[error("requested amount must be positive")]
    NonPositiveAmount,
    #[error("seller `{0}` not found in marketplace")]
    SellerNotFound(String),
    #[error("seller `{0}` KYC is not verified")]
    KycNotVerified(String),
    #[error("seller `{0}` has active holds")]
    SellerHeld(String),
    #[error("advance exceeds available limit; {available} available")]
    AdvanceUnavailable { available: i64 },
    #[error("oracle slices do not sum to the requested amount")]
    SliceSumMismatch,
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct SmartPayoutRequest {
    pub marketplace: String,
    pub seller_ref: String,
    pub requested_amount_minor: i64,
    pub currency: String,
    pub mode: PayoutMode,
    pub idempotency_key: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SmartPayoutOutcome {
    Held {
        escrow: SellerEscrow,
        recommendation: SiraRecommendation,
    },
    Created {
        parent_payout: PayoutParent,
        slices: Vec<PayoutSlice>,
        recommendation: Option<SiraRecommendation>,
    },
}

/// Idempotent payout creation with risk-driven routing.
///
/// The caller holds the store lock for the whole call, so the oracle
/// consultation is serialized with the write transaction: a persisted
/// recommendation can never be orphaned from its attempt, and no other
/// writer can interleave between the idempotency check and the insert.
pub async fn smart_payout(
    conn: &mut Connection,
    oracle: &dyn RiskOracle,
    oracle_timeout: std::time::Duration,
    req: &SmartPayoutRequest,
) -> Result<SmartPayoutOutcome, PayoutError> {
    if req.idempotency_key.trim().is_empty() {
        return Err(PayoutError::MissingIdempotencyKey);
    }
    if req.requested_amount_minor <= 0 {
        return Err(PayoutError::NonPositiveAmount);
    }

    // Replay: a payout or a hold already recorded under this key is the
    // result, status unchanged.
    if let Some(parent) = find_parent_by_external_id(conn, &req.idempotency_key)? {
        let slices = slices_of(conn, &parent.id)?;
        let recommendation = find_recommendation_by_external_id(conn, &req.idempotency_key)?;
        return Ok(SmartPayoutOutcome::Created { parent_payout: parent, slices, recommendation });
    }
    if let Some(escrow) = find_escrow_by_external_id(conn, &req.idempotency_key)? {
        // Escrows are written in the same transaction as their recommendation.
        if let Some(recommendation) = find_recommendation_by_external_id(conn, &req.idempotency_key)? {
            return Ok(SmartPayoutOutcome::Held { escrow, recommendation });
        }
    }

    let seller = load_seller(conn, &req.marketplace, &req.seller_ref)?
        .ok_or_else(|| PayoutError::SellerNotFound(req.seller_ref.clone()))?;
    if seller.kyc_status != KycStatus::Verified {
        return Err(PayoutError::KycNotVerified(req.seller_ref.clone()));
    }
    if has_active_holds(conn, &req.seller_ref)? {
        return Err(PayoutError::SellerHeld(req.seller_ref.clone()));
    }

    let ctx = PayoutContext {
        marketplace: req.marketplace.clone(),
        seller_ref: req.seller_ref.clone(),
        amount_minor: req.requested_amount_minor,
        currency: req.currency.clone(),
        mode: req.mode,
    };

    let rec = match tokio::time::timeout(oracle_timeout, oracle.recommend(&ctx)).await {
        Ok(Ok(rec)) => rec,
        Ok(Err(err)) => {
            warn!(seller = %req.seller_ref, error = %format!("{err:#}"), "sira oracle failed, using fallback");
            fallback_recommendation(&ctx)
        }
        Err(_) => {
            warn!(seller = %req.seller_ref, "sira oracle timed out, using fallback");
            fallback_recommendation(&ctx)
        }
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_ts();

    let recommendation = persist_recommendation(&tx, &req.idempotency_key, &req.seller_ref, &rec, now)?;

    let outcome = match rec.recommended_action {
        RecommendedAction::Hold | RecommendedAction::Escrow => {
            let escrow = SellerEscrow {
                id: uuid::Uuid::new_v4().to_string(),
                seller_ref: req.seller_ref.clone(),
                amount_minor: req.requested_amount_minor,
                currency: req.currency.clone(),
                reason: ESCROW_REASON.to_string(),
                risk_score: rec.risk_score,
                created_at: now,
            };
            tx.execute(
                "INSERT INTO seller_escrows
                     (id, external_id, seller_ref, amount_minor, currency, reason, risk_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    escrow.id,
                    req.idempotency_key,
                    escrow.seller_ref,
                    escrow.amount_minor,
                    escrow.currency,
                    escrow.reason,
                    escrow.risk_score,
                    escrow.created_at,
                ],
            )?;
            SmartPayoutOutcome::Held { escrow, recommendation }
        }
        _ => {
            let priority = if rec.priority_score >= PRIORITY_SCORE_CUTOFF {
                PayoutPriority::Priority
            } else {
                PayoutPriority::Normal
            };

            let parent = PayoutParent {
                id: uuid::Uuid::new_v4().to_string(),
                external_id: req.idempotency_key.clone(),
                origin: req.marketplace.clone(),
                seller_ref: req.seller_ref.clone(),
                currency: req.currency.clone(),
                requested_amount_minor: req.requested_amount_minor,
                priority,
                reference_code: reference_code(),
                status: PayoutStatus::Pending,
                metadata: serde_json::json!({}),
                created_at: now,
            };
            tx.execute(
                "INSERT INTO payout_parents
                     (id, external_id, origin, seller_ref, currency, requested_amount_minor,
                      priority, reference_code, status, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    parent.id,
                    parent.external_id,
                    parent.origin,
                    parent.seller_ref,
                    parent.currency,
                    parent.requested_amount_minor,
                    parent.priority,
                    parent.reference_code,
                    parent.status,
                    parent.metadata.to_string(),
                    parent.created_at,
                ],
            )?;

            let plan: Vec<(String, i64)> = match (rec.multi_bank, &rec.slices) {
                (true, Some(slices)) if !slices.is_empty() => {
                    let sum: i64 = slices.iter().map(|s| s.amount_minor).sum();
                    if sum != req.requested_amount_minor {
                        return Err(PayoutError::SliceSumMismatch);
                    }
                    slices
                        .iter()
                        .map(|s| (s.treasury_account_id.clone(), s.amount_minor))
                        .collect()
                }
                _ => vec![(
                    rec.treasury_account_id
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TREASURY.to_string()),
                    req.requested_amount_minor,
                )],
            };

            let mut slices = Vec::with_capacity(plan.len());
            for (i, (treasury, amount)) in plan.into_iter().enumerate() {
                let slice = PayoutSlice {
                    id: uuid::Uuid::new_v4().to_string(),
                    parent_id: parent.id.clone(),
                    treasury_account_id: treasury,
                    amount_minor: amount,
                    order_index: (i + 1) as u32,
                    dispatched_at: None,
                };
                tx.execute(
                    "INSERT INTO payout_slices
                         (id, parent_id, treasury_account_id, amount_minor, order_index)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        slice.id,
                        slice.parent_id,
                        slice.treasury_account_id,
                        slice.amount_minor,
                        slice.order_index,
                    ],
                )?;
                slices.push(slice);
            }

            SmartPayoutOutcome::Created {
                parent_payout: parent,
                slices,
                recommendation: Some(recommendation),
            }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

/// `SPO-<unix_ms>-<8 hex uppercase>`.
fn reference_code() -> String {
    format!("SPO-{}-{:08X}", now_ms(), rand::random::<u32>())
}

// ── Advances ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdvanceRequest {
    pub marketplace: String,
    pub seller_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub idempotency_key: String,
}

/// Idempotent cash-advance creation: fixed 5% fee, repaid from future sales.
pub fn request_advance(conn: &mut Connection, req: &AdvanceRequest) -> Result<Advance, PayoutError> {
    if req.idempotency_key.trim().is_empty() {
        return Err(PayoutError::MissingIdempotencyKey);
    }
    if req.amount_minor <= 0 {
        return Err(PayoutError::NonPositiveAmount);
    }

    if let Some(existing) = find_advance_by_external_id(conn, &req.idempotency_key)? {
        return Ok(existing);
    }

    let seller = load_seller(conn, &req.marketplace, &req.seller_ref)?
        .ok_or_else(|| PayoutError::SellerNotFound(req.seller_ref.clone()))?;
    if seller.kyc_status != KycStatus::Verified {
        return Err(PayoutError::KycNotVerified(req.seller_ref.clone()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let available = max_advance_available(&tx, &seller)?;
    if available < req.amount_minor {
        return Err(PayoutError::AdvanceUnavailable { available });
    }

    let advance = Advance {
        id: uuid::Uuid::new_v4().to_string(),
        external_id: req.idempotency_key.clone(),
        seller_ref: req.seller_ref.clone(),
        amount_minor: req.amount_minor,
        currency: req.currency.clone(),
        fee_minor: req.amount_minor * ADVANCE_FEE_PCT / 100,
        repayment_schedule: "future_sales".to_string(),
        status: "requested".to_string(),
        created_at: now_ts(),
    };
    tx.execute(
        "INSERT INTO advances
             (id, external_id, seller_ref, amount_minor, currency, fee_minor,
              repayment_schedule, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            advance.id,
            advance.external_id,
            advance.seller_ref,
            advance.amount_minor,
            advance.currency,
            advance.fee_minor,
            advance.repayment_schedule,
            advance.status,
            advance.created_at,
        ],
    )?;
    tx.commit()?;
    Ok(advance)
}

/// Outstanding-aware headroom: the seller's limit minus every advance that
/// has not finished repaying.
fn max_advance_available(conn: &Connection, seller: &Seller) -> Result<i64, PayoutError> {
    let outstanding: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_minor), 0) FROM advances
         WHERE seller_ref = ?1 AND status NOT IN ('repaid', 'rejected')",
        params![seller.seller_ref],
        |row| row.get(0),
    )?;
    Ok((seller.advance_limit_minor - outstanding).max(0))
}

// ── Dispatch projection ─────────────────────────────────────────────

/// Undispatched slices of live parents, in insertion order, for the FIFO
/// dispatch worker.
pub fn list_pending_slices(conn: &Connection, limit: u32) -> Result<Vec<PayoutSlice>, PayoutError> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, treasury_account_id, amount_minor, order_index, dispatched_at
         FROM active_payout_slices ORDER BY seq LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], slice_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_slice_dispatched(conn: &Connection, slice_id: &str) -> Result<bool, PayoutError> {
    let n = conn.execute(
        "UPDATE payout_slices SET dispatched_at = ?2 WHERE id = ?1 AND dispatched_at IS NULL",
        params![slice_id, now_ts()],
    )?;
    Ok(n > 0)
}

/// Dispatch loop: drain pending slices FIFO and hand them to treasury
/// submission. The bank-side protocol lives behind the treasury gateway;
/// here a slice is dispatched the moment it is durably marked.
pub async fn run_dispatch_worker(db: crate::store::Db, batch: u32, interval: std::time::Duration) {
    tracing::info!(batch, "payout dispatch worker started");
    loop {
        let result: Result<usize, PayoutError> = {
            let conn = db.lock().await;
            list_pending_slices(&conn, batch).and_then(|slices| {
                let mut dispatched = 0;
                for slice in &slices {
                    if mark_slice_dispatched(&conn, &slice.id)? {
                        tracing::info!(
                            slice_id = %slice.id,
                            treasury = %slice.treasury_account_id,
                            amount = slice.amount_minor,
                            "slice dispatched"
                        );
                        dispatched += 1;
                    }
                }
                Ok(dispatched)
            })
        };
        match result {
            Ok(0) => tokio::time::sleep(interval).await,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "dispatch sweep failed");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

// ── Row access ──────────────────────────────────────────────────────

fn slice_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayoutSlice> {
    Ok(PayoutSlice {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        treasury_account_id: row.get(2)?,
        amount_minor: row.get(3)?,
        order_index: row.get(4)?,
        dispatched_at: row.get(5)?,
    })
}

fn find_parent_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<PayoutParent>, PayoutError> {
    let parent = conn
        .query_row(
            "SELECT id, external_id, origin, seller_ref, currency, requested_amount_minor,
                    priority, reference_code, status, metadata, created_at
             FROM payout_parents WHERE external_id = ?1",
            params![external_id],
            |row| {
                Ok(PayoutParent {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    origin: row.get(2)?,
                    seller_ref: row.get(3)?,
                    currency: row.get(4)?,
                    requested_amount_minor: row.get(5)?,
                    priority: row.get(6)?,
                    reference_code: row.get(7)?,
                    status: row.get(8)?,
                    metadata: serde_json::from_str(&row.get::<_, String>(9)?)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: row.get(10)?,
                })
            },
        )
        .optional()?;
    Ok(parent)
}

pub fn slices_of(conn: &Connection, parent_id: &str) -> Result<Vec<PayoutSlice>, PayoutError> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, treasury_account_id, amount_minor, order_index, dispatched_at
         FROM payout_slices WHERE parent_id = ?1 ORDER BY order_index",
    )?;
    let rows = stmt
        .query_map(params![parent_id], slice_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn find_recommendation_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<SiraRecommendation>, PayoutError> {
    let rec = conn
        .query_row(
            "SELECT id, seller_ref, priority_score, risk_score, multi_bank, recommended_action,
                    slices, treasury_account_id, reasons, model_version, created_at
             FROM sira_recommendations WHERE external_id = ?1",
            params![external_id],
            |row| {
                Ok(SiraRecommendation {
                    id: row.get(0)?,
                    seller_ref: row.get(1)?,
                    priority_score: row.get(2)?,
                    risk_score: row.get(3)?,
                    multi_bank: row.get(4)?,
                    recommended_action: row.get(5)?,
                    slices: row
                        .get::<_, Option<String>>(6)?
                        .and_then(|s| serde_json::from_str(&s).ok()),
                    treasury_account_id: row.get(7)?,
                    reasons: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
                    model_version: row.get(9)?,
                    created_at: row.get(10)?,
                })
            },
        )
        .optional()?;
    Ok(rec)
}

fn find_escrow_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<SellerEscrow>, PayoutError> {
    let escrow = conn
        .query_row(
            "SELECT id, seller_ref, amount_minor, currency, reason, risk_score, created_at
             FROM seller_escrows WHERE external_id = ?1",
            params![external_id],
            |row| {
                Ok(SellerEscrow {
                    id: row.get(0)?,
                    seller_ref: row.get(1)?,
                    amount_minor: row.get(2)?,
                    currency: row.get(3)?,
                    reason: row.get(4)?,
                    risk_score: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(escrow)
}

fn find_advance_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<Advance>, PayoutError> {
    let advance = conn
        .query_row(
            "SELECT id, external_id, seller_ref, amount_minor, currency, fee_minor,
                    repayment_schedule, status, created_at
             FROM advances WHERE external_id = ?1",
            params![external_id],
            |row| {
                Ok(Advance {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    seller_ref: row.get(2)?,
                    amount_minor: row.get(3)?,
                    currency: row.get(4)?,
                    fee_minor: row.get(5)?,
                    repayment_schedule: row.get(6)?,
                    status: row.get(7)?,
                    created_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(advance)
}

fn load_seller(
    conn: &Connection,
    marketplace: &str,
    seller_ref: &str,
) -> Result<Option<Seller>, PayoutError> {
    let seller = conn
        .query_row(
            "SELECT id, marketplace, seller_ref, kyc_status, advance_limit_minor
             FROM sellers WHERE marketplace = ?1 AND seller_ref = ?2",
            params![marketplace, seller_ref],
            |row| {
                Ok(Seller {
                    id: row.get(0)?,
                    marketplace: row.get(1)?,
                    seller_ref: row.get(2)?,
                    kyc_status: row.get(3)?,
                    advance_limit_minor: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(seller)
}

fn has_active_holds(conn: &Connection, seller_ref: &str) -> Result<bool, PayoutError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM seller_holds WHERE seller_ref = ?1 AND status = 'active'",
        params![seller_ref],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

fn persist_recommendation(
    conn: &Connection,
    external_id: &str,
    seller_ref: &str,
    rec: &Recommendation,
    now: i64,
) -> Result<SiraRecommendation, PayoutError> {
    let persisted = SiraRecommendation {
        id: uuid::Uuid::new_v4().to_string(),
        seller_ref: seller_ref.to_string(),
        priority_score: rec.priority_score,
        risk_score: rec.risk_score,
        multi_bank: rec.multi_bank,
        recommended_action: rec.recommended_action,
        slices: rec.slices.clone(),
        treasury_account_id: rec.treasury_account_id.clone(),
        reasons: rec.reasons.clone(),
        model_version: rec.model_version.clone(),
        created_at: now,
    };
    conn.execute(
        "INSERT INTO sira_recommendations
             (id, external_id, seller_ref, priority_score, risk_score, multi_bank,
              recommended_action, slices, treasury_account_id, reasons, model_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            persisted.id,
            external_id,
            persisted.seller_ref,
            persisted.priority_score,
            persisted.risk_score,
            persisted.multi_bank,
            persisted.recommended_action,
            persisted
                .slices
                .as_ref()
                .map(|s| serde_json::to_string(s).unwrap_or_else(|_| "[]".into())),
            persisted.treasury_account_id,
            serde_json::to_string(&persisted.reasons).unwrap_or_else(|_| "[]".into()),
            persisted.model_version,
            persisted.created_at,
        ],
    )?;
    Ok(persisted)
}
