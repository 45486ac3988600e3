use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::payout::{Advance, PayoutSlice};
use crate::payout::sira::PayoutMode;
use crate::payout::{
    self, AdvanceRequest, SmartPayoutOutcome, SmartPayoutRequest, list_pending_slices,
};

fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("idempotency-key header is required".into()))
}

#[derive(Debug, Deserialize)]
pub struct SmartPayoutBody {
    pub requested_amount: i64,
    pub currency: String,
    #[serde(default)]
    pub mode: PayoutMode,
}

pub async fn smart_payout(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((marketplace, seller_ref)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<SmartPayoutBody>,
) -> Result<Json<SmartPayoutOutcome>, ApiError> {
    let idempotency_key = idempotency_key(&headers)?;

    let req = SmartPayoutRequest {
        marketplace,
        seller_ref,
        requested_amount_minor: body.requested_amount,
        currency: body.currency,
        mode: body.mode,
        idempotency_key,
    };

    let mut conn = state.db.lock().await;
    let outcome =
        payout::smart_payout(&mut conn, state.oracle.as_ref(), state.oracle_timeout, &req).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct AdvanceBody {
    pub amount: i64,
    pub currency: String,
}

pub async fn request_advance(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((marketplace, seller_ref)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<AdvanceBody>,
) -> Result<Json<Advance>, ApiError> {
    let idempotency_key = idempotency_key(&headers)?;

    let req = AdvanceRequest {
        marketplace,
        seller_ref,
        amount_minor: body.amount,
        currency: body.currency,
        idempotency_key,
    };

    let mut conn = state.db.lock().await;
    let advance = payout::request_advance(&mut conn, &req)?;
    Ok(Json(advance))
}

#[derive(Debug, Deserialize)]
pub struct PendingSlicesQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Worker-facing FIFO feed of undispatched slices.
pub async fn pending_slices(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<PendingSlicesQuery>,
) -> Result<Json<Vec<PayoutSlice>>, ApiError> {
    let conn = state.db.lock().await;
    let slices = list_pending_slices(&conn, query.limit)?;
    Ok(Json(slices))
}
