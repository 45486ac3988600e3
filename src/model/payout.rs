use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutPriority {
    Normal,
    Priority,
}

text_enum!(PayoutPriority {
    Normal => "normal",
    Priority => "priority",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
}

text_enum!(PayoutStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
});

/// Routing verdict from the risk oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Instant,
    Batch,
    Hold,
    Escrow,
    Advance,
}

text_enum!(RecommendedAction {
    Instant => "instant",
    Batch => "batch",
    Hold => "hold",
    Escrow => "escrow",
    Advance => "advance",
});

/// Parent payout. Immutable once its slices are inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutParent {
    pub id: String,
    /// Client idempotency key; unique-indexed, resolves replays.
    pub external_id: String,
    pub origin: String,
    pub seller_ref: String,
    pub currency: String,
    pub requested_amount_minor: i64,
    pub priority: PayoutPriority,
    pub reference_code: String,
    pub status: PayoutStatus,
    pub metadata: Value,
    pub created_at: i64,
}

/// One leg of a payout. Slice amounts sum to the parent's requested amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutSlice {
    pub id: String,
    pub parent_id: String,
    pub treasury_account_id: String,
    pub amount_minor: i64,
    pub order_index: u32,
    pub dispatched_at: Option<i64>,
}

/// Per-slice advice inside a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceAdvice {
    pub treasury_account_id: String,
    pub amount_minor: i64,
}

/// Persisted output of one oracle consultation. Kept even when the attempt
/// ends in a hold rather than a payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiraRecommendation {
    pub id: String,
    pub seller_ref: String,
    pub priority_score: i64,
    pub risk_score: i64,
    pub multi_bank: bool,
    pub recommended_action: RecommendedAction,
    pub slices: Option<Vec<SliceAdvice>>,
    pub treasury_account_id: Option<String>,
    pub reasons: Vec<String>,
    pub model_version: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerEscrow {
    pub id: String,
    pub seller_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub reason: String,
    pub risk_score: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Pending,
    Verified,
    Rejected,
}

text_enum!(KycStatus {
    Pending => "pending",
    Verified => "verified",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seller {
    pub id: String,
    pub marketplace: String,
    pub seller_ref: String,
    pub kyc_status: KycStatus,
    pub advance_limit_minor: i64,
}

/// Cash advance against future sales. Fee is fixed at 5% of the amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advance {
    pub id: String,
    pub external_id: String,
    pub seller_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub fee_minor: i64,
    pub repayment_schedule: String,
    pub status: String,
    pub created_at: i64,
}
