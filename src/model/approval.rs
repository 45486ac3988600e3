use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Open,
    PartiallyApproved,
    Approved,
    Rejected,
    Expired,
}

text_enum!(ApprovalStatus {
    Open => "open",
    PartiallyApproved => "partially_approved",
    Approved => "approved",
    Rejected => "rejected",
    Expired => "expired",
});

impl ApprovalStatus {
    /// Once terminal, no further signatures are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }
}

/// Signature policy: how many role-qualified signers a request type needs
/// and how long the request stays signable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub policy_id: String,
    pub required_signatures: u32,
    pub allowed_roles: Vec<String>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub request_type: String,
    /// Linked ops action, if any; follows the request's outcome.
    pub reference_id: Option<String>,
    pub policy_id: String,
    pub required_threshold: u32,
    pub requested_by: String,
    pub status: ApprovalStatus,
    pub expires_at: i64,
    pub metadata: Value,
    pub created_at: i64,
}

/// Immutable record that one operator endorsed a request. A signer appears
/// at most once per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub id: String,
    pub request_id: String,
    pub signer: String,
    pub roles: Vec<String>,
    pub signed_at: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsActionStatus {
    PendingApproval,
    Authorized,
    Rejected,
}

text_enum!(OpsActionStatus {
    PendingApproval => "pending_approval",
    Authorized => "authorized",
    Rejected => "rejected",
});

/// Privileged operation gated behind an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsAction {
    pub id: String,
    pub action_type: String,
    pub status: OpsActionStatus,
    pub payload: Value,
    pub created_at: i64,
}
