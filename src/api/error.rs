use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::approval::ApprovalError;
use crate::payout::PayoutError;
use crate::rollout::RolloutError;
use crate::simulator::SimError;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<PayoutError> for ApiError {
    fn from(err: PayoutError) -> Self {
        match &err {
            PayoutError::MissingIdempotencyKey
            | PayoutError::NonPositiveAmount
            | PayoutError::KycNotVerified(_)
            | PayoutError::SellerHeld(_)
            | PayoutError::AdvanceUnavailable { .. } => ApiError::BadRequest(err.to_string()),
            PayoutError::SellerNotFound(_) => ApiError::NotFound(err.to_string()),
            PayoutError::SliceSumMismatch | PayoutError::Store(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match &err {
            ApprovalError::PolicyNotFound(_) | ApprovalError::Expired(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ApprovalError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ApprovalError::Terminal { .. } | ApprovalError::AlreadySigned { .. } => {
                ApiError::Conflict(err.to_string())
            }
            ApprovalError::RoleNotAllowed { .. } => ApiError::Forbidden(err.to_string()),
            ApprovalError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(err: RolloutError) -> Self {
        match &err {
            RolloutError::PercentageOutOfRange(_)
            | RolloutError::ThresholdOutOfRange(_)
            | RolloutError::BackupRequired { .. } => ApiError::BadRequest(err.to_string()),
            RolloutError::NotFound(_) | RolloutError::AttemptNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            RolloutError::Terminal { .. } | RolloutError::AttemptCompleted(_) => {
                ApiError::Conflict(err.to_string())
            }
            RolloutError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SimError> for ApiError {
    fn from(err: SimError) -> Self {
        match &err {
            SimError::RunNotFound(_) => ApiError::NotFound(err.to_string()),
            SimError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}
