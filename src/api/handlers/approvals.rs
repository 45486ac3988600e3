use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::approval;
use crate::model::approval::{ApprovalRequest, ApprovalStatus, Signature};

const MUTATOR_ROLES: &[&str] = &["pay_admin", "fraud_ops", "compliance"];

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub request_type: String,
    pub reference_id: Option<String>,
    pub policy_id: String,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    json!({})
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateBody>,
) -> Result<Json<ApprovalRequest>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let mut conn = state.db.lock().await;
    let request = approval::create_request(
        &mut conn,
        &body.request_type,
        body.reference_id.as_deref(),
        &body.policy_id,
        &user.subject,
        body.metadata,
    )?;
    Ok(Json(request))
}

#[derive(Debug, Deserialize, Default)]
pub struct SignBody {
    pub comment: Option<String>,
}

pub async fn sign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Option<Json<SignBody>>,
) -> Result<Json<ApprovalRequest>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let comment = body.and_then(|Json(b)| b.comment);

    let outcome = {
        let mut conn = state.db.lock().await;
        approval::sign(&mut conn, &id, &user.subject, &user.roles, comment.as_deref())?
    };

    // The threshold crossing is announced at most once, after commit.
    if outcome.newly_approved {
        let payload = json!({
            "request_id": outcome.request.id,
            "request_type": outcome.request.request_type,
        });
        if let Err(err) = state.bus.publish("approval.request.approved", &payload).await {
            warn!(request_id = %outcome.request.id, error = %format!("{err:#}"), "approval event publish failed");
        }
    }

    Ok(Json(outcome.request))
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub reason: String,
}

pub async fn reject(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<ApprovalRequest>, ApiError> {
    user.require_any(MUTATOR_ROLES)?;
    let mut conn = state.db.lock().await;
    let request = approval::reject(&mut conn, &id, &user.subject, &body.reason)?;
    Ok(Json(request))
}

#[derive(Debug, Serialize)]
pub struct RequestWithSignatures {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub signatures: Vec<Signature>,
}

pub async fn get_one(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<RequestWithSignatures>, ApiError> {
    let conn = state.db.lock().await;
    let (request, signatures) = approval::get_request(&conn, &id)?;
    Ok(Json(RequestWithSignatures { request, signatures }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub request_type: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ApprovalRequest>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ApprovalStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status `{raw}`")))?,
        ),
        None => None,
    };

    let conn = state.db.lock().await;
    let requests = approval::list_requests(&conn, status, query.request_type.as_deref())?;
    Ok(Json(requests))
}
