use axum::Json;
use axum::extract::State;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::model::session::UssdReply;
use crate::ussd::{self, GatewayRequest};

/// Gateway boundary: one dialogue turn in, one reply out. Store failures
/// surface as 500 so the gateway retries; the engine rehydrates all state
/// from the store, so a retried turn is harmless.
pub async fn turn(
    State(state): State<AppState>,
    Json(req): Json<GatewayRequest>,
) -> Result<Json<UssdReply>, ApiError> {
    let mut conn = state.db.lock().await;
    let reply = ussd::handle_turn(&mut conn, &state.ussd, &req)?;
    Ok(Json(reply))
}
