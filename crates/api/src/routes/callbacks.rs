//! Gateway callback endpoint
//!
//! Always answers 200 with an acknowledgement. Anything else would make the
//! gateway retry the same notification indefinitely; internal failures are
//! logged by the engine for reconciliation instead.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use shopsub_billing::{CallbackAck, SIGNATURE_HEADER};

use crate::state::AppState;

pub async fn gateway_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<CallbackAck> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = state
        .billing
        .settlement
        .handle_gateway_callback(&body, signature)
        .await;

    tracing::debug!(outcome = ?ack.outcome, "Gateway callback acknowledged");
    Json(ack)
}
