//! Platform admin routes

use axum::{
    extract::{Extension, State},
    Json,
};
use shopsub_billing::InvariantCheckSummary;
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth.require_admin()?;
    let summary = state
        .billing
        .invariants
        .run_all_checks(OffsetDateTime::now_utc())
        .await?;
    tracing::info!(
        actor_id = %auth.actor.id,
        healthy = summary.healthy,
        violations = summary.violations.len(),
        "Invariant checks run on request"
    );
    Ok(Json(summary))
}
