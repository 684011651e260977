//! Handler for the caller's credit summary.

use axum::extract::State;
use axum::Json;
use pagecraft_pipeline::CreditSummary;

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/credits
pub async fn summary(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<DataResponse<CreditSummary>>> {
    let summary = state.generation.credits(user.account_id).await?;
    Ok(Json(DataResponse { data: summary }))
}
