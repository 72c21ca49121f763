use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;
use tracing::debug;

use crate::error::AppError;
use crate::models::assignment::OfferResponse;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/offers/responses", post(report_response))
}

/// Driver answers relayed by the notification gateway.
async fn report_response(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OfferResponse>,
) -> Result<StatusCode, AppError> {
    let order_id = payload.order_id;
    let driver_id = payload.driver_id;

    if !state.responses.route(payload) {
        return Err(AppError::Conflict(format!(
            "order {order_id} is not waiting on offers"
        )));
    }

    debug!(order_id = %order_id, driver_id = %driver_id, "offer response routed");
    Ok(StatusCode::ACCEPTED)
}
