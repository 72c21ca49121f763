use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, put};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::snapshot::DriverSnapshotProvider;
use crate::error::AppError;
use crate::models::driver::DriverRecord;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", get(list_drivers))
        .route("/drivers/snapshot", put(publish_snapshot))
}

#[derive(Deserialize)]
pub struct PublishSnapshotRequest {
    pub drivers: Vec<DriverRecord>,
}

#[derive(Serialize)]
pub struct PublishSnapshotResponse {
    pub drivers: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
}

async fn publish_snapshot(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PublishSnapshotRequest>,
) -> Result<Json<PublishSnapshotResponse>, AppError> {
    let mut drivers = payload.drivers;
    for driver in &drivers {
        let valid_location = (-90.0..=90.0).contains(&driver.location.lat)
            && (-180.0..=180.0).contains(&driver.location.lng);
        if !valid_location {
            return Err(AppError::BadRequest(format!(
                "driver {} has an invalid location",
                driver.driver_id
            )));
        }
    }
    for driver in &mut drivers {
        driver.rating = driver.rating.clamp(0.0, 5.0);
    }

    let count = drivers.len();
    state
        .snapshot
        .publish(drivers)
        .map_err(|err| AppError::Internal(err.to_string()))?;

    info!(drivers = count, "driver snapshot published");

    Ok(Json(PublishSnapshotResponse {
        drivers: count,
        refreshed_at: state.snapshot.refreshed_at(),
    }))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<DriverRecord>>, AppError> {
    let drivers = state
        .snapshot
        .available_drivers()
        .await
        .map_err(|err| AppError::Unavailable(err.to_string()))?;

    Ok(Json((*drivers).clone()))
}
