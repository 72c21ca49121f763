use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::queue::enqueue_order;
use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::driver::GeoPoint;
use crate::models::order::{Order, OrderStatus, ServiceAreaClass};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/assignments", get(list_assignments))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub pickup: GeoPoint,
    pub service_area_class: ServiceAreaClass,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let valid_pickup = (-90.0..=90.0).contains(&payload.pickup.lat)
        && (-180.0..=180.0).contains(&payload.pickup.lng);
    if !valid_pickup {
        return Err(AppError::BadRequest("pickup is not a valid coordinate".to_string()));
    }

    let order = Order {
        id: Uuid::new_v4(),
        pickup: payload.pickup,
        service_area_class: payload.service_area_class,
        status: OrderStatus::Pending,
        assigned_driver: None,
        created_at: Utc::now(),
    };

    state.orders.insert(order.id, order.clone());
    enqueue_order(&state, order.clone()).await?;

    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("order {} not found", id)))?;

    Ok(Json(order.value().clone()))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let mut order = state
        .orders
        .get_mut(&id)
        .ok_or_else(|| AppError::NotFound(format!("order {} not found", id)))?;

    if !matches!(order.status, OrderStatus::Pending | OrderStatus::Matching) {
        return Err(AppError::Conflict(format!(
            "order {} can no longer be cancelled ({:?})",
            id, order.status
        )));
    }

    // shares the assignment entry with the dispatcher's commit, so one of them loses
    match state.assignments.entry(id) {
        Entry::Occupied(_) => {
            return Err(AppError::Conflict(format!("order {} is already assigned", id)));
        }
        Entry::Vacant(_) => {
            if let Some(flag) = state.cancellations.get(&id) {
                flag.send_replace(true);
            }
        }
    }
    order.status = OrderStatus::Cancelled;
    info!(order_id = %id, "order cancelled");

    Ok(Json(order.clone()))
}

async fn list_assignments(State(state): State<Arc<AppState>>) -> Json<Vec<Assignment>> {
    let assignments = state
        .assignments
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    Json(assignments)
}
