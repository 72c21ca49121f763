use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::engine::dispatcher::MatchRequest;
use crate::error::MatchError;
use crate::models::assignment::{Assignment, MatchEvent};
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

/// Pulls orders off the intake queue and runs one dispatcher task per order.
pub async fn run_matching_engine(state: Arc<AppState>, mut order_rx: mpsc::Receiver<Order>) {
    info!("matching engine started");

    while let Some(order) = order_rx.recv().await {
        state.metrics.orders_in_queue.dec();
        tokio::spawn(process_order(state.clone(), order));
    }

    warn!("matching engine stopped: queue channel closed");
}

pub async fn process_order(state: Arc<AppState>, order: Order) -> Result<Assignment, MatchError> {
    let mut cancel = match state.cancellations.get(&order.id) {
        Some(tx) => tx.subscribe(),
        None => {
            // enqueued without a flag; nobody can cancel it
            let (_tx, rx) = watch::channel(false);
            rx
        }
    };

    set_status(&state, &order, OrderStatus::Matching, None);
    state.metrics.orders_in_flight.inc();

    let request = MatchRequest {
        order_id: order.id,
        pickup: order.pickup,
        service_area_class: order.service_area_class,
    };

    let start = Instant::now();
    let result = state.dispatcher.match_order(request, &mut cancel).await;
    let elapsed = start.elapsed().as_secs_f64();

    state.metrics.orders_in_flight.dec();
    state.cancellations.remove(&order.id);

    let outcome = match &result {
        Ok(_) => "assigned",
        Err(err) => err.outcome_label(),
    };
    state
        .metrics
        .match_latency_seconds
        .with_label_values(&[outcome])
        .observe(elapsed);
    state
        .metrics
        .match_outcomes_total
        .with_label_values(&[outcome])
        .inc();

    let event = match &result {
        Ok(assignment) => {
            set_status(&state, &order, OrderStatus::Assigned, Some(assignment));
            MatchEvent::Assigned(assignment.clone())
        }
        Err(MatchError::Cancelled) => {
            set_status(&state, &order, OrderStatus::Cancelled, None);
            info!(order_id = %order.id, "matching cancelled");
            MatchEvent::Cancelled { order_id: order.id }
        }
        Err(MatchError::AlreadyAssigned(_)) => {
            // the first commit already emitted its event
            return result;
        }
        Err(err) => {
            set_status(&state, &order, OrderStatus::Failed, None);
            if err.is_retryable() {
                warn!(order_id = %order.id, error = %err, "matching failed; caller may retry");
            } else {
                error!(order_id = %order.id, error = %err, "matching failed");
            }
            MatchEvent::Failed {
                order_id: order.id,
                reason: err.to_string(),
            }
        }
    };

    let _ = state.match_events_tx.send(event);
    result
}

fn set_status(state: &AppState, order: &Order, status: OrderStatus, assignment: Option<&Assignment>) {
    let mut entry = state.orders.entry(order.id).or_insert_with(|| order.clone());
    if entry.status == OrderStatus::Cancelled && status != OrderStatus::Cancelled {
        return;
    }
    entry.status = status;
    if let Some(assignment) = assignment {
        entry.assigned_driver = Some(assignment.driver_id);
    }
}
