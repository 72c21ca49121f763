use tokio::sync::watch;

use crate::engine::peak::PeakHourSignal;
use crate::error::AppError;
use crate::models::order::Order;
use crate::state::AppState;

/// Registers the order's cancellation flag and hands it to the matching engine.
pub async fn enqueue_order(state: &AppState, order: Order) -> Result<(), AppError> {
    let (cancel_tx, _cancel_rx) = watch::channel(false);
    state.cancellations.insert(order.id, cancel_tx);
    state.peak.record_order();

    if let Err(err) = state.order_tx.send(order).await {
        state.cancellations.remove(&err.0.id);
        return Err(AppError::Internal(format!("order queue send failed: {err}")));
    }

    state.metrics.orders_in_queue.inc();
    tracing::debug!(peak = state.peak.is_peak_hours(), "order enqueued");
    Ok(())
}
