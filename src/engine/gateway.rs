//! Offer delivery to drivers and routing of their answers back to the
//! dispatcher that is waiting on them.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::assignment::OfferResponse;
use crate::models::driver::GeoPoint;
use crate::models::order::ServiceAreaClass;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferSummary {
    pub order_id: Uuid,
    pub pickup: GeoPoint,
    pub service_area_class: ServiceAreaClass,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    pub driver_id: Uuid,
    pub order_id: Uuid,
}

/// Delivers offers. Accepts and declines come back asynchronously through
/// [`ResponseRouter::route`]; silence is a valid answer.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// How many drivers the gateway recommends offering one order to at once.
    fn max_simultaneous_offers(&self) -> usize;

    async fn offer(
        &self,
        driver_id: Uuid,
        summary: &OfferSummary,
        timeout: Duration,
    ) -> Result<DeliveryAck, GatewayError>;
}

/// Routes driver responses to the dispatcher matching that order.
#[derive(Debug, Clone, Default)]
pub struct ResponseRouter {
    routes: Arc<DashMap<Uuid, mpsc::UnboundedSender<OfferResponse>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, order_id: Uuid) -> ResponseInbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(order_id, tx);
        ResponseInbox {
            order_id,
            rx,
            routes: self.routes.clone(),
        }
    }

    /// Returns `false` if no dispatcher is currently waiting on the order.
    pub fn route(&self, response: OfferResponse) -> bool {
        match self.routes.get(&response.order_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn active_orders(&self) -> usize {
        self.routes.len()
    }
}

/// Receiving side for one order. Deregisters itself on drop.
#[derive(Debug)]
pub struct ResponseInbox {
    order_id: Uuid,
    rx: mpsc::UnboundedReceiver<OfferResponse>,
    routes: Arc<DashMap<Uuid, mpsc::UnboundedSender<OfferResponse>>>,
}

impl ResponseInbox {
    pub async fn recv(&mut self) -> Option<OfferResponse> {
        self.rx.recv().await
    }

    /// Discards responses left over from an earlier batch.
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for ResponseInbox {
    fn drop(&mut self) {
        self.routes.remove(&self.order_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferEvent {
    pub driver_id: Uuid,
    pub offer: OfferSummary,
    pub timeout_secs: u64,
}

/// Publishes offers to connected driver clients over a broadcast channel.
pub struct ChannelGateway {
    offers_tx: broadcast::Sender<OfferEvent>,
    max_simultaneous_offers: usize,
}

impl ChannelGateway {
    pub fn new(offers_tx: broadcast::Sender<OfferEvent>, max_simultaneous_offers: usize) -> Self {
        Self {
            offers_tx,
            max_simultaneous_offers,
        }
    }
}

#[async_trait]
impl NotificationGateway for ChannelGateway {
    fn max_simultaneous_offers(&self) -> usize {
        self.max_simultaneous_offers
    }

    async fn offer(
        &self,
        driver_id: Uuid,
        summary: &OfferSummary,
        timeout: Duration,
    ) -> Result<DeliveryAck, GatewayError> {
        let event = OfferEvent {
            driver_id,
            offer: summary.clone(),
            timeout_secs: timeout.as_secs(),
        };

        self.offers_tx
            .send(event)
            .map_err(|_| GatewayError::Unavailable("no driver clients connected".to_string()))?;

        Ok(DeliveryAck {
            driver_id,
            order_id: summary.order_id,
        })
    }
}
