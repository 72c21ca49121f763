use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::cooldown::CooldownStore;
use crate::engine::dispatcher::BatchDispatcher;
use crate::engine::gateway::{ChannelGateway, NotificationGateway, OfferEvent, ResponseRouter};
use crate::engine::lock::InMemoryLocks;
use crate::engine::peak::OrderVolumeSignal;
use crate::engine::scoring::{CandidateScorer, JitterSource, ThreadRngJitter};
use crate::engine::snapshot::SharedSnapshot;
use crate::models::assignment::{Assignment, MatchEvent};
use crate::models::order::Order;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub orders: DashMap<Uuid, Order>,
    /// Keyed by order id.
    pub assignments: Arc<DashMap<Uuid, Assignment>>,
    pub cancellations: DashMap<Uuid, watch::Sender<bool>>,
    pub snapshot: Arc<SharedSnapshot>,
    pub cooldowns: Arc<CooldownStore>,
    pub locks: Arc<InMemoryLocks>,
    pub responses: ResponseRouter,
    pub peak: Arc<OrderVolumeSignal>,
    pub dispatcher: Arc<BatchDispatcher>,
    pub order_tx: mpsc::Sender<Order>,
    pub match_events_tx: broadcast::Sender<MatchEvent>,
    pub offers_tx: broadcast::Sender<OfferEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<Order>) {
        let (offers_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let gateway = Arc::new(ChannelGateway::new(
            offers_tx.clone(),
            config.max_simultaneous_offers,
        ));
        Self::with_collaborators(config, offers_tx, gateway, Arc::new(ThreadRngJitter))
    }

    /// Wires the engine around a caller-supplied gateway and jitter source.
    pub fn with_collaborators(
        config: &Config,
        offers_tx: broadcast::Sender<OfferEvent>,
        gateway: Arc<dyn NotificationGateway>,
        jitter: Arc<dyn JitterSource>,
    ) -> (Self, mpsc::Receiver<Order>) {
        let (order_tx, order_rx) = mpsc::channel(config.order_queue_size);
        let (match_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        let metrics = Metrics::new();
        let assignments = Arc::new(DashMap::new());
        let snapshot = Arc::new(SharedSnapshot::new());
        let cooldowns = Arc::new(CooldownStore::new());
        let locks = Arc::new(InMemoryLocks::new());
        let responses = ResponseRouter::new();
        let peak = Arc::new(OrderVolumeSignal::new(
            config.peak_window(),
            config.peak_order_threshold,
        ));

        let dispatcher = Arc::new(BatchDispatcher::new(
            config.matching(),
            snapshot.clone(),
            cooldowns.clone(),
            locks.clone(),
            CandidateScorer::new(jitter),
            gateway,
            peak.clone(),
            responses.clone(),
            assignments.clone(),
            metrics.clone(),
        ));

        (
            Self {
                orders: DashMap::new(),
                assignments,
                cancellations: DashMap::new(),
                snapshot,
                cooldowns,
                locks,
                responses,
                peak,
                dispatcher,
                order_tx,
                match_events_tx,
                offers_tx,
                metrics,
            },
            order_rx,
        )
    }
}
