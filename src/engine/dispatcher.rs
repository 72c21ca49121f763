//! Radius/batch escalation loop for a single order.
//!
//! Per order the dispatcher walks `SEARCHING -> OFFERING` for each radius,
//! offering batch by batch, and ends in `ASSIGNED` or `EXHAUSTED`. Batches of
//! one order are strictly sequential; different orders run as independent
//! tasks and only meet at the lock manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::cooldown::CooldownStore;
use crate::engine::gateway::{NotificationGateway, OfferSummary, ResponseInbox, ResponseRouter};
use crate::engine::lock::{AssignmentLocks, LockToken};
use crate::engine::peak::PeakHourSignal;
use crate::engine::scoring::CandidateScorer;
use crate::engine::snapshot::DriverSnapshotProvider;
use crate::error::{LockError, MatchError};
use crate::geo::haversine_km;
use crate::models::assignment::{Assignment, ResponseKind};
use crate::models::driver::{Candidate, DriverRecord, DriverStatus, GeoPoint};
use crate::models::order::ServiceAreaClass;
use crate::observability::metrics::Metrics;

const RADIUS_EPSILON_KM: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub start_radius_km: f64,
    pub radius_step_km: f64,
    pub start_batch_size: usize,
    pub peak_batch_multiplier: f64,
    pub peak_batch_cap: usize,
    pub radius_batch_increment: usize,
    pub radius_batch_cap: usize,
    /// Rounds completed before the flat batch increment kicks in.
    pub radius_growth_after_rounds: usize,
    /// Offer window. Also the lock TTL so a lock never outlives its offer.
    pub response_timeout: Duration,
    pub cooldown: Duration,
    pub inter_batch_delay: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            start_radius_km: 2.0,
            radius_step_km: 2.0,
            start_batch_size: 50,
            peak_batch_multiplier: 1.5,
            peak_batch_cap: 150,
            radius_batch_increment: 25,
            radius_batch_cap: 200,
            radius_growth_after_rounds: 3,
            response_timeout: Duration::from_secs(10),
            cooldown: Duration::from_secs(600),
            inter_batch_delay: Duration::from_millis(2500),
        }
    }
}

impl MatchingConfig {
    /// Batch size for the next radius. The peak multiplier is applied before the
    /// flat increment; neither rule ever shrinks the batch.
    pub fn next_batch_size(&self, current: usize, peak_applied: bool, rounds_completed: usize) -> usize {
        let mut size = current;

        if peak_applied {
            let grown = (size as f64 * self.peak_batch_multiplier).ceil() as usize;
            size = size.max(grown.min(self.peak_batch_cap));
        }

        if rounds_completed >= self.radius_growth_after_rounds {
            let grown = size.saturating_add(self.radius_batch_increment);
            size = size.max(grown.min(self.radius_batch_cap));
        }

        size
    }

    /// Number of radius rounds an order of this class goes through before exhausting.
    pub fn max_rounds(&self, service_area_class: ServiceAreaClass) -> usize {
        let max_radius = service_area_class.max_radius_km();
        if self.start_radius_km > max_radius + RADIUS_EPSILON_KM || self.radius_step_km <= 0.0 {
            return 0;
        }
        ((max_radius - self.start_radius_km) / self.radius_step_km + RADIUS_EPSILON_KM).floor() as usize + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    Searching,
    Offering,
    Assigned,
    Escalating,
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchRequest {
    pub order_id: Uuid,
    pub pickup: GeoPoint,
    pub service_area_class: ServiceAreaClass,
}

enum BatchOutcome {
    /// The winner's lock is still held until the assignment is written.
    Accepted { driver_id: Uuid, token: Option<LockToken> },
    /// Offers went out to these drivers and nobody accepted.
    Unanswered { offered: HashSet<Uuid> },
    /// Nothing was offered: every driver was locked elsewhere or unreachable.
    NotOffered,
}

/// Drivers notified for one order, in notification order.
#[derive(Debug, Default)]
struct NotifiedHistory {
    seen: HashSet<Uuid>,
    ordered: Vec<Uuid>,
}

impl NotifiedHistory {
    fn push(&mut self, driver_id: Uuid) {
        if self.seen.insert(driver_id) {
            self.ordered.push(driver_id);
        }
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    fn drivers(&self) -> &[Uuid] {
        &self.ordered
    }
}

pub struct BatchDispatcher {
    config: MatchingConfig,
    snapshot: Arc<dyn DriverSnapshotProvider>,
    cooldowns: Arc<CooldownStore>,
    locks: Arc<dyn AssignmentLocks>,
    scorer: CandidateScorer,
    gateway: Arc<dyn NotificationGateway>,
    peak: Arc<dyn PeakHourSignal>,
    responses: ResponseRouter,
    assignments: Arc<DashMap<Uuid, Assignment>>,
    metrics: Metrics,
}

impl BatchDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MatchingConfig,
        snapshot: Arc<dyn DriverSnapshotProvider>,
        cooldowns: Arc<CooldownStore>,
        locks: Arc<dyn AssignmentLocks>,
        scorer: CandidateScorer,
        gateway: Arc<dyn NotificationGateway>,
        peak: Arc<dyn PeakHourSignal>,
        responses: ResponseRouter,
        assignments: Arc<DashMap<Uuid, Assignment>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            snapshot,
            cooldowns,
            locks,
            scorer,
            gateway,
            peak,
            responses,
            assignments,
            metrics,
        }
    }

    /// Runs matching to completion: an assignment, or a typed failure the caller
    /// can tell apart (`SnapshotUnavailable` is worth retrying, the rest are not).
    pub async fn match_order(
        &self,
        request: MatchRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Assignment, MatchError> {
        let order_id = request.order_id;
        let mut inbox = self.responses.register(order_id);
        let mut history = NotifiedHistory::default();
        let mut batch_size = self.config.start_batch_size.max(1);
        let max_rounds = self.config.max_rounds(request.service_area_class);
        let mut radius_km = self.config.start_radius_km;

        for rounds in 1..=max_rounds {
            radius_km = self.config.start_radius_km + (rounds - 1) as f64 * self.config.radius_step_km;
            log_state(order_id, DispatchState::Searching, radius_km, batch_size);

            if *cancel.borrow() {
                return self.finish(Err(MatchError::Cancelled), rounds);
            }

            let drivers = match self.snapshot.available_drivers().await {
                Ok(drivers) => drivers,
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "driver snapshot unavailable");
                    return self.finish(Err(err.into()), rounds);
                }
            };

            if *cancel.borrow() {
                return self.finish(Err(MatchError::Cancelled), rounds);
            }

            let eligible = self.eligible_candidates(&drivers, request.pickup, radius_km);
            debug!(
                order_id = %order_id,
                radius_km,
                eligible = eligible.len(),
                "filtered driver snapshot"
            );

            for batch in eligible.chunks(batch_size) {
                // each pass offers the closest tier still left in the batch
                let mut remaining = batch.to_vec();

                while !remaining.is_empty() {
                    log_state(order_id, DispatchState::Offering, radius_km, batch_size);

                    let outcome = match self
                        .offer_batch(&request, &remaining, &mut inbox, &mut history, cancel)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => return self.finish(Err(err), rounds),
                    };

                    match outcome {
                        BatchOutcome::Accepted { driver_id, token } => {
                            let result = self.commit(order_id, driver_id, &history, cancel);
                            if let Some(token) = token {
                                self.locks.release(driver_id, token).await;
                            }
                            if result.is_ok() {
                                log_state(order_id, DispatchState::Assigned, radius_km, batch_size);
                            }
                            return self.finish(result, rounds);
                        }
                        BatchOutcome::Unanswered { offered } => {
                            remaining.retain(|candidate| !offered.contains(&candidate.driver.driver_id));
                            if self.throttle(cancel).await {
                                return self.finish(Err(MatchError::Cancelled), rounds);
                            }
                        }
                        BatchOutcome::NotOffered => break,
                    }
                }
            }

            log_state(order_id, DispatchState::Escalating, radius_km, batch_size);

            let peak_applied = !history.is_empty() && self.peak.is_peak_hours();
            if peak_applied {
                for driver_id in history.drivers() {
                    self.cooldowns.remove_cooldown(driver_id);
                }
                info!(
                    order_id = %order_id,
                    released = history.drivers().len(),
                    "peak hours: lifted cooldowns for previously notified drivers"
                );
            }

            batch_size = self.config.next_batch_size(batch_size, peak_applied, rounds);
        }

        log_state(order_id, DispatchState::Exhausted, radius_km, batch_size);
        self.finish(Err(MatchError::NoDriversAvailable), max_rounds)
    }

    fn finish(&self, result: Result<Assignment, MatchError>, rounds: usize) -> Result<Assignment, MatchError> {
        self.metrics.escalation_rounds.observe(rounds as f64);
        result
    }

    /// Available, in range, not cooling down; nearest first.
    fn eligible_candidates(&self, drivers: &[DriverRecord], pickup: GeoPoint, radius_km: f64) -> Vec<Candidate> {
        let now = Utc::now();
        let mut eligible: Vec<Candidate> = drivers
            .iter()
            .filter(|driver| driver.status == DriverStatus::Available)
            .filter_map(|driver| {
                let distance_km = haversine_km(&driver.location, &pickup);
                if distance_km > radius_km + RADIUS_EPSILON_KM {
                    return None;
                }
                if self.cooldowns.is_in_cooldown(&driver.driver_id) {
                    return None;
                }

                let mut driver = driver.clone();
                driver.deliveries_today = driver
                    .deliveries_today
                    .max(self.cooldowns.assignments_today(&driver.driver_id, now));
                driver.last_assignment_at = driver
                    .last_assignment_at
                    .max(self.cooldowns.last_assignment_at(&driver.driver_id));

                Some(Candidate {
                    driver,
                    distance_km,
                    score: 0.0,
                })
            })
            .collect();

        eligible.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.driver.driver_id.cmp(&b.driver.driver_id))
        });
        eligible
    }

    async fn offer_batch(
        &self,
        request: &MatchRequest,
        batch: &[Candidate],
        inbox: &mut ResponseInbox,
        history: &mut NotifiedHistory,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<BatchOutcome, MatchError> {
        let order_id = request.order_id;
        let ttl = self.config.response_timeout;
        // taken before any lock so the window closes no later than the locks expire
        let deadline = Instant::now() + ttl;
        let mut held: HashMap<Uuid, LockToken> = HashMap::new();
        let mut locked = Vec::with_capacity(batch.len());

        for candidate in batch {
            let driver_id = candidate.driver.driver_id;
            match self.locks.acquire(driver_id, ttl).await {
                Ok(token) => {
                    // another order may have committed this driver since the snapshot was filtered
                    if self.cooldowns.is_in_cooldown(&driver_id) {
                        self.locks.release(driver_id, token).await;
                        continue;
                    }
                    held.insert(driver_id, token);
                    locked.push(candidate.clone());
                }
                Err(LockError::Held) => {
                    self.metrics.lock_refusals_total.inc();
                    debug!(order_id = %order_id, driver_id = %driver_id, "driver locked by another order");
                }
                Err(err @ LockError::Unavailable(_)) => {
                    self.metrics.lock_refusals_total.inc();
                    warn!(order_id = %order_id, driver_id = %driver_id, error = %err, "lock acquisition failed");
                }
            }
        }

        if *cancel.borrow() {
            self.release_all(&mut held).await;
            return Err(MatchError::Cancelled);
        }

        if locked.is_empty() {
            return Ok(BatchOutcome::NotOffered);
        }

        let limit = self.gateway.max_simultaneous_offers().max(1);
        let ranked = self.scorer.rank(locked, Utc::now());
        let selected: Vec<&Candidate> = ranked.iter().take(limit).collect();
        let selected_ids: HashSet<Uuid> = selected.iter().map(|c| c.driver.driver_id).collect();

        let passed_over: Vec<Uuid> = held
            .keys()
            .filter(|driver_id| !selected_ids.contains(driver_id))
            .copied()
            .collect();
        for driver_id in passed_over {
            self.release(&mut held, driver_id).await;
        }

        inbox.drain();

        let mut offered: HashSet<Uuid> = HashSet::with_capacity(selected.len());
        for candidate in selected {
            let driver_id = candidate.driver.driver_id;
            let summary = OfferSummary {
                order_id,
                pickup: request.pickup,
                service_area_class: request.service_area_class,
                distance_km: candidate.distance_km,
            };

            match self.gateway.offer(driver_id, &summary, ttl).await {
                Ok(_) => {
                    self.metrics.offers_sent_total.inc();
                    offered.insert(driver_id);
                    history.push(driver_id);
                    debug!(
                        order_id = %order_id,
                        driver_id = %driver_id,
                        distance_km = candidate.distance_km,
                        score = candidate.score,
                        "offer sent"
                    );
                }
                Err(err) => {
                    warn!(order_id = %order_id, driver_id = %driver_id, error = %err, "offer not delivered");
                    self.release(&mut held, driver_id).await;
                }
            }
        }

        if offered.is_empty() {
            return Ok(BatchOutcome::NotOffered);
        }

        let mut declined: HashSet<Uuid> = HashSet::new();
        let accepted = loop {
            tokio::select! {
                _ = sleep_until(deadline) => break None,
                _ = cancelled(cancel) => {
                    self.release_all(&mut held).await;
                    return Err(MatchError::Cancelled);
                }
                response = inbox.recv() => {
                    let Some(response) = response else { break None };
                    if !offered.contains(&response.driver_id) {
                        debug!(order_id = %order_id, driver_id = %response.driver_id, "ignoring response from driver outside this batch");
                        continue;
                    }
                    match response.response {
                        ResponseKind::Accept => break Some(response.driver_id),
                        ResponseKind::Decline => {
                            declined.insert(response.driver_id);
                            if declined.len() == offered.len() {
                                break None;
                            }
                        }
                    }
                }
            }
        };

        match accepted {
            Some(driver_id) => {
                let token = held.remove(&driver_id);
                self.release_all(&mut held).await;
                Ok(BatchOutcome::Accepted { driver_id, token })
            }
            None => {
                self.release_all(&mut held).await;
                self.cooldowns.set_cooldowns(offered.iter(), self.config.cooldown);
                info!(
                    order_id = %order_id,
                    offered = offered.len(),
                    declined = declined.len(),
                    "batch closed without acceptance"
                );
                Ok(BatchOutcome::Unanswered { offered })
            }
        }
    }

    /// Writes the assignment unless the order was assigned or cancelled first.
    /// Cancellation raises the flag under the same map entry, so exactly one wins.
    fn commit(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        history: &NotifiedHistory,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Assignment, MatchError> {
        let assignment = match self.assignments.entry(order_id) {
            Entry::Occupied(_) => {
                warn!(order_id = %order_id, driver_id = %driver_id, "order already assigned; dropping acceptance");
                return Err(MatchError::AlreadyAssigned(order_id));
            }
            Entry::Vacant(_) if *cancel.borrow() => {
                info!(order_id = %order_id, driver_id = %driver_id, "order cancelled before acceptance was committed");
                return Err(MatchError::Cancelled);
            }
            Entry::Vacant(vacant) => {
                let assignment = Assignment {
                    order_id,
                    driver_id,
                    assigned_at: Utc::now(),
                };
                vacant.insert(assignment.clone());
                assignment
            }
        };

        self.cooldowns
            .set_cooldowns(history.drivers().iter(), self.config.cooldown);
        self.cooldowns
            .record_assignment(driver_id, assignment.assigned_at);

        info!(
            order_id = %order_id,
            driver_id = %driver_id,
            cooled_down = history.drivers().len(),
            "order assigned"
        );
        Ok(assignment)
    }

    /// Returns `true` if the order was cancelled during the pause.
    async fn throttle(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        if self.config.inter_batch_delay.is_zero() {
            return *cancel.borrow();
        }

        tokio::select! {
            _ = sleep(self.config.inter_batch_delay) => {}
            _ = cancelled(cancel) => return true,
        }
        *cancel.borrow()
    }

    async fn release(&self, held: &mut HashMap<Uuid, LockToken>, driver_id: Uuid) {
        if let Some(token) = held.remove(&driver_id) {
            self.locks.release(driver_id, token).await;
        }
    }

    async fn release_all(&self, held: &mut HashMap<Uuid, LockToken>) {
        for (driver_id, token) in held.drain() {
            self.locks.release(driver_id, token).await;
        }
    }
}

/// Resolves once the order is flagged as cancelled. Never resolves if the
/// cancelling side went away without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn log_state(order_id: Uuid, state: DispatchState, radius_km: f64, batch_size: usize) {
    debug!(order_id = %order_id, state = ?state, radius_km, batch_size, "dispatch state");
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use dashmap::DashMap;
    use tokio::sync::watch;
    use tokio::time::{advance, sleep, Duration, Instant};
    use uuid::Uuid;

    use super::{BatchDispatcher, MatchRequest, MatchingConfig, NotifiedHistory};
    use crate::engine::cooldown::CooldownStore;
    use crate::engine::gateway::{DeliveryAck, NotificationGateway, OfferSummary, ResponseRouter};
    use crate::engine::lock::{AssignmentLocks, InMemoryLocks};
    use crate::engine::peak::StaticPeak;
    use crate::engine::scoring::{CandidateScorer, FixedJitter};
    use crate::engine::snapshot::DriverSnapshotProvider;
    use crate::error::{GatewayError, MatchError, SnapshotError};
    use crate::models::assignment::{Assignment, OfferResponse, ResponseKind};
    use crate::models::driver::{DriverRecord, DriverStatus, GeoPoint};
    use crate::models::order::ServiceAreaClass;
    use crate::observability::metrics::Metrics;

    const PICKUP: GeoPoint = GeoPoint {
        lat: 40.7580,
        lng: -73.9855,
    };
    const KM_PER_DEGREE_LAT: f64 = 111.194_926_644_558_73;

    fn driver(id_seed: u128, distance_km: f64) -> DriverRecord {
        DriverRecord {
            driver_id: Uuid::from_u128(id_seed),
            location: GeoPoint {
                lat: PICKUP.lat + distance_km / KM_PER_DEGREE_LAT,
                lng: PICKUP.lng,
            },
            rating: 4.5,
            deliveries_today: 3,
            last_assignment_at: None,
            status: DriverStatus::Available,
        }
    }

    struct CountingSnapshot {
        drivers: Arc<Vec<DriverRecord>>,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl CountingSnapshot {
        fn new(drivers: Vec<DriverRecord>) -> Self {
            Self {
                drivers: Arc::new(drivers),
                fetches: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl DriverSnapshotProvider for CountingSnapshot {
        async fn available_drivers(&self) -> Result<Arc<Vec<DriverRecord>>, SnapshotError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SnapshotError::Unavailable("connection refused".to_string()));
            }
            Ok(self.drivers.clone())
        }
    }

    /// Answers offers on behalf of drivers according to a fixed script.
    struct ScriptedGateway {
        router: ResponseRouter,
        script: HashMap<Uuid, ResponseKind>,
        unreachable: HashSet<Uuid>,
        offers: Mutex<Vec<(Uuid, Uuid)>>,
        limit: usize,
    }

    impl ScriptedGateway {
        fn new(router: ResponseRouter) -> Self {
            Self {
                router,
                script: HashMap::new(),
                unreachable: HashSet::new(),
                offers: Mutex::new(Vec::new()),
                limit: 10,
            }
        }

        fn answer(mut self, id_seed: u128, response: ResponseKind) -> Self {
            self.script.insert(Uuid::from_u128(id_seed), response);
            self
        }

        fn unreachable(mut self, id_seed: u128) -> Self {
            self.unreachable.insert(Uuid::from_u128(id_seed));
            self
        }

        fn offered_drivers(&self) -> Vec<u128> {
            self.offers
                .lock()
                .unwrap()
                .iter()
                .map(|(driver_id, _)| driver_id.as_u128())
                .collect()
        }
    }

    #[async_trait]
    impl NotificationGateway for ScriptedGateway {
        fn max_simultaneous_offers(&self) -> usize {
            self.limit
        }

        async fn offer(
            &self,
            driver_id: Uuid,
            summary: &OfferSummary,
            _timeout: Duration,
        ) -> Result<DeliveryAck, GatewayError> {
            if self.unreachable.contains(&driver_id) {
                return Err(GatewayError::Unavailable("push provider down".to_string()));
            }

            self.offers.lock().unwrap().push((driver_id, summary.order_id));
            if let Some(response) = self.script.get(&driver_id) {
                self.router.route(OfferResponse {
                    driver_id,
                    order_id: summary.order_id,
                    response: *response,
                });
            }

            Ok(DeliveryAck {
                driver_id,
                order_id: summary.order_id,
            })
        }
    }

    struct Harness {
        dispatcher: Arc<BatchDispatcher>,
        snapshot: Arc<CountingSnapshot>,
        gateway: Arc<ScriptedGateway>,
        cooldowns: Arc<CooldownStore>,
        locks: Arc<InMemoryLocks>,
        assignments: Arc<DashMap<Uuid, Assignment>>,
    }

    fn test_config() -> MatchingConfig {
        MatchingConfig {
            inter_batch_delay: Duration::ZERO,
            ..MatchingConfig::default()
        }
    }

    fn harness(
        config: MatchingConfig,
        snapshot: CountingSnapshot,
        script: impl FnOnce(ScriptedGateway) -> ScriptedGateway,
        peak: bool,
    ) -> Harness {
        let router = ResponseRouter::new();
        let snapshot = Arc::new(snapshot);
        let gateway = Arc::new(script(ScriptedGateway::new(router.clone())));
        let cooldowns = Arc::new(CooldownStore::new());
        let locks = Arc::new(InMemoryLocks::new());
        let assignments = Arc::new(DashMap::new());

        let dispatcher = BatchDispatcher::new(
            config,
            snapshot.clone(),
            cooldowns.clone(),
            locks.clone(),
            CandidateScorer::new(Arc::new(FixedJitter(0.0))),
            gateway.clone(),
            Arc::new(StaticPeak::new(peak)),
            router,
            assignments.clone(),
            Metrics::new(),
        );

        Harness {
            dispatcher: Arc::new(dispatcher),
            snapshot,
            gateway,
            cooldowns,
            locks,
            assignments,
        }
    }

    fn request(id_seed: u128, service_area_class: ServiceAreaClass) -> MatchRequest {
        MatchRequest {
            order_id: Uuid::from_u128(id_seed),
            pickup: PICKUP,
            service_area_class,
        }
    }

    fn never_cancelled() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn batch_growth_applies_peak_multiplier_before_flat_increment() {
        let config = MatchingConfig::default();

        assert_eq!(config.next_batch_size(50, false, 1), 50);
        assert_eq!(config.next_batch_size(50, true, 1), 75);
        assert_eq!(config.next_batch_size(120, true, 2), 150);
        assert_eq!(config.next_batch_size(50, false, 3), 75);
        // 140 * 1.5 caps at 150, then +25
        assert_eq!(config.next_batch_size(140, true, 3), 175);
        assert_eq!(config.next_batch_size(190, false, 4), 200);
        // neither cap shrinks a batch that already grew past it
        assert_eq!(config.next_batch_size(175, true, 2), 175);
        assert_eq!(config.next_batch_size(200, true, 5), 200);
    }

    #[test]
    fn round_counts_follow_service_area_radius() {
        let config = MatchingConfig::default();
        assert_eq!(config.max_rounds(ServiceAreaClass::Urban), 7);
        assert_eq!(config.max_rounds(ServiceAreaClass::Suburban), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_urban_area_exhausts_after_seven_rounds() {
        let h = harness(test_config(), CountingSnapshot::new(Vec::new()), |g| g, false);
        let (_tx, mut rx) = never_cancelled();

        let result = h
            .dispatcher
            .match_order(request(100, ServiceAreaClass::Urban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::NoDriversAvailable);
        assert_eq!(h.snapshot.fetches.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_suburban_area_exhausts_after_twelve_rounds() {
        let h = harness(test_config(), CountingSnapshot::new(Vec::new()), |g| g, false);
        let (_tx, mut rx) = never_cancelled();

        let result = h
            .dispatcher
            .match_order(request(101, ServiceAreaClass::Suburban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::NoDriversAvailable);
        assert_eq!(h.snapshot.fetches.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn every_notified_driver_is_cooled_down_on_acceptance() {
        let config = MatchingConfig {
            start_batch_size: 2,
            ..test_config()
        };
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.5), driver(2, 0.6), driver(3, 0.7)]);
        let h = harness(config, snapshot, |g| g.answer(3, ResponseKind::Accept), false);
        let (_tx, mut rx) = never_cancelled();

        let assignment = h
            .dispatcher
            .match_order(request(200, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        assert_eq!(assignment.driver_id, Uuid::from_u128(3));
        assert_eq!(h.gateway.offered_drivers(), vec![1, 2, 3]);
        for seed in [1, 2, 3] {
            assert!(h.cooldowns.is_in_cooldown(&Uuid::from_u128(seed)));
        }
        assert_eq!(h.locks.live_locks(), 0);
        assert_eq!(
            h.cooldowns
                .assignments_today(&Uuid::from_u128(3), Utc::now()),
            1
        );

        advance(Duration::from_secs(600)).await;
        for seed in [1, 2, 3] {
            assert!(!h.cooldowns.is_in_cooldown(&Uuid::from_u128(seed)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_acceptance_wins_and_releases_the_rest() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.5), driver(2, 0.55), driver(3, 0.6)]);
        let h = harness(
            test_config(),
            snapshot,
            |g| {
                g.answer(2, ResponseKind::Accept)
                    .answer(3, ResponseKind::Accept)
            },
            false,
        );
        let (_tx, mut rx) = never_cancelled();

        let assignment = h
            .dispatcher
            .match_order(request(300, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        // equal scores rank by driver id, so driver 2 is offered (and answers) before 3
        assert_eq!(assignment.driver_id, Uuid::from_u128(2));
        assert_eq!(h.assignments.len(), 1);
        assert_eq!(h.locks.live_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closer_tier_is_offered_before_a_farther_driver() {
        let config = MatchingConfig {
            start_radius_km: 4.0,
            ..test_config()
        };
        let snapshot = CountingSnapshot::new(vec![
            driver(1, 1.0),
            driver(2, 1.2),
            driver(3, 1.3),
            driver(4, 3.0),
        ]);
        let h = harness(config, snapshot, |g| g.answer(4, ResponseKind::Accept), false);
        let (_tx, mut rx) = never_cancelled();

        let assignment = h
            .dispatcher
            .match_order(request(400, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        assert_eq!(assignment.driver_id, Uuid::from_u128(4));
        let offered = h.gateway.offered_drivers();
        assert_eq!(offered.len(), 4);
        assert_eq!(*offered.last().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn drivers_locked_by_another_order_are_skipped() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4), driver(2, 0.5)]);
        let h = harness(
            test_config(),
            snapshot,
            |g| {
                g.answer(1, ResponseKind::Accept)
                    .answer(2, ResponseKind::Accept)
            },
            false,
        );
        let foreign = h
            .locks
            .acquire(Uuid::from_u128(1), Duration::from_secs(10))
            .await
            .unwrap();
        let (_tx, mut rx) = never_cancelled();

        let assignment = h
            .dispatcher
            .match_order(request(500, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        assert_eq!(assignment.driver_id, Uuid::from_u128(2));
        assert_eq!(h.gateway.offered_drivers(), vec![2]);
        // the other order's lock is untouched
        assert!(h.locks.is_locked(Uuid::from_u128(1)).await);
        assert!(h.locks.release(Uuid::from_u128(1), foreign).await);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_outage_skips_drivers_without_holding_locks() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4)]);
        let h = harness(test_config(), snapshot, |g| g.unreachable(1), false);
        let (_tx, mut rx) = never_cancelled();

        let result = h
            .dispatcher
            .match_order(request(600, ServiceAreaClass::Urban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::NoDriversAvailable);
        assert_eq!(h.locks.live_locks(), 0);
        assert!(!h.cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_snapshot_fails_fast_with_a_retryable_error() {
        let h = harness(test_config(), CountingSnapshot::failing(), |g| g, false);
        let (_tx, mut rx) = never_cancelled();

        let err = h
            .dispatcher
            .match_order(request(700, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap_err();

        assert!(matches!(err, MatchError::SnapshotUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(h.snapshot.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_locks_without_cooldowns() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4)]);
        let h = harness(test_config(), snapshot, |g| g, false);
        let (tx, mut rx) = watch::channel(false);

        let dispatcher = h.dispatcher.clone();
        let run = tokio::spawn(async move {
            dispatcher
                .match_order(request(800, ServiceAreaClass::Urban), &mut rx)
                .await
        });

        sleep(Duration::from_secs(3)).await;
        assert!(h.locks.is_locked(Uuid::from_u128(1)).await);
        tx.send(true).unwrap();

        let result = run.await.unwrap();
        assert_eq!(result.unwrap_err(), MatchError::Cancelled);
        assert!(!h.locks.is_locked(Uuid::from_u128(1)).await);
        assert!(!h.cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
        assert!(h.assignments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_never_fetches_drivers() {
        let h = harness(test_config(), CountingSnapshot::new(vec![driver(1, 0.4)]), |g| g, false);
        let (_tx, mut rx) = watch::channel(true);

        let result = h
            .dispatcher
            .match_order(request(801, ServiceAreaClass::Urban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::Cancelled);
        assert_eq!(h.snapshot.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peak_hours_make_notified_drivers_eligible_again() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4)]);
        let h = harness(test_config(), snapshot, |g| g, true);
        let (_tx, mut rx) = never_cancelled();

        let result = h
            .dispatcher
            .match_order(request(900, ServiceAreaClass::Urban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::NoDriversAvailable);
        // re-offered in every one of the seven rounds
        assert_eq!(h.gateway.offered_drivers(), vec![1; 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn off_peak_notified_drivers_stay_cooled_down() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4)]);
        let h = harness(test_config(), snapshot, |g| g, false);
        let (_tx, mut rx) = never_cancelled();

        let result = h
            .dispatcher
            .match_order(request(901, ServiceAreaClass::Urban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::NoDriversAvailable);
        assert_eq!(h.gateway.offered_drivers(), vec![1]);
        assert!(h.cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_ends_early_once_every_driver_declined() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4), driver(2, 0.5)]);
        let h = harness(
            test_config(),
            snapshot,
            |g| {
                g.answer(1, ResponseKind::Decline)
                    .answer(2, ResponseKind::Decline)
            },
            false,
        );
        let (_tx, mut rx) = never_cancelled();
        let started = Instant::now();

        let result = h
            .dispatcher
            .match_order(request(1000, ServiceAreaClass::Urban), &mut rx)
            .await;

        assert_eq!(result.unwrap_err(), MatchError::NoDriversAvailable);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(h.cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
        assert!(h.cooldowns.is_in_cooldown(&Uuid::from_u128(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_batch_waits_for_the_full_offer_window() {
        let config = MatchingConfig {
            start_batch_size: 1,
            ..test_config()
        };
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4), driver(2, 0.5)]);
        let h = harness(config, snapshot, |g| g.answer(2, ResponseKind::Accept), false);
        let (_tx, mut rx) = never_cancelled();
        let started = Instant::now();

        let assignment = h
            .dispatcher
            .match_order(request(1100, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        assert_eq!(assignment.driver_id, Uuid::from_u128(2));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn an_order_is_assigned_at_most_once() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4)]);
        let h = harness(test_config(), snapshot, |g| g.answer(1, ResponseKind::Accept), false);
        let order_id = Uuid::from_u128(1200);
        h.assignments.insert(
            order_id,
            Assignment {
                order_id,
                driver_id: Uuid::from_u128(77),
                assigned_at: Utc::now(),
            },
        );
        let (_tx, mut rx) = never_cancelled();

        let err = h
            .dispatcher
            .match_order(request(1200, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap_err();

        assert_eq!(err, MatchError::AlreadyAssigned(order_id));
        assert_eq!(h.assignments.get(&order_id).unwrap().driver_id, Uuid::from_u128(77));
        assert_eq!(h.locks.live_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_orders_never_share_a_driver() {
        let snapshot = CountingSnapshot::new(vec![driver(1, 0.4)]);
        let h = harness(test_config(), snapshot, |g| g.answer(1, ResponseKind::Accept), false);

        let runs: Vec<_> = (0..2u128)
            .map(|n| {
                let dispatcher = h.dispatcher.clone();
                tokio::spawn(async move {
                    let (_tx, mut rx) = watch::channel(false);
                    dispatcher
                        .match_order(request(1300 + n, ServiceAreaClass::Urban), &mut rx)
                        .await
                })
            })
            .collect();

        let mut assigned = 0;
        for run in runs {
            match run.await.unwrap() {
                Ok(assignment) => {
                    assert_eq!(assignment.driver_id, Uuid::from_u128(1));
                    assigned += 1;
                }
                Err(err) => assert_eq!(err, MatchError::NoDriversAvailable),
            }
        }

        assert_eq!(assigned, 1);
        assert_eq!(h.assignments.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn farther_tier_is_offered_once_the_closer_one_goes_quiet() {
        // both first come into range at the last urban radius (14 km)
        let snapshot = CountingSnapshot::new(vec![driver(1, 13.0), driver(2, 13.5)]);
        let h = harness(test_config(), snapshot, |g| g.answer(2, ResponseKind::Accept), false);
        let (_tx, mut rx) = never_cancelled();

        let assignment = h
            .dispatcher
            .match_order(request(1400, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        assert_eq!(assignment.driver_id, Uuid::from_u128(2));
        assert_eq!(h.gateway.offered_drivers(), vec![1, 2]);
        assert!(h.cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
        assert_eq!(h.locks.live_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peak_round_offers_the_grown_batch_in_one_window() {
        let config = MatchingConfig {
            start_batch_size: 2,
            ..MatchingConfig::default()
        };
        // 3 joins at the 4 km radius, in the same tier as 1 and 2
        let snapshot = CountingSnapshot::new(vec![driver(1, 1.8), driver(2, 1.9), driver(3, 2.05)]);
        let h = harness(config, snapshot, |g| g.answer(3, ResponseKind::Accept), true);
        let (_tx, mut rx) = never_cancelled();
        let started = Instant::now();

        let assignment = h
            .dispatcher
            .match_order(request(1500, ServiceAreaClass::Urban), &mut rx)
            .await
            .unwrap();

        assert_eq!(assignment.driver_id, Uuid::from_u128(3));
        assert_eq!(h.gateway.offered_drivers(), vec![1, 2, 1, 2, 3]);
        // one silent window plus the throttle; a batch of 2 would need a second window
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(12_500));
        assert!(elapsed < Duration::from_secs(20));
    }

    #[test]
    fn commit_loses_to_an_earlier_cancellation() {
        let h = harness(test_config(), CountingSnapshot::new(Vec::new()), |g| g, false);
        let order_id = Uuid::from_u128(1600);
        let mut history = NotifiedHistory::default();
        history.push(Uuid::from_u128(1));
        let (_tx, rx) = watch::channel(true);

        let err = h
            .dispatcher
            .commit(order_id, Uuid::from_u128(1), &history, &rx)
            .unwrap_err();

        assert_eq!(err, MatchError::Cancelled);
        assert!(h.assignments.is_empty());
        assert!(!h.cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
    }

    /// Accepts on the driver's behalf and cancels the order in the same instant.
    struct AcceptAndCancel {
        router: ResponseRouter,
        cancel: Arc<watch::Sender<bool>>,
    }

    #[async_trait]
    impl NotificationGateway for AcceptAndCancel {
        fn max_simultaneous_offers(&self) -> usize {
            10
        }

        async fn offer(
            &self,
            driver_id: Uuid,
            summary: &OfferSummary,
            _timeout: Duration,
        ) -> Result<DeliveryAck, GatewayError> {
            self.router.route(OfferResponse {
                driver_id,
                order_id: summary.order_id,
                response: ResponseKind::Accept,
            });
            self.cancel.send_replace(true);
            Ok(DeliveryAck {
                driver_id,
                order_id: summary.order_id,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acceptance_racing_a_cancellation_never_assigns() {
        let router = ResponseRouter::new();
        let (tx, mut rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let cooldowns = Arc::new(CooldownStore::new());
        let locks = Arc::new(InMemoryLocks::new());
        let assignments = Arc::new(DashMap::new());
        let dispatcher = BatchDispatcher::new(
            test_config(),
            Arc::new(CountingSnapshot::new(vec![driver(1, 0.4)])),
            cooldowns.clone(),
            locks.clone(),
            CandidateScorer::new(Arc::new(FixedJitter(0.0))),
            Arc::new(AcceptAndCancel {
                router: router.clone(),
                cancel: tx.clone(),
            }),
            Arc::new(StaticPeak::new(false)),
            router,
            assignments.clone(),
            Metrics::new(),
        );

        // select! picks either ready branch; both must end cancelled
        for n in 0..16u128 {
            tx.send_replace(false);
            let result = dispatcher
                .match_order(request(1700 + n, ServiceAreaClass::Urban), &mut rx)
                .await;
            assert_eq!(result.unwrap_err(), MatchError::Cancelled);
        }

        assert!(assignments.is_empty());
        assert_eq!(locks.live_locks(), 0);
        assert!(!cooldowns.is_in_cooldown(&Uuid::from_u128(1)));
    }

    #[test]
    fn engine_side_counts_override_a_stale_snapshot() {
        let h = harness(test_config(), CountingSnapshot::new(Vec::new()), |g| g, false);
        let stale = driver(1, 0.4);
        let now = Utc::now();
        for _ in 0..15 {
            h.cooldowns.record_assignment(stale.driver_id, now);
        }

        let eligible = h.dispatcher.eligible_candidates(&[stale], PICKUP, 2.0);

        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].driver.deliveries_today, 15);
        assert_eq!(eligible[0].driver.last_assignment_at, Some(now));
    }

    #[test]
    fn offline_and_out_of_range_drivers_are_filtered() {
        let h = harness(test_config(), CountingSnapshot::new(Vec::new()), |g| g, false);
        let mut offline = driver(1, 0.4);
        offline.status = DriverStatus::Offline;

        let eligible = h.dispatcher.eligible_candidates(
            &[offline, driver(2, 1.9), driver(3, 2.1), driver(4, 0.3)],
            PICKUP,
            2.0,
        );

        let ids: Vec<u128> = eligible
            .iter()
            .map(|c| c.driver.driver_id.as_u128())
            .collect();
        assert_eq!(ids, vec![4, 2]);
    }
}
