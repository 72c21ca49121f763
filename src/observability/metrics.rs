use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub match_outcomes_total: IntCounterVec,
    pub match_latency_seconds: HistogramVec,
    pub offers_sent_total: IntCounter,
    pub lock_refusals_total: IntCounter,
    pub escalation_rounds: Histogram,
    pub orders_in_queue: IntGauge,
    pub orders_in_flight: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let match_outcomes_total = IntCounterVec::new(
            Opts::new("match_outcomes_total", "Total matching runs by outcome"),
            &["outcome"],
        )
        .expect("valid match_outcomes_total metric");

        let match_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "match_latency_seconds",
                "Wall time from dispatch start to outcome in seconds",
            )
            .buckets(vec![1.0, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0, 320.0]),
            &["outcome"],
        )
        .expect("valid match_latency_seconds metric");

        let offers_sent_total =
            IntCounter::new("offers_sent_total", "Offers delivered to the notification gateway")
                .expect("valid offers_sent_total metric");

        let lock_refusals_total = IntCounter::new(
            "lock_refusals_total",
            "Driver lock acquisitions refused or failed",
        )
        .expect("valid lock_refusals_total metric");

        let escalation_rounds = Histogram::with_opts(
            HistogramOpts::new("escalation_rounds", "Radius rounds used per matching run")
                .buckets((1..=13).map(f64::from).collect()),
        )
        .expect("valid escalation_rounds metric");

        let orders_in_queue = IntGauge::new("orders_in_queue", "Orders waiting for a dispatcher")
            .expect("valid orders_in_queue metric");

        let orders_in_flight =
            IntGauge::new("orders_in_flight", "Orders currently being matched")
                .expect("valid orders_in_flight metric");

        registry
            .register(Box::new(match_outcomes_total.clone()))
            .expect("register match_outcomes_total");
        registry
            .register(Box::new(match_latency_seconds.clone()))
            .expect("register match_latency_seconds");
        registry
            .register(Box::new(offers_sent_total.clone()))
            .expect("register offers_sent_total");
        registry
            .register(Box::new(lock_refusals_total.clone()))
            .expect("register lock_refusals_total");
        registry
            .register(Box::new(escalation_rounds.clone()))
            .expect("register escalation_rounds");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(orders_in_flight.clone()))
            .expect("register orders_in_flight");

        Self {
            registry,
            match_outcomes_total,
            match_latency_seconds,
            offers_sent_total,
            lock_refusals_total,
            escalation_rounds,
            orders_in_queue,
            orders_in_flight,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
