use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref DEVICE_EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_device_events_total",
        "Total normalized device events decoded from device topics"
    ))
    .unwrap();
    pub static ref INVALID_EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_events_total",
        "Total malformed payloads rejected at the ingestion boundary"
    ))
    .unwrap();
    pub static ref SYNC_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_sync_failures_total",
        "Total device-record reconciles that failed against the store"
    ))
    .unwrap();
    pub static ref PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_published_total",
        "Total messages fanned out to live subscribers"
    ))
    .unwrap();
    pub static ref SUBSCRIBER_DROPS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_subscriber_drops_total",
        "Total dead subscribers pruned during fan-out"
    ))
    .unwrap();
    pub static ref LIVE_SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_live_subscribers",
        "Currently registered live subscriptions"
    ))
    .unwrap();
    pub static ref RECONCILE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_reconcile_latency_seconds",
            "Time taken to reconcile one device event against the store"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DEVICE_EVENTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_EVENTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SYNC_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(PUBLISHED_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(SUBSCRIBER_DROPS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LIVE_SUBSCRIBERS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RECONCILE_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
