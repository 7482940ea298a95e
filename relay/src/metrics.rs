use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_messages_total", "Total messages received from MQTT"),
        &["route"]
    )
    .unwrap();
    pub static ref TELEMETRY_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_telemetry_stored_total",
        "Total sensor readings persisted"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_invalid_messages_total",
        "Total malformed messages dropped"
    ))
    .unwrap();
    pub static ref STATE_CHANGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_state_changes_total",
        "Total device state changes persisted"
    ))
    .unwrap();
    pub static ref STATE_DUPLICATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_state_duplicates_total",
        "Total repeated device states skipped"
    ))
    .unwrap();
    pub static ref RESYNC_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_resync_requests_total",
        "Total state resync requests from devices"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_commands_published_total",
        "Total commands handed to the broker"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref DB_POOL_RESETS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_db_pool_resets_total",
        "Total database pool recreations"
    ))
    .unwrap();
    pub static ref LIVE_SESSIONS: Gauge = Gauge::with_opts(Opts::new(
        "relay_live_sessions",
        "Currently connected live dashboard sessions"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_channel_full_total",
        "Total number of times the inbound channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relay_ingest_latency_seconds",
            "Time taken to persist and fan out one inbound message"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(TELEMETRY_STORED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(STATE_CHANGES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(STATE_DUPLICATES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(RESYNC_REQUESTS_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(DB_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(DB_POOL_RESETS_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(LIVE_SESSIONS.clone())).unwrap();
        REGISTRY
            .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
            .unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
