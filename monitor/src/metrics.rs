use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_messages_total",
        "Total telemetry messages delivered to widgets"
    ))
    .unwrap();
    pub static ref DECODE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_decode_failures_total",
        "Total payloads dropped because they could not be decoded"
    ))
    .unwrap();
    pub static ref POINTS_APPENDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_points_appended_total",
        "Total points appended to series buffers"
    ))
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_dropped_messages_total",
        "Total messages dropped because a widget channel was full"
    ))
    .unwrap();
    pub static ref RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_reconnects_total",
        "Total broker connection failures followed by a retry"
    ))
    .unwrap();
    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = Gauge::with_opts(Opts::new(
        "monitor_active_subscriptions",
        "Widget subscriptions currently held across all connections"
    ))
    .unwrap();
    pub static ref OUT_OF_BAND_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_out_of_band_total",
        "Total transitions of a series into the out-of-band state"
    ))
    .unwrap();
    pub static ref KEY_INVALIDATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_key_invalidations_total",
        "Total known-key invalidations triggered by unseen payload keys"
    ))
    .unwrap();
    pub static ref REST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_rest_failures_total",
        "Total REST fetches that failed after all retries"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECODE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POINTS_APPENDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SUBSCRIPTIONS.clone()))?;
    REGISTRY.register(Box::new(OUT_OF_BAND_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KEY_INVALIDATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REST_FAILURES_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
