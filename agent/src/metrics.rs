use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref TELEMETRY_SENT_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agent_telemetry_sent_total",
        "Total telemetry samples handed to the uplink"
    ))
    .unwrap();
    pub static ref TELEMETRY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agent_telemetry_failures_total",
        "Total telemetry samples the uplink failed to send"
    ))
    .unwrap();
    pub static ref METHODS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("agent_methods_total", "Direct method invocations by result status"),
        &["method", "status"]
    )
    .unwrap();
    pub static ref DESIRED_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agent_desired_updates_total",
        "Desired-state deltas that changed the telemetry interval"
    ))
    .unwrap();
    pub static ref REPORT_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "agent_report_failures_total",
        "Reported-state updates that failed"
    ))
    .unwrap();
    pub static ref TELEMETRY_INTERVAL_SECONDS: Gauge = Gauge::with_opts(Opts::new(
        "agent_telemetry_interval_seconds",
        "Currently applied telemetry interval"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(TELEMETRY_SENT_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(TELEMETRY_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(METHODS_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(DESIRED_UPDATES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(REPORT_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(TELEMETRY_INTERVAL_SECONDS.clone()))
            .unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
