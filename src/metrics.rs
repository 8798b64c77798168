use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, Histogram, IntCounterVec, register_counter, register_gauge, register_histogram,
    register_int_counter_vec,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of requests").unwrap();
    pub static ref RESPONSES_BY_STATUS: IntCounterVec = register_int_counter_vec!(
        "gateway_responses_total",
        "Responses by HTTP status code",
        &["status"]
    )
    .unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "gateway_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter =
        register_counter!("gateway_rate_limited_total", "Requests rejected by admission control").unwrap();
    pub static ref ABUSE_BLOCKS_TOTAL: Counter =
        register_counter!("gateway_abuse_blocks_total", "Sources banned for bursting").unwrap();
    pub static ref FALLBACK_DISPATCH_TOTAL: Counter =
        register_counter!("gateway_fallback_dispatch_total", "Requests served by a local fallback").unwrap();
    pub static ref CIRCUIT_OPENED_TOTAL: Counter =
        register_counter!("gateway_circuit_opened_total", "Circuit breaker trips").unwrap();
    pub static ref HEALTHY_INSTANCES: Gauge =
        register_gauge!("gateway_healthy_instances", "Healthy service instances after the last sweep").unwrap();
    pub static ref RATE_LIMIT_ENTRIES: Gauge =
        register_gauge!("gateway_rate_limit_entries", "Tracked (category, identifier) pairs").unwrap();
    pub static ref ABUSE_ENTRIES: Gauge =
        register_gauge!("gateway_abuse_entries", "Tracked source IPs").unwrap();
    pub static ref SECURITY_EVENTS: IntCounterVec = register_int_counter_vec!(
        "gateway_security_events_total",
        "Security events by severity",
        &["severity"]
    )
    .unwrap();
}
