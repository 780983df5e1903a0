/// Prometheus metrics for the gate service
///
/// Covers HTTP traffic, device lifecycle transitions, SMS delivery and
/// reconciliation, security chain failures, scan outcomes and background jobs.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, Gauge, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Requests per route template
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gate_http_requests_total",
        "HTTP requests by method, route and status code",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gate_http_request_duration_seconds",
        "Time to answer an HTTP request",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    /// Device trust lifecycle transitions
    pub static ref DEVICE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "device_transitions_total",
        "Device trust state transitions",
        &["transition"]
    )
    .unwrap();

    /// Outbound and inbound SMS events
    pub static ref SMS_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sms_events_total",
        "SMS verification events by kind",
        &["event"]
    )
    .unwrap();

    /// Users currently over the reset threshold
    pub static ref FLAGGED_USERS: IntGauge = register_int_gauge!(
        "device_reset_flagged_users",
        "Users flagged for repeated admin device resets"
    )
    .unwrap();

    /// Security chain failures by the level that failed
    pub static ref CHAIN_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "security_chain_failures_total",
        "Security chain failures by level",
        &["level"]
    )
    .unwrap();

    /// Scan attempts by action type and outcome
    pub static ref SCANS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "qr_scans_total",
        "QR scan attempts by action type and outcome",
        &["action_type", "outcome"]
    )
    .unwrap();

    /// Scheduled maintenance runs
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gate_background_jobs_total",
        "Background job runs by job and result",
        &["job", "status"]
    )
    .unwrap();

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gate_background_job_duration_seconds",
        "Time spent in one background job run",
        &["job"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "gate_uptime_seconds",
        "Seconds since the process started"
    )
    .unwrap();

    static ref STARTED_AT: std::time::Instant = std::time::Instant::now();
}

/// Pin the uptime origin to process start
pub fn mark_started() {
    lazy_static::initialize(&STARTED_AT);
}

pub fn uptime_seconds() -> f64 {
    let uptime = STARTED_AT.elapsed().as_secs_f64();
    UPTIME_SECONDS.set(uptime);
    uptime
}

/// Everything registered, in the Prometheus text exposition format
pub fn render_metrics() -> String {
    uptime_seconds();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

pub fn record_device_transition(transition: &str) {
    DEVICE_TRANSITIONS_TOTAL.with_label_values(&[transition]).inc();
}

pub fn record_sms(event: &str) {
    SMS_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn set_flagged_users(count: usize) {
    FLAGGED_USERS.set(count as i64);
}

/// Record a security chain failure at `level`
pub fn record_chain_failure(level: &str) {
    CHAIN_FAILURES_TOTAL.with_label_values(&[level]).inc();
}

pub fn record_scan(action_type: &str, outcome: &str) {
    SCANS_TOTAL.with_label_values(&[action_type, outcome]).inc();
}

pub fn record_background_job(job: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL.with_label_values(&[job, status]).inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration);
}
