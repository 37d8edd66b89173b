//! Integration tests for telemetry initialization and span helpers.

use scrapeq::model::TaskId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = scrapeq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "scrapeq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = scrapeq::telemetry::init_telemetry(config);
}

#[test]
fn attempt_span_records_transition_and_outcome() {
    let span = scrapeq::telemetry::task::start_attempt_span(TaskId::new(), 1);
    scrapeq::telemetry::task::record_state_transition(&span, "pending", "running");
    scrapeq::telemetry::task::record_outcome(&span, "completed");
}
