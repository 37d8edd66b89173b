//! Metric instrument factories for scrapeq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"scrapeq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for scrapeq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("scrapeq")
}

/// Counter: submissions accepted by intake.
/// Labels: `result` ("ok" | "invalid" | "error").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("scrapeq.tasks.submitted")
        .with_description("Number of uploads submitted")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("scrapeq.task.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: derived work status changes.
/// Labels: `from`, `to`.
pub fn work_status_changes() -> Counter<u64> {
    meter()
        .u64_counter("scrapeq.work.status_changes")
        .with_description("Number of derived work status changes")
        .build()
}

/// Counter: queue-level operations (send, read, set_vt, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("scrapeq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: admission token operations.
/// Labels: `operation` ("acquired" | "denied" | "conflict" | "released" | "leaked").
pub fn token_operations() -> Counter<u64> {
    meter()
        .u64_counter("scrapeq.tokens.operations")
        .with_description("Number of admission token operations")
        .build()
}

/// Counter: finished delivery attempts.
/// Labels: `outcome`.
pub fn attempts() -> Counter<u64> {
    meter()
        .u64_counter("scrapeq.task.attempts")
        .with_description("Number of handled task deliveries by outcome")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("scrapeq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
