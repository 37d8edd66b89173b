//! Task attempt span helpers.
//!
//! One span covers a delivery from dequeue to ack/redelivery.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one delivery of a task.
///
/// `task.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_attempt_span(task_id: TaskId, delivery_count: u32) -> Span {
    tracing::info_span!(
        "task.attempt",
        "task.id" = %task_id,
        "task.delivery" = delivery_count,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

/// Record how the attempt ended.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
}
