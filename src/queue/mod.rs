//! At-least-once work queue carrying task ids.
//!
//! A dequeued message stays invisible for the visibility timeout and comes
//! back if the worker never acknowledges it, which is how a crashed
//! worker's task gets redelivered. Delayed redelivery moves the visibility
//! deadline instead of parking a worker.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::TaskId;

pub use memory::InMemoryJobQueue;

/// Name of the default queue.
pub const DEFAULT_QUEUE: &str = "tasks";

/// Message body put on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
}

/// One delivery of a task id to this worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue-specific handle for ack/redelivery (the pgmq message id).
    pub receipt: i64,
    pub task_id: TaskId,
    /// How many times this message has been handed out, this one included.
    pub delivery_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably enqueue a task id for immediate delivery.
    async fn enqueue(&self, task_id: TaskId) -> Result<()>;

    /// Take the next visible message, hiding it for `visibility_timeout`.
    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>>;

    /// Make this delivery visible again after `delay`.
    async fn redeliver_after(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Keep an in-progress delivery hidden for another `visibility_timeout`
    /// from now. Called periodically while its job body runs.
    async fn extend_visibility(&self, delivery: &Delivery, visibility_timeout: Duration)
    -> Result<()>;

    /// The delivery is terminally handled; it won't come back.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}
