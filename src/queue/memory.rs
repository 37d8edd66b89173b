//! In-memory queue with visibility timeouts on the Tokio clock.
//!
//! Uses `tokio::time::Instant`, so tests running on a paused clock can
//! advance through backoffs without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Delivery, JobQueue};
use crate::error::{Error, Result};
use crate::model::TaskId;

#[derive(Debug, Clone)]
struct Message {
    receipt: i64,
    task_id: TaskId,
    visible_at: Instant,
    read_count: u32,
}

#[derive(Default)]
struct QueueState {
    next_receipt: i64,
    messages: Vec<Message>,
    acked: Vec<TaskId>,
    redeliveries: Vec<(TaskId, Duration)>,
    extensions: usize,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Messages not yet acknowledged, visible or not.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Task ids acknowledged so far, in order.
    pub fn acked(&self) -> Vec<TaskId> {
        self.state.lock().acked.clone()
    }

    /// Every `redeliver_after` call so far, in order.
    pub fn redeliveries(&self) -> Vec<(TaskId, Duration)> {
        self.state.lock().redeliveries.clone()
    }

    /// How many times a delivery's visibility was extended.
    pub fn extensions(&self) -> usize {
        self.state.lock().extensions
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("queue offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, task_id: TaskId) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.next_receipt += 1;
        let receipt = state.next_receipt;
        state.messages.push(Message {
            receipt,
            task_id,
            visible_at: Instant::now(),
            read_count: 0,
        });
        Ok(())
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let next = state
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| (m.visible_at, m.receipt));
        Ok(next.map(|m| {
            m.visible_at = now + visibility_timeout;
            m.read_count += 1;
            Delivery {
                receipt: m.receipt,
                task_id: m.task_id,
                delivery_count: m.read_count,
            }
        }))
    }

    async fn redeliver_after(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.receipt == delivery.receipt)
            .ok_or_else(|| Error::NotFound(format!("queue message {}", delivery.receipt)))?;
        message.visible_at = Instant::now() + delay;
        state.redeliveries.push((delivery.task_id, delay));
        Ok(())
    }

    async fn extend_visibility(
        &self,
        delivery: &Delivery,
        visibility_timeout: Duration,
    ) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.receipt == delivery.receipt)
            .ok_or_else(|| Error::NotFound(format!("queue message {}", delivery.receipt)))?;
        message.visible_at = Instant::now() + visibility_timeout;
        state.extensions += 1;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let before = state.messages.len();
        state.messages.retain(|m| m.receipt != delivery.receipt);
        if state.messages.len() == before {
            return Err(Error::NotFound(format!("queue message {}", delivery.receipt)));
        }
        state.acked.push(delivery.task_id);
        Ok(())
    }
}
