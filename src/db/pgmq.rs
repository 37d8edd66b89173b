//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.archive. [`PgmqQueue`] adapts them to [`JobQueue`].

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{Db, whole_seconds};
use crate::error::Result;
use crate::model::TaskId;
use crate::queue::{Delivery, JobQueue, TaskMessage};
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(self.pool())
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            message,
        });

        record(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Push a message's visibility deadline `vt_seconds` into the future.
    pub async fn set_visibility(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .fetch_optional(self.pool())
            .await?;
        record(queue_name, "set_vt");
        Ok(())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue_name, "archive");
        Ok(())
    }
}

/// [`JobQueue`] over one pgmq queue.
#[derive(Clone)]
pub struct PgmqQueue {
    db: Db,
    name: String,
}

impl PgmqQueue {
    pub fn new(db: Db, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the underlying queue if needed.
    pub async fn ensure(&self) -> Result<()> {
        self.db.create_queue(&self.name).await
    }
}

#[async_trait]
impl JobQueue for PgmqQueue {
    async fn enqueue(&self, task_id: TaskId) -> Result<()> {
        let payload = serde_json::to_value(TaskMessage { task_id })?;
        self.db.send_to_queue(&self.name, &payload, 0).await?;
        Ok(())
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        let Some(msg) = self
            .db
            .read_from_queue(&self.name, whole_seconds(visibility_timeout))
            .await?
        else {
            return Ok(None);
        };

        if msg.read_ct > 1 {
            let age = chrono::Utc::now() - msg.enqueued_at;
            debug!(
                queue = %self.name,
                msg_id = msg.msg_id,
                read_ct = msg.read_ct,
                age_secs = age.num_seconds(),
                "redelivered message"
            );
        }

        match serde_json::from_value::<TaskMessage>(msg.message.clone()) {
            Ok(body) => Ok(Some(Delivery {
                receipt: msg.msg_id,
                task_id: body.task_id,
                delivery_count: msg.read_ct.max(0) as u32,
            })),
            Err(e) => {
                // Can never succeed; take it out of circulation.
                warn!(queue = %self.name, msg_id = msg.msg_id, error = %e, "bad queue payload, archiving");
                self.db.archive_message(&self.name, msg.msg_id).await?;
                Ok(None)
            }
        }
    }

    async fn redeliver_after(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.db
            .set_visibility(&self.name, delivery.receipt, whole_seconds(delay))
            .await
    }

    async fn extend_visibility(
        &self,
        delivery: &Delivery,
        visibility_timeout: Duration,
    ) -> Result<()> {
        self.db
            .set_visibility(&self.name, delivery.receipt, whole_seconds(visibility_timeout).max(1))
            .await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.db.archive_message(&self.name, delivery.receipt).await
    }
}
