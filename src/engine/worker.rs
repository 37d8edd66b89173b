//! Worker: pulls task ids off the queue, gates each attempt on an admission
//! token, runs the job body, records the outcome, and tells the queue what
//! to do next.
//!
//! Per delivery: load → admit → running → completed | failed → release →
//! ack | redeliver. The coordination path (store and token bookkeeping)
//! stays on the async runtime; job bodies run on blocking threads so a
//! long scrape never stalls queue polling for other tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use super::job::JobBody;
use crate::error::{Error, Result};
use crate::model::{Task, TaskStatus, TaskTransition, WorkStatus};
use crate::queue::{Delivery, JobQueue};
use crate::store::JobStore;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, record_state_transition, start_attempt_span};
use crate::tokens::TokenPool;

/// How long a body past its deadline gets to wind down before the worker
/// stops waiting on it.
pub const DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a dequeued message stays hidden before the queue hands it
    /// out again. Covers crashed workers.
    pub visibility_timeout: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Redelivery delay when no token is available.
    pub admission_backoff: Duration,
    /// Redelivery delay after a failed attempt.
    pub retry_delay: Duration,
    /// Failed attempts retried before a task is left `Failed` for good.
    pub max_retries: u32,
    /// Deadline for one job body invocation.
    pub job_timeout: Duration,
    /// Deliveries this process handles at once.
    pub prefetch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            admission_backoff: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
            max_retries: 3,
            job_timeout: Duration::from_secs(30 * 60),
            prefetch: 4,
        }
    }
}

impl WorkerConfig {
    /// Reject settings the worker can't honor.
    pub fn validate(&self) -> Result<()> {
        if self.visibility_timeout.is_zero() {
            return Err(Error::Config("visibility_timeout must be positive".to_string()));
        }
        if self.job_timeout.is_zero() {
            return Err(Error::Config("job_timeout must be positive".to_string()));
        }
        if self.prefetch == 0 {
            return Err(Error::Config("prefetch must be at least 1".to_string()));
        }
        Ok(())
    }

    /// How often a running attempt pushes its delivery's visibility deadline
    /// out again. Half the window, so one missed beat is survivable.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.visibility_timeout / 2).max(Duration::from_millis(1))
    }
}

/// How one delivery was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Task id resolved to nothing; delivery acknowledged.
    Dropped,
    /// Task already completed by an earlier delivery; acknowledged.
    AlreadyCompleted,
    /// Work was cancelled before this task started; acknowledged.
    Skipped,
    /// No token (or admission could not be confirmed); redelivery scheduled.
    Deferred,
    Completed { result_path: String },
    /// The attempt failed. `retrying` is false once the retry ceiling is
    /// reached and the delivery was acknowledged.
    Failed {
        error: String,
        attempts: u32,
        retrying: bool,
    },
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Dropped => "dropped",
            AttemptOutcome::AlreadyCompleted => "already_completed",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Deferred => "deferred",
            AttemptOutcome::Completed { .. } => "completed",
            AttemptOutcome::Failed { retrying: true, .. } => "failed_retrying",
            AttemptOutcome::Failed { retrying: false, .. } => "failed_final",
        }
    }
}

/// A worker process's handle on the shared store, queue, and token pool.
/// Clones share everything, including the shutdown signal.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    tokens: TokenPool,
    body: Arc<dyn JobBody>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        tokens: TokenPool,
        body: Arc<dyn JobBody>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            tokens,
            body,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Signal the worker loop to stop taking deliveries.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Poll the queue until shutdown, handling up to `prefetch` deliveries at
    /// once. In-flight attempts are drained before returning.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        let slots = Arc::new(Semaphore::new(self.config.prefetch.max(1)));
        let mut in_flight = JoinSet::new();

        info!(prefetch = self.config.prefetch, "worker started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("attempt task panicked: {e}");
                }
            }

            let slot = tokio::select! {
                _ = self.shutdown.notified() => break,
                slot = Arc::clone(&slots).acquire_owned() => slot
                    .map_err(|e| Error::Other(format!("worker slots closed: {e}")))?,
            };

            let delivery = match self.queue.dequeue(self.config.visibility_timeout).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(slot);
                    if self.idle().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("dequeue failed: {e}");
                    drop(slot);
                    if self.idle().await {
                        break;
                    }
                    continue;
                }
            };

            let worker = self.clone();
            in_flight.spawn(async move {
                let _slot = slot;
                let task_id = delivery.task_id;
                if let Err(e) = worker.handle_delivery(delivery).await {
                    // Left un-acked: the visibility timeout brings it back.
                    error!(task_id = %task_id, "attempt aborted, awaiting redelivery: {e}");
                }
            });
        }

        info!(in_flight = in_flight.len(), "worker shutting down, draining attempts");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("attempt task panicked: {e}");
            }
        }
        Ok(())
    }

    /// Wait out one poll interval. Returns true if shutdown was requested.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.notified() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }

    /// Dequeue and handle a single delivery inline. `None` if the queue had
    /// nothing visible.
    pub async fn run_once(&self) -> Result<Option<AttemptOutcome>> {
        match self.queue.dequeue(self.config.visibility_timeout).await? {
            Some(delivery) => self.handle_delivery(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle one delivery end to end.
    ///
    /// `Err` means the coordination path could not record state (store or
    /// queue unavailable); the delivery is then left un-acknowledged for the
    /// queue to hand out again. Any token taken has been given back by then.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<AttemptOutcome> {
        let span = start_attempt_span(delivery.task_id, delivery.delivery_count);
        let result = self
            .attempt(&delivery, &span)
            .instrument(span.clone())
            .await;
        match &result {
            Ok(outcome) => {
                record_outcome(&span, outcome.label());
                metrics::attempts().add(1, &[KeyValue::new("outcome", outcome.label())]);
            }
            Err(_) => {
                record_outcome(&span, "aborted");
                metrics::attempts().add(1, &[KeyValue::new("outcome", "aborted")]);
            }
        }
        result
    }

    async fn attempt(&self, delivery: &Delivery, span: &tracing::Span) -> Result<AttemptOutcome> {
        let Some(task) = self.store.get_task(delivery.task_id).await? else {
            warn!(task_id = %delivery.task_id, "task not found, dropping delivery");
            self.queue.ack(delivery).await?;
            return Ok(AttemptOutcome::Dropped);
        };

        if task.status == TaskStatus::Completed {
            debug!(task_id = %task.id, "task already completed, acknowledging duplicate delivery");
            self.queue.ack(delivery).await?;
            return Ok(AttemptOutcome::AlreadyCompleted);
        }

        if task.status == TaskStatus::Pending {
            let cancelled = self
                .store
                .get_work(task.work_id)
                .await?
                .is_some_and(|w| w.status == WorkStatus::Cancelled);
            if cancelled {
                info!(task_id = %task.id, work_id = %task.work_id, "work cancelled, skipping task");
                self.queue.ack(delivery).await?;
                return Ok(AttemptOutcome::Skipped);
            }
        }

        let token = match self.tokens.try_acquire_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!(
                    task_id = %task.id,
                    backoff_secs = self.config.admission_backoff.as_secs_f64(),
                    "no tokens available, redelivering later"
                );
                self.queue
                    .redeliver_after(delivery, self.config.admission_backoff)
                    .await?;
                return Ok(AttemptOutcome::Deferred);
            }
            Err(e) if e.is_transient() => {
                warn!(task_id = %task.id, "could not confirm admission: {e}");
                self.queue
                    .redeliver_after(delivery, self.config.admission_backoff)
                    .await?;
                return Ok(AttemptOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };

        // Token held from here; released on every path below.
        let outcome = self.run_admitted(delivery, &task, span).await;
        // A failed release is logged as a leak by the token itself; the
        // attempt's outcome stands.
        let _ = token.release().await;
        let outcome = outcome?;

        match &outcome {
            AttemptOutcome::Completed { .. } | AttemptOutcome::Failed { retrying: false, .. } => {
                self.queue.ack(delivery).await?;
            }
            AttemptOutcome::Failed { retrying: true, .. } => {
                self.queue
                    .redeliver_after(delivery, self.config.retry_delay)
                    .await?;
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Steps run under a held token: mark running, execute, persist outcome.
    async fn run_admitted(
        &self,
        delivery: &Delivery,
        task: &Task,
        span: &tracing::Span,
    ) -> Result<AttemptOutcome> {
        self.store
            .transition_task(task.id, TaskTransition::Running)
            .await?;
        record_state_transition(span, &task.status.to_string(), "running");

        let executed = if task.has_payload() {
            self.execute(delivery, task).await
        } else {
            Err(Error::Validation("task payload is empty".to_string()))
        };

        match executed {
            Ok(result_path) => {
                self.store
                    .transition_task(
                        task.id,
                        TaskTransition::Completed {
                            result_path: result_path.clone(),
                        },
                    )
                    .await?;
                record_state_transition(span, "running", "completed");
                info!(task_id = %task.id, result = %result_path, "task completed");
                Ok(AttemptOutcome::Completed { result_path })
            }
            Err(e) => {
                let error = e.to_string();
                let failed = self
                    .store
                    .transition_task(task.id, TaskTransition::Failed { error: error.clone() })
                    .await?;
                record_state_transition(span, "running", "failed");
                let retrying = failed.attempts <= self.config.max_retries;
                if retrying {
                    warn!(task_id = %task.id, attempts = failed.attempts, %error, "task failed, will retry");
                } else {
                    error!(task_id = %task.id, attempts = failed.attempts, %error, "task failed, retries exhausted");
                }
                Ok(AttemptOutcome::Failed {
                    error,
                    attempts: failed.attempts,
                    retrying,
                })
            }
        }
    }

    /// Run the job body on a blocking thread under the execution deadline.
    ///
    /// The delivery's visibility is extended on every heartbeat until the
    /// body returns, so no other worker picks the task up meanwhile. Past
    /// the deadline the body gets [`DEADLINE_GRACE`] to stop; the token is
    /// only given back after that.
    async fn execute(&self, delivery: &Delivery, task: &Task) -> Result<String> {
        let body = Arc::clone(&self.body);
        let payload = task.payload.clone();
        let start = Instant::now();
        let deadline = start + self.config.job_timeout;

        let mut handle = tokio::task::spawn_blocking(move || body.run(&payload, deadline));

        let beat = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + beat, beat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let limit = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(limit);
        let mut overdue = false;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break Some(joined),
                _ = &mut limit => {
                    if overdue {
                        break None;
                    }
                    overdue = true;
                    limit.as_mut().reset(tokio::time::Instant::now() + DEADLINE_GRACE);
                }
                _ = heartbeat.tick() => self.extend_visibility(delivery).await,
            }
        };

        let result = match joined {
            _ if overdue => {
                if joined.is_none() {
                    error!(task_id = %task.id, "job body ignored its deadline and is still running");
                }
                Err(Error::JobBody(format!(
                    "timed out after {}s",
                    self.config.job_timeout.as_secs_f64()
                )))
            }
            None => Err(Error::Other("job wait ended without a result".to_string())),
            Some(Err(join)) => Err(Error::JobBody(format!("job body panicked: {join}"))),
            Some(Ok(Err(e))) => Err(Error::JobBody(format!("{e:#}"))),
            Some(Ok(Ok(result_path))) => Ok(result_path),
        };

        metrics::operation_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "job.execute")],
        );
        result
    }

    async fn extend_visibility(&self, delivery: &Delivery) {
        match self
            .queue
            .extend_visibility(delivery, self.config.visibility_timeout)
            .await
        {
            Ok(()) => debug!(task_id = %delivery.task_id, "delivery visibility extended"),
            // The task may now be handed out twice.
            Err(e) => warn!(task_id = %delivery.task_id, "could not extend delivery visibility: {e}"),
        }
    }
}
