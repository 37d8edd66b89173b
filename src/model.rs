//! Core data model.
//!
//! A `Work` is one uploaded file; it owns the `Task`s derived from it. A task
//! is one schedulable unit of background processing with its own retryable
//! lifecycle. Work status is never set directly: it is derived from the
//! owned tasks every time one of them is attached or changes state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Newtype for work (job group) ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for task ids. This is what travels through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a work (job group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Set administratively. Never overwritten by derivation.
    Cancelled,
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "in_progress" => Ok(WorkStatus::InProgress),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            "cancelled" => Ok(WorkStatus::Cancelled),
            other => Err(Error::Other(format!("unknown work status: {other}"))),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by intake, waiting for a worker holding a token.
    Pending,
    /// A worker holds an admission token and the job body is executing.
    Running,
    /// Done; `result_path` is set.
    Completed,
    /// Last attempt failed; may still be redelivered by the queue.
    Failed,
}

impl TaskStatus {
    /// Can a task move from `self` to `to`?
    ///
    /// Any state may (re-)enter `Running`: `Failed -> Running` is the queue's
    /// retry, the others only happen when a redelivery races an attempt that
    /// was never acknowledged. Outcomes require the task to have started;
    /// between racing attempts the last write wins.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match to {
            Running => true,
            Completed | Failed => self != Pending,
            Pending => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

/// Derive a work's status from the statuses of the tasks it owns.
///
/// `Completed` iff every task is completed, `InProgress` if any is running,
/// `Failed` if any failed and none is running, `Pending` otherwise. A work
/// with no tasks has nothing done yet and stays `Pending`.
pub fn derive_work_status(tasks: &[TaskStatus]) -> WorkStatus {
    if tasks.is_empty() {
        return WorkStatus::Pending;
    }
    if tasks.iter().all(|s| *s == TaskStatus::Completed) {
        WorkStatus::Completed
    } else if tasks.contains(&TaskStatus::Running) {
        WorkStatus::InProgress
    } else if tasks.contains(&TaskStatus::Failed) {
        WorkStatus::Failed
    } else {
        WorkStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A job group: one uploaded file and the tasks derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub filename: String,
    /// Where the raw upload was persisted.
    pub storage_path: String,
    pub status: WorkStatus,
    /// Optional cap on attached tasks. Additions beyond it are rejected.
    pub max_tasks: Option<u32>,
    /// Consolidated result, once one exists.
    pub output_path: Option<String>,
    /// Last fatal error.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Work {
    /// Would attaching `additional` tasks to a work already owning `current`
    /// break the `max_tasks` cap?
    pub fn check_capacity(&self, current: usize, additional: usize) -> Result<()> {
        match self.max_tasks {
            Some(max) if current + additional > max as usize => Err(Error::MaxTasksExceeded {
                work_id: self.id,
                max,
            }),
            _ => Ok(()),
        }
    }

    /// Apply the derived status for the given task snapshot, plus the derived
    /// `error`/`output_path` fields. Returns true if anything changed.
    pub(crate) fn apply_derived(&mut self, tasks: &[Task], now: DateTime<Utc>) -> bool {
        if self.status == WorkStatus::Cancelled {
            return false;
        }
        let statuses: Vec<TaskStatus> = tasks.iter().map(|t| t.status).collect();
        let derived = derive_work_status(&statuses);
        let mut changed = derived != self.status;
        self.status = derived;

        match derived {
            WorkStatus::Failed => {
                let latest = tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Failed)
                    .max_by_key(|t| t.updated_at)
                    .and_then(|t| t.error.clone());
                if latest.is_some() && latest != self.error {
                    self.error = latest;
                    changed = true;
                }
            }
            WorkStatus::Completed if tasks.len() == 1 && self.output_path.is_none() => {
                self.output_path = tasks[0].result_path.clone();
                changed = true;
            }
            _ => {}
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }
}

/// One unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub work_id: WorkId,
    /// Opaque data for the job body (e.g. `{"csv_path": "..."}`).
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Set only when completed.
    pub result_path: Option<String>,
    /// Failed execution attempts. Admission denials don't count.
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Does the payload carry anything for the job body to work on?
    pub fn has_payload(&self) -> bool {
        match &self.payload {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::String(s) => !s.trim().is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }

    /// Apply a transition to this in-memory copy.
    pub(crate) fn apply(&mut self, transition: &TaskTransition, now: DateTime<Utc>) -> Result<()> {
        let to = transition.target();
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match transition {
            TaskTransition::Running => {}
            TaskTransition::Completed { result_path } => {
                self.result_path = Some(result_path.clone());
            }
            TaskTransition::Failed { error } => {
                self.attempts += 1;
                self.error = Some(error.clone());
            }
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// A state change requested by the worker for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    Running,
    Completed { result_path: String },
    /// Increments `attempts` atomically in the store.
    Failed { error: String },
}

impl TaskTransition {
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Running => TaskStatus::Running,
            TaskTransition::Completed { .. } => TaskStatus::Completed,
            TaskTransition::Failed { .. } => TaskStatus::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Parameters for creating a work.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub(crate) id: WorkId,
    pub(crate) filename: String,
    pub(crate) storage_path: String,
    pub(crate) max_tasks: Option<u32>,
}

impl NewWork {
    pub fn new(filename: impl Into<String>, storage_path: impl Into<String>) -> Self {
        Self {
            id: WorkId::new(),
            filename: filename.into(),
            storage_path: storage_path.into(),
            max_tasks: None,
        }
    }

    /// Use a pre-allocated id (intake picks the id before writing the upload).
    pub fn id(mut self, id: WorkId) -> Self {
        self.id = id;
        self
    }

    pub fn max_tasks(mut self, n: u32) -> Self {
        self.max_tasks = Some(n);
        self
    }

    pub(crate) fn into_work(self, now: DateTime<Utc>) -> Work {
        Work {
            id: self.id,
            filename: self.filename,
            storage_path: self.storage_path,
            status: WorkStatus::Pending,
            max_tasks: self.max_tasks,
            output_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) payload: serde_json::Value,
}

impl NewTask {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }

    pub(crate) fn into_task(self, work_id: WorkId, now: DateTime<Utc>) -> Task {
        Task {
            id: TaskId::new(),
            work_id,
            payload: self.payload,
            status: TaskStatus::Pending,
            result_path: None,
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
