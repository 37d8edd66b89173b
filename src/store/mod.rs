//! Transactional persistence for works and tasks.
//!
//! `Work` is the aggregate root. Every call that attaches a task or moves
//! one through its lifecycle recomputes the owning work's derived status in
//! the same transaction, so the two records never drift apart.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{NewTask, NewWork, Task, TaskId, TaskTransition, Work, WorkId};

pub use memory::InMemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a work and its tasks atomically. Fails with `Validation` on an
    /// empty task list and `MaxTasksExceeded` past the cap; either way
    /// nothing is created.
    async fn create_submission(&self, work: NewWork, tasks: Vec<NewTask>)
    -> Result<(Work, Vec<Task>)>;

    /// Attach one more task to an existing work, honoring `max_tasks`.
    async fn attach_task(&self, work_id: WorkId, task: NewTask) -> Result<Task>;

    async fn get_work(&self, id: WorkId) -> Result<Option<Work>>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Tasks owned by a work, oldest first.
    async fn list_tasks(&self, work_id: WorkId) -> Result<Vec<Task>>;

    /// Most recent works first.
    async fn list_works(&self, limit: i64) -> Result<Vec<Work>>;

    /// Apply a lifecycle transition and recompute the owning work.
    ///
    /// `Failed` increments `attempts` inside the store, never from a cached
    /// copy, so racing writers cannot lose an increment. Fails with
    /// `NotFound` if the task doesn't exist.
    async fn transition_task(&self, id: TaskId, transition: TaskTransition) -> Result<Task>;

    /// Mark a work cancelled. Tasks already dequeued still run to completion.
    async fn cancel_work(&self, id: WorkId) -> Result<Work>;

    /// Remove a work and its tasks.
    async fn delete_work(&self, id: WorkId) -> Result<()>;
}
