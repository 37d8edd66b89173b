//! In-memory job store for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::JobStore;
use crate::error::{Error, Result};
use crate::model::{NewTask, NewWork, Task, TaskId, TaskTransition, Work, WorkId, WorkStatus};

#[derive(Default)]
struct Tables {
    works: HashMap<WorkId, Work>,
    tasks: HashMap<TaskId, Task>,
    /// Task ids per work, in creation order.
    owned: HashMap<WorkId, Vec<TaskId>>,
    /// Work ids in creation order.
    order: Vec<WorkId>,
}

impl Tables {
    fn tasks_of(&self, work_id: WorkId) -> Vec<Task> {
        self.owned
            .get(&work_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    fn rederive(&mut self, work_id: WorkId) {
        let tasks = self.tasks_of(work_id);
        if let Some(work) = self.works.get_mut(&work_id) {
            work.apply_derived(&tasks, Utc::now());
        }
    }
}

/// Works and tasks held in one mutex, so each call is its own transaction.
///
/// `set_available(false)` makes every call fail with `StoreUnavailable`.
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn work_count(&self) -> usize {
        self.tables.lock().works.len()
    }

    pub fn task_count(&self) -> usize {
        self.tables.lock().tasks.len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("job store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_submission(
        &self,
        work: NewWork,
        tasks: Vec<NewTask>,
    ) -> Result<(Work, Vec<Task>)> {
        self.check()?;
        if tasks.is_empty() {
            return Err(Error::Validation("a work needs at least one task".to_string()));
        }
        let now = Utc::now();
        let mut work = work.into_work(now);
        work.check_capacity(0, tasks.len())?;

        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|t| t.into_task(work.id, now))
            .collect();
        work.apply_derived(&tasks, now);

        let mut tables = self.tables.lock();
        if tables.works.contains_key(&work.id) {
            return Err(Error::Other(format!("work {} already exists", work.id)));
        }
        tables.order.push(work.id);
        tables
            .owned
            .insert(work.id, tasks.iter().map(|t| t.id).collect());
        for task in &tasks {
            tables.tasks.insert(task.id, task.clone());
        }
        tables.works.insert(work.id, work.clone());
        Ok((work, tasks))
    }

    async fn attach_task(&self, work_id: WorkId, task: NewTask) -> Result<Task> {
        self.check()?;
        let mut tables = self.tables.lock();
        let work = tables
            .works
            .get(&work_id)
            .ok_or_else(|| Error::NotFound(format!("work {work_id}")))?;
        let current = tables.owned.get(&work_id).map_or(0, Vec::len);
        work.check_capacity(current, 1)?;

        let task = task.into_task(work_id, Utc::now());
        tables.tasks.insert(task.id, task.clone());
        tables.owned.entry(work_id).or_default().push(task.id);
        tables.rederive(work_id);
        Ok(task)
    }

    async fn get_work(&self, id: WorkId) -> Result<Option<Work>> {
        self.check()?;
        Ok(self.tables.lock().works.get(&id).cloned())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.check()?;
        Ok(self.tables.lock().tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, work_id: WorkId) -> Result<Vec<Task>> {
        self.check()?;
        Ok(self.tables.lock().tasks_of(work_id))
    }

    async fn list_works(&self, limit: i64) -> Result<Vec<Work>> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables
            .order
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .filter_map(|id| tables.works.get(id).cloned())
            .collect())
    }

    async fn transition_task(&self, id: TaskId, transition: TaskTransition) -> Result<Task> {
        self.check()?;
        let mut tables = self.tables.lock();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        task.apply(&transition, Utc::now())?;
        let task = task.clone();
        tables.rederive(task.work_id);
        Ok(task)
    }

    async fn cancel_work(&self, id: WorkId) -> Result<Work> {
        self.check()?;
        let mut tables = self.tables.lock();
        let work = tables
            .works
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("work {id}")))?;
        work.status = WorkStatus::Cancelled;
        work.updated_at = Utc::now();
        Ok(work.clone())
    }

    async fn delete_work(&self, id: WorkId) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.lock();
        if tables.works.remove(&id).is_none() {
            return Err(Error::NotFound(format!("work {id}")));
        }
        tables.order.retain(|w| *w != id);
        for task_id in tables.owned.remove(&id).unwrap_or_default() {
            tables.tasks.remove(&task_id);
        }
        Ok(())
    }
}
