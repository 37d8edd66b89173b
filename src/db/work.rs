//! Work and task persistence: atomic submission, lifecycle transitions,
//! derived work status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::JobStore;
use crate::telemetry::metrics;

const WORK_COLUMNS: &str =
    "id, filename, storage_path, status, max_tasks, output_path, error, created_at, updated_at";
const TASK_COLUMNS: &str =
    "id, work_id, payload, status, result_path, attempts, error, created_at, updated_at";

async fn insert_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO tasks (id, work_id, payload, status, result_path, attempts, error, created_at, updated_at)
         VALUES ($1, $2, $3, $4, NULL, 0, NULL, $5, $5)",
    )
    .bind(task.id.0)
    .bind(task.work_id.0)
    .bind(&task.payload)
    .bind(task.status.to_string())
    .bind(task.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_work(tx: &mut Transaction<'_, Postgres>, id: WorkId) -> Result<Work> {
    let row: Option<WorkRow> = sqlx::query_as(&format!(
        "SELECT {WORK_COLUMNS} FROM works WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.0)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| Error::NotFound(format!("work {id}")))?
        .try_into_work()
}

async fn tasks_of(tx: &mut Transaction<'_, Postgres>, work_id: WorkId) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE work_id = $1 ORDER BY created_at, id"
    ))
    .bind(work_id.0)
    .fetch_all(&mut **tx)
    .await?;
    rows.into_iter().map(TaskRow::try_into_task).collect()
}

/// Recompute a locked work's derived fields from its current tasks.
async fn rederive(tx: &mut Transaction<'_, Postgres>, mut work: Work) -> Result<Work> {
    let tasks = tasks_of(tx, work.id).await?;
    let before = work.status;
    if work.apply_derived(&tasks, Utc::now()) {
        sqlx::query(
            "UPDATE works SET status = $1, output_path = $2, error = $3, updated_at = $4 WHERE id = $5",
        )
        .bind(work.status.to_string())
        .bind(&work.output_path)
        .bind(&work.error)
        .bind(work.updated_at)
        .bind(work.id.0)
        .execute(&mut **tx)
        .await?;
        if before != work.status {
            metrics::work_status_changes().add(
                1,
                &[
                    KeyValue::new("from", before.to_string()),
                    KeyValue::new("to", work.status.to_string()),
                ],
            );
        }
    }
    Ok(work)
}

#[async_trait]
impl JobStore for Db {
    async fn create_submission(
        &self,
        work: NewWork,
        tasks: Vec<NewTask>,
    ) -> Result<(Work, Vec<Task>)> {
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

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO works (id, filename, storage_path, status, max_tasks, output_path, error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, $6)",
        )
        .bind(work.id.0)
        .bind(&work.filename)
        .bind(&work.storage_path)
        .bind(work.status.to_string())
        .bind(work.max_tasks.map(|n| n as i32))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for task in &tasks {
            insert_task(&mut tx, task).await?;
        }
        tx.commit().await?;

        Ok((work, tasks))
    }

    async fn attach_task(&self, work_id: WorkId, task: NewTask) -> Result<Task> {
        let mut tx = self.pool().begin().await?;
        // The row lock serializes concurrent attachments against the cap.
        let work = lock_work(&mut tx, work_id).await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE work_id = $1")
            .bind(work_id.0)
            .fetch_one(&mut *tx)
            .await?;
        work.check_capacity(count as usize, 1)?;

        let task = task.into_task(work_id, Utc::now());
        insert_task(&mut tx, &task).await?;
        rederive(&mut tx, work).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn get_work(&self, id: WorkId) -> Result<Option<Work>> {
        let row: Option<WorkRow> =
            sqlx::query_as(&format!("SELECT {WORK_COLUMNS} FROM works WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        row.map(WorkRow::try_into_work).transpose()
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn list_tasks(&self, work_id: WorkId) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE work_id = $1 ORDER BY created_at, id"
        ))
        .bind(work_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn list_works(&self, limit: i64) -> Result<Vec<Work>> {
        let rows: Vec<WorkRow> = sqlx::query_as(&format!(
            "SELECT {WORK_COLUMNS} FROM works ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(WorkRow::try_into_work).collect()
    }

    async fn transition_task(&self, id: TaskId, transition: TaskTransition) -> Result<Task> {
        let mut tx = self.pool().begin().await?;

        let owner: Option<(Uuid,)> = sqlx::query_as("SELECT work_id FROM tasks WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let (work_id,) = owner.ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        // Lock order: work, then task.
        let work = lock_work(&mut tx, WorkId(work_id)).await?;

        let (current,): (String,) =
            sqlx::query_as("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_one(&mut *tx)
                .await?;
        let from: TaskStatus = current.parse()?;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let row: TaskRow = match &transition {
            TaskTransition::Running => {
                sqlx::query_as(&format!(
                    "UPDATE tasks SET status = 'running', updated_at = $2
                     WHERE id = $1 RETURNING {TASK_COLUMNS}"
                ))
                .bind(id.0)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
            TaskTransition::Completed { result_path } => {
                sqlx::query_as(&format!(
                    "UPDATE tasks SET status = 'completed', result_path = $2, updated_at = $3
                     WHERE id = $1 RETURNING {TASK_COLUMNS}"
                ))
                .bind(id.0)
                .bind(result_path)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
            TaskTransition::Failed { error } => {
                sqlx::query_as(&format!(
                    "UPDATE tasks SET status = 'failed', error = $2, attempts = attempts + 1, updated_at = $3
                     WHERE id = $1 RETURNING {TASK_COLUMNS}"
                ))
                .bind(id.0)
                .bind(error)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        rederive(&mut tx, work).await?;
        tx.commit().await?;

        metrics::task_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        row.try_into_task()
    }

    async fn cancel_work(&self, id: WorkId) -> Result<Work> {
        let row: Option<WorkRow> = sqlx::query_as(&format!(
            "UPDATE works SET status = 'cancelled', updated_at = now()
             WHERE id = $1 RETURNING {WORK_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("work {id}")))?
            .try_into_work()
    }

    async fn delete_work(&self, id: WorkId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM works WHERE id = $1")
            .bind(id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::NotFound(format!("work {id}")));
        }
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkRow {
    id: Uuid,
    filename: String,
    storage_path: String,
    status: String,
    max_tasks: Option<i32>,
    output_path: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkRow {
    fn try_into_work(self) -> Result<Work> {
        Ok(Work {
            id: WorkId(self.id),
            filename: self.filename,
            storage_path: self.storage_path,
            status: self.status.parse()?,
            max_tasks: self.max_tasks.map(|n| n.max(0) as u32),
            output_path: self.output_path,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    work_id: Uuid,
    payload: serde_json::Value,
    status: String,
    result_path: Option<String>,
    attempts: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            work_id: WorkId(self.work_id),
            payload: self.payload,
            status: self.status.parse()?,
            result_path: self.result_path,
            attempts: self.attempts.max(0) as u32,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
