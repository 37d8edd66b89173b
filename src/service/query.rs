//! Read-only queries behind the status page and the download endpoint.

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{TaskId, TaskStatus, WorkId, WorkStatus};
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Work,
    Task,
}

/// Latest persisted state of a work or task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub kind: RecordKind,
    pub id: Uuid,
    pub status: String,
    /// Present when the record is failed.
    pub error: Option<String>,
    /// Present when the record is completed.
    pub result_location: Option<String>,
}

/// Where a task's result stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPath {
    Ready(String),
    /// Completed, but the recorded file is no longer on disk.
    Missing(String),
    /// Known task, not completed yet (or failed).
    NotReady(TaskStatus),
    NotFound,
}

/// Status of a work or task id. `None` when the id is unknown.
pub async fn get_status(store: &dyn JobStore, id: Uuid) -> Result<Option<StatusReport>> {
    if let Some(work) = store.get_work(WorkId(id)).await? {
        return Ok(Some(StatusReport {
            kind: RecordKind::Work,
            id,
            status: work.status.to_string(),
            error: work.error.filter(|_| work.status == WorkStatus::Failed),
            result_location: work
                .output_path
                .filter(|_| work.status == WorkStatus::Completed),
        }));
    }

    Ok(store.get_task(TaskId(id)).await?.map(|task| StatusReport {
        kind: RecordKind::Task,
        id,
        status: task.status.to_string(),
        error: task.error.filter(|_| task.status == TaskStatus::Failed),
        result_location: task
            .result_path
            .filter(|_| task.status == TaskStatus::Completed),
    }))
}

/// The stored result location, only once the task has completed and the
/// file is still there to download.
pub async fn get_result_path(store: &dyn JobStore, task_id: TaskId) -> Result<ResultPath> {
    Ok(match store.get_task(task_id).await? {
        None => ResultPath::NotFound,
        Some(task) => match (task.status, task.result_path) {
            (TaskStatus::Completed, Some(path)) => {
                if tokio::fs::try_exists(&path).await? {
                    ResultPath::Ready(path)
                } else {
                    ResultPath::Missing(path)
                }
            }
            (status, _) => ResultPath::NotReady(status),
        },
    })
}
