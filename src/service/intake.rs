//! Intake: turn a validated upload into a work, its task, and a queued
//! delivery.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::csv::validate_csv;
use crate::error::{Error, Result};
use crate::model::{NewTask, NewWork, TaskId, Work, WorkId};
use crate::queue::JobQueue;
use crate::store::JobStore;
use crate::telemetry::metrics;

/// An uploaded file as received by the HTTP layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub max_tasks: Option<u32>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
            max_tasks: None,
        }
    }

    pub fn max_tasks(mut self, n: u32) -> Self {
        self.max_tasks = Some(n);
        self
    }
}

/// Ids handed back to the uploader, who then polls asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub work_id: WorkId,
    pub task_id: TaskId,
}

/// Accepts uploads. One task per upload, its payload pointing at the stored
/// file.
#[derive(Clone)]
pub struct IntakeService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    upload_dir: PathBuf,
}

impl IntakeService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            queue,
            upload_dir: upload_dir.into(),
        }
    }

    /// Validate, persist the raw bytes, create the work and its task in one
    /// transaction, then enqueue the task id.
    ///
    /// Enqueueing happens only after the records are committed. If it fails,
    /// the records are removed again so no work is left without a queued task.
    pub async fn submit(&self, upload: Upload) -> Result<Submission> {
        let filename = match checked_filename(&upload.filename) {
            Ok(name) => name,
            Err(e) => {
                metrics::tasks_submitted().add(1, &[KeyValue::new("result", "invalid")]);
                return Err(e);
            }
        };
        if let Err(e) = validate_csv(&upload.bytes) {
            metrics::tasks_submitted().add(1, &[KeyValue::new("result", "invalid")]);
            return Err(e);
        }

        let work_id = WorkId::new();
        let work_dir = self.upload_dir.join(work_id.to_string());
        let storage_path = match store_upload(&work_dir, &filename, &upload.bytes).await {
            Ok(path) => path,
            Err(e) => {
                metrics::tasks_submitted().add(1, &[KeyValue::new("result", "error")]);
                return Err(e);
            }
        };
        let storage_path_str = storage_path.to_string_lossy().into_owned();

        let mut new_work = NewWork::new(&filename, &storage_path_str).id(work_id);
        if let Some(max) = upload.max_tasks {
            new_work = new_work.max_tasks(max);
        }
        let task = NewTask::new(json!({ "csv_path": storage_path_str }));

        let (work, tasks) = match self.store.create_submission(new_work, vec![task]).await {
            Ok(created) => created,
            Err(e) => {
                remove_upload(&work_dir).await;
                metrics::tasks_submitted().add(1, &[KeyValue::new("result", "error")]);
                return Err(e);
            }
        };
        let task_id = tasks
            .first()
            .map(|t| t.id)
            .ok_or_else(|| Error::Other("submission created no task".to_string()))?;

        if let Err(e) = self.queue.enqueue(task_id).await {
            error!(work_id = %work.id, task_id = %task_id, "enqueue failed, rolling back submission: {e}");
            if let Err(cleanup) = self.store.delete_work(work.id).await {
                error!(work_id = %work.id, "rollback failed, work left without a queued task: {cleanup}");
            }
            remove_upload(&work_dir).await;
            metrics::tasks_submitted().add(1, &[KeyValue::new("result", "error")]);
            return Err(e);
        }

        metrics::tasks_submitted().add(1, &[KeyValue::new("result", "ok")]);
        info!(work_id = %work.id, task_id = %task_id, filename = %work.filename, "upload submitted");

        Ok(Submission {
            work_id: work.id,
            task_id,
        })
    }

    /// Administratively cancel a work. Tasks already picked up still finish.
    pub async fn cancel(&self, work_id: WorkId) -> Result<Work> {
        let work = self.store.cancel_work(work_id).await?;
        info!(work_id = %work_id, "work cancelled");
        Ok(work)
    }
}

/// Strip any directory part and insist on a `.csv` extension.
fn checked_filename(raw: &str) -> Result<String> {
    let name = Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Validation("upload has no usable filename".to_string()))?;
    if !name.to_ascii_lowercase().ends_with(".csv") {
        return Err(Error::Validation(format!("{name} is not a .csv file")));
    }
    Ok(name.to_string())
}

/// Write the raw bytes to `<work_dir>/<filename>`. On failure nothing is
/// left under `work_dir`.
async fn store_upload(work_dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = work_dir.join(filename);
    let written = match tokio::fs::create_dir_all(work_dir).await {
        Ok(()) => tokio::fs::write(&path, bytes).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        remove_upload(work_dir).await;
        return Err(e.into());
    }
    Ok(path)
}

async fn remove_upload(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), "could not remove stored upload: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_reduced_to_basename() {
        assert_eq!(checked_filename("../../etc/ids.CSV").unwrap(), "ids.CSV");
        assert_eq!(checked_filename("ids.csv").unwrap(), "ids.csv");
    }

    #[tokio::test]
    async fn failed_write_leaves_no_work_directory() {
        let root = tempfile::tempdir().unwrap();
        let work_dir = root.path().join("work");
        // An empty name resolves to the directory itself, which can't be
        // written as a file.
        let result = store_upload(&work_dir, "", b"id\n1\n").await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn stored_upload_lands_under_work_directory() {
        let root = tempfile::tempdir().unwrap();
        let work_dir = root.path().join("work");
        let path = store_upload(&work_dir, "ids.csv", b"id\n1\n").await.unwrap();
        assert_eq!(path, work_dir.join("ids.csv"));
        assert_eq!(std::fs::read(&path).unwrap(), b"id\n1\n");
    }

    #[test]
    fn non_csv_filenames_are_rejected() {
        assert!(matches!(checked_filename("ids.xlsx"), Err(Error::Validation(_))));
        assert!(matches!(checked_filename(""), Err(Error::Validation(_))));
        assert!(matches!(checked_filename("/"), Err(Error::Validation(_))));
    }
}
