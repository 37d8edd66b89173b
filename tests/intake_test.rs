//! Intake and query surface over in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use scrapeq::engine::{JobBody, Worker, WorkerConfig};
use scrapeq::error::Error;
use scrapeq::model::{TaskId, TaskStatus, WorkStatus};
use scrapeq::queue::InMemoryJobQueue;
use scrapeq::service::{IntakeService, RecordKind, ResultPath, Upload, get_result_path, get_status};
use scrapeq::store::{InMemoryJobStore, JobStore};
use scrapeq::tokens::{InMemoryTokenStore, TokenPool};
use serde_json::Value;

const IDS_CSV: &[u8] = b"id,name\n1,alpha\n2,beta\n";

struct Harness {
    _dir: tempfile::TempDir,
    upload_dir: std::path::PathBuf,
    store: Arc<InMemoryJobStore>,
    queue: Arc<InMemoryJobQueue>,
    intake: IntakeService,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().join("uploads");
    let store = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let intake = IntakeService::new(store.clone(), queue.clone(), &upload_dir);
    Harness {
        _dir: dir,
        upload_dir,
        store,
        queue,
        intake,
    }
}

fn uploads_left(h: &Harness) -> usize {
    std::fs::read_dir(&h.upload_dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn submit_stores_file_and_enqueues_task() {
    let h = harness();
    let submission = h.intake.submit(Upload::new("ids.csv", IDS_CSV)).await.unwrap();

    let work = h.store.get_work(submission.work_id).await.unwrap().unwrap();
    assert_eq!(work.status, WorkStatus::Pending);
    assert_eq!(work.filename, "ids.csv");
    assert_eq!(std::fs::read(&work.storage_path).unwrap(), IDS_CSV);
    assert!(work.storage_path.contains(&submission.work_id.to_string()));

    let task = h.store.get_task(submission.task_id).await.unwrap().unwrap();
    assert_eq!(task.work_id, submission.work_id);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.payload["csv_path"].as_str(), Some(work.storage_path.as_str()));

    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn latin1_upload_is_accepted() {
    let h = harness();
    let bytes = b"id;name\n1;caf\xe9\n2;na\xefve\n".to_vec();
    let submission = h.intake.submit(Upload::new("ids.csv", bytes)).await.unwrap();
    assert!(h.store.get_work(submission.work_id).await.unwrap().is_some());
}

#[tokio::test]
async fn non_csv_upload_is_rejected_before_storage() {
    let h = harness();
    let result = h.intake.submit(Upload::new("ids.xlsx", IDS_CSV)).await;

    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(h.store.work_count(), 0);
    assert!(h.queue.is_empty());
    assert_eq!(uploads_left(&h), 0);
}

#[tokio::test]
async fn malformed_csv_is_rejected() {
    let h = harness();
    let result = h.intake.submit(Upload::new("ids.csv", &b""[..])).await;

    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(h.store.work_count(), 0);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn zero_task_cap_rejects_and_cleans_up() {
    let h = harness();
    let result = h
        .intake
        .submit(Upload::new("ids.csv", IDS_CSV).max_tasks(0))
        .await;

    assert!(matches!(result, Err(Error::MaxTasksExceeded { max: 0, .. })));
    assert_eq!(h.store.work_count(), 0);
    assert_eq!(h.store.task_count(), 0);
    assert_eq!(uploads_left(&h), 0);
}

#[tokio::test]
async fn enqueue_failure_rolls_back_the_submission() {
    let h = harness();
    h.queue.set_available(false);

    let result = h.intake.submit(Upload::new("ids.csv", IDS_CSV)).await;

    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    assert_eq!(h.store.work_count(), 0);
    assert_eq!(h.store.task_count(), 0);
    assert_eq!(uploads_left(&h), 0);
}

#[tokio::test]
async fn cancel_marks_work_cancelled() {
    let h = harness();
    let submission = h.intake.submit(Upload::new("ids.csv", IDS_CSV)).await.unwrap();

    let work = h.intake.cancel(submission.work_id).await.unwrap();
    assert_eq!(work.status, WorkStatus::Cancelled);

    let report = get_status(h.store.as_ref(), submission.work_id.0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, "cancelled");
}

#[tokio::test]
async fn result_path_becomes_ready_after_completion() {
    let h = harness();
    let submission = h.intake.submit(Upload::new("ids.csv", IDS_CSV)).await.unwrap();

    assert_eq!(
        get_result_path(h.store.as_ref(), submission.task_id).await.unwrap(),
        ResultPath::NotReady(TaskStatus::Pending)
    );
    let report = get_status(h.store.as_ref(), submission.task_id.0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.kind, RecordKind::Task);
    assert_eq!(report.status, "pending");
    assert_eq!(report.result_location, None);

    let token_store = Arc::new(InMemoryTokenStore::new());
    let tokens = TokenPool::new(token_store);
    tokens.initialize(1).await.unwrap();
    let body: Arc<dyn JobBody> = Arc::new(|p: &Value| -> anyhow::Result<String> {
        let input = p["csv_path"].as_str().unwrap_or_default();
        let output = input.replace(".csv", ".results.csv");
        std::fs::write(&output, "id,status\n1,ok\n")?;
        Ok(output)
    });
    let worker = Worker::new(
        h.store.clone(),
        h.queue.clone(),
        tokens,
        body,
        WorkerConfig {
            job_timeout: Duration::from_secs(10),
            ..WorkerConfig::default()
        },
    );
    worker.run_once().await.unwrap().unwrap();

    let work = h.store.get_work(submission.work_id).await.unwrap().unwrap();
    let expected = work.storage_path.replace(".csv", ".results.csv");
    assert_eq!(
        get_result_path(h.store.as_ref(), submission.task_id).await.unwrap(),
        ResultPath::Ready(expected.clone())
    );

    let report = get_status(h.store.as_ref(), submission.work_id.0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.kind, RecordKind::Work);
    assert_eq!(report.status, "completed");
    assert_eq!(report.result_location.as_deref(), Some(expected.as_str()));
    assert_eq!(report.error, None);

    // A result file removed from disk can no longer be served.
    std::fs::remove_file(&expected).unwrap();
    assert_eq!(
        get_result_path(h.store.as_ref(), submission.task_id).await.unwrap(),
        ResultPath::Missing(expected)
    );
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness();
    let unknown = TaskId::new();

    assert_eq!(
        get_result_path(h.store.as_ref(), unknown).await.unwrap(),
        ResultPath::NotFound
    );
    assert!(get_status(h.store.as_ref(), unknown.0).await.unwrap().is_none());
}
