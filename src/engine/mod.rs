//! Admission and execution: the worker loop, per-delivery attempt handling,
//! and the job body seam.

pub mod job;
pub mod worker;

pub use job::{CommandJobBody, JobBody};
pub use worker::{AttemptOutcome, Worker, WorkerConfig};
