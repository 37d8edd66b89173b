//! Error types for scrapeq.
//!
//! The variants mirror how the worker reacts: `AdmissionDenied` and
//! `StoreUnavailable`/`Contention` are transient and end in a redelivery,
//! `Validation` and `JobBody` fail the attempt and count against it,
//! `NotFound` is dropped.

use thiserror::Error;

use crate::model::WorkId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no admission token available")]
    AdmissionDenied,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job body failed: {0}")]
    JobBody(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("token counter contention: gave up after {0} compare-and-swap attempts")]
    Contention(u32),

    #[error("work {work_id} accepts at most {max} tasks")]
    MaxTasksExceeded { work_id: WorkId, max: u32 },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient infrastructure conditions that a redelivery may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::AdmissionDenied | Error::StoreUnavailable(_) | Error::Contention(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Other(format!("migration failed: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
