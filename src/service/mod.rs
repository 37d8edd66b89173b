//! Operations the (external) HTTP layer calls: submit an upload, query
//! status, locate results, cancel a work.

pub mod csv;
pub mod intake;
pub mod query;

pub use intake::{IntakeService, Submission, Upload};
pub use query::{RecordKind, ResultPath, StatusReport, get_result_path, get_status};
