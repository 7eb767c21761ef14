//! Upload job model, resume-tail slicing, and progress tracking.

mod job;
mod progress;
mod tail;
mod validation;

pub use job::{CompletedJob, Job, JobPhase, JobSnapshot};
pub use progress::SpeedCalculator;
pub use tail::{tail_len, write_resume_tail};
pub use validation::{detect_content_type, validate_source};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source file does not exist: {0}")]
    SourceMissing(String),

    #[error("source is not a local file: {0}")]
    NotLocal(String),

    #[error("job {0} has no credential")]
    NoCredential(String),

    #[error("invalid job record: {0}")]
    InvalidRecord(String),

    #[error("resume offset {resume_from} is beyond the payload size {total}")]
    ResumeBeyondEnd { resume_from: u64, total: u64 },
}
