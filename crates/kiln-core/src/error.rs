use thiserror::Error;

use crate::domain::JobStatus;

/// Crate-level error taxonomy.
///
/// Validation and duplicate errors are returned to the submitter
/// synchronously. Execution-time failures never surface here; they are
/// captured as outcomes, converted to result records, and drive the state
/// machine instead.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Ill-formed job at submission. Never persisted.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Ill-formed result at construction.
    #[error("invalid result: {0}")]
    InvalidResult(String),

    /// Attempted state transition not in the table. Indicates a bug.
    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("duplicate job_id={0}")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("unknown pipeline type '{0}'")]
    UnknownPipeline(String),

    #[error("duplicate pipeline type '{0}'")]
    DuplicatePipeline(String),

    /// Payload or work request could not cross the process boundary.
    /// Fatal for the job; no retry.
    #[error("serialization: {0}")]
    Serialization(String),

    /// Backend is no longer accepting work.
    #[error("executor halted")]
    ExecutorHalted,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
