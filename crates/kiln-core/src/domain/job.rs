//! Job record and status management.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KilnError;

use super::mode::ExecutionMode;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Constructed but not yet submitted.
    Created,

    /// Accepted and queued in the scheduler.
    Pending,

    /// Dispatched to an execution backend.
    Running,

    /// Transient failure recorded; awaiting re-queue.
    Retrying,

    /// Terminal success.
    Completed,

    /// Terminal failure.
    Failed,

    /// Terminal, externally requested.
    Cancelled,
}

impl JobStatus {
    /// Statuses reachable from this one.
    ///
    /// `Running -> Cancelled` exists for the best-effort cancellation path:
    /// the engine takes it only when cancellation intent was recorded while
    /// the job executed, discarding the execution's outcome.
    pub fn allowed_transitions(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Created => &[JobStatus::Pending, JobStatus::Cancelled],
            JobStatus::Pending => &[JobStatus::Running, JobStatus::Cancelled],
            JobStatus::Running => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Retrying,
                JobStatus::Cancelled,
            ],
            JobStatus::Retrying => &[JobStatus::Running, JobStatus::Failed],
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Created => "CREATED",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A unit of work: identity, scheduling attributes, payload, and lifecycle
/// fields.
///
/// Fields are public for inspection; all mutation goes through methods so the
/// transition table and failure accounting stay enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub priority: i64,
    pub execution_mode: ExecutionMode,

    /// Opaque structured payload; must be a JSON object carrying a string
    /// `type` that names a registered pipeline.
    pub payload: serde_json::Value,

    /// Total execution attempts this job may consume, first try included.
    pub max_retries: u32,

    /// Attempts consumed so far. Never decreases.
    pub attempts: u32,

    pub status: JobStatus,
    pub last_error: Option<String>,

    /// Best-effort cancellation intent for RUNNING / RETRYING jobs.
    #[serde(default)]
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a validated job in the CREATED state.
    pub fn new(
        job_id: impl Into<String>,
        priority: i64,
        execution_mode: ExecutionMode,
        payload: serde_json::Value,
        max_retries: u32,
    ) -> Result<Self, KilnError> {
        let now = Utc::now();
        let job = Self {
            job_id: job_id.into(),
            priority,
            execution_mode,
            payload,
            max_retries,
            attempts: 0,
            status: JobStatus::Created,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        };
        job.validate()?;
        Ok(job)
    }

    /// Field-level invariants. Also applied to records coming back from
    /// storage (the store is a trust boundary).
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.job_id.is_empty() {
            return Err(KilnError::InvalidJob("job_id must be non-empty".into()));
        }
        if self.max_retries == 0 {
            return Err(KilnError::InvalidJob("max_retries must be >= 1".into()));
        }
        if self.attempts > self.max_retries {
            return Err(KilnError::InvalidJob(format!(
                "attempts ({}) exceeds max_retries ({})",
                self.attempts, self.max_retries
            )));
        }
        if self.updated_at < self.created_at {
            return Err(KilnError::InvalidJob(
                "updated_at must not precede created_at".into(),
            ));
        }
        self.pipeline_type()?;
        Ok(())
    }

    /// The registered pipeline named by the payload.
    pub fn pipeline_type(&self) -> Result<&str, KilnError> {
        self.payload
            .get("type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                KilnError::InvalidJob(
                    "payload must be an object carrying a non-empty string 'type'".into(),
                )
            })
    }

    /// Move to `next` if the table allows it.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), KilnError> {
        if !self.status.can_transition_to(next) {
            return Err(KilnError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Record one failed attempt and move to the status it implies.
    ///
    /// The increment happens before the transition is chosen: a job gets
    /// exactly `max_retries` executions in total, and `attempts ==
    /// max_retries` is a reliable signal that no further tries will occur.
    /// Fatal failures go straight to FAILED regardless of remaining budget.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        fatal: bool,
    ) -> Result<JobStatus, KilnError> {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        let next = if fatal || self.attempts >= self.max_retries {
            JobStatus::Failed
        } else {
            JobStatus::Retrying
        };
        self.transition_to(next)?;
        Ok(next)
    }

    /// Mark cancellation intent; the engine resolves it at the next safe
    /// point.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.touch();
    }

    /// Advance `updated_at`, strictly. Clock ties are broken by nudging
    /// forward so it grows on every transition.
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }
}
