//! Terminal result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// Terminal status of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// The terminal record of a job's execution. Immutable once written: the
/// store rejects a second result for the same job.
///
/// Exactly one of `output` / `error` is populated, matching the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: ResultStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
}

impl JobResult {
    /// A successful result carrying the pipeline's final output.
    pub fn completed(
        job_id: impl Into<String>,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Self, KilnError> {
        let result = Self {
            job_id: job_id.into(),
            status: ResultStatus::Completed,
            output: Some(output),
            error: None,
            started_at,
            ended_at,
            duration_secs: duration_secs(started_at, ended_at),
        };
        result.validate()?;
        Ok(result)
    }

    /// A failed result carrying the final attempt's error text.
    pub fn failed(
        job_id: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Self, KilnError> {
        let result = Self {
            job_id: job_id.into(),
            status: ResultStatus::Failed,
            output: None,
            error: Some(error.into()),
            started_at,
            ended_at,
            duration_secs: duration_secs(started_at, ended_at),
        };
        result.validate()?;
        Ok(result)
    }

    /// Invariants, also re-checked when records come back from storage.
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.job_id.is_empty() {
            return Err(KilnError::InvalidResult("job_id must be non-empty".into()));
        }
        if self.ended_at < self.started_at {
            return Err(KilnError::InvalidResult(
                "ended_at must not precede started_at".into(),
            ));
        }
        match self.status {
            ResultStatus::Completed => {
                if self.output.as_ref().map_or(true, serde_json::Value::is_null) {
                    return Err(KilnError::InvalidResult(
                        "COMPLETED results must carry a non-empty output".into(),
                    ));
                }
                if self.error.is_some() {
                    return Err(KilnError::InvalidResult(
                        "COMPLETED results must not carry an error".into(),
                    ));
                }
            }
            ResultStatus::Failed => {
                if self.error.as_deref().map_or(true, str::is_empty) {
                    return Err(KilnError::InvalidResult(
                        "FAILED results must carry a non-empty error".into(),
                    ));
                }
                if self.output.is_some() {
                    return Err(KilnError::InvalidResult(
                        "FAILED results must not carry an output".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn duration_secs(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> f64 {
    (ended_at - started_at).num_microseconds().unwrap_or(0).max(0) as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_result_carries_output() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(250);
        let r = JobResult::completed("job-1", json!({"answer": 42}), start, end).unwrap();
        assert_eq!(r.status, ResultStatus::Completed);
        assert!(r.error.is_none());
        assert!((r.duration_secs - 0.25).abs() < 1e-9);
    }

    #[test]
    fn failed_result_carries_error() {
        let start = Utc::now();
        let r = JobResult::failed("job-1", "boom", start, start).unwrap();
        assert_eq!(r.status, ResultStatus::Failed);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert!(r.output.is_none());
    }

    #[test]
    fn ended_before_started_is_rejected() {
        let start = Utc::now();
        let end = start - chrono::Duration::seconds(1);
        let err = JobResult::completed("job-1", json!(1), start, end).unwrap_err();
        assert!(matches!(err, KilnError::InvalidResult(_)));
    }

    #[test]
    fn null_output_is_rejected() {
        let now = Utc::now();
        let err = JobResult::completed("job-1", serde_json::Value::Null, now, now).unwrap_err();
        assert!(matches!(err, KilnError::InvalidResult(_)));
    }

    #[test]
    fn empty_error_is_rejected() {
        let now = Utc::now();
        let err = JobResult::failed("job-1", "", now, now).unwrap_err();
        assert!(matches!(err, KilnError::InvalidResult(_)));
    }

    #[test]
    fn serde_roundtrip_preserves_record() {
        let now = Utc::now();
        let r = JobResult::failed("job-1", "boom", now, now).unwrap();
        let s = serde_json::to_string(&r).unwrap();
        let back: JobResult = serde_json::from_str(&s).unwrap();
        back.validate().unwrap();
        assert_eq!(back.job_id, r.job_id);
        assert_eq!(back.status, ResultStatus::Failed);
        assert_eq!(back.error, r.error);
    }
}
