//! Execution outcomes: what a backend reports for one dispatched job.

use serde::{Deserialize, Serialize};

/// Failure classification, decided before the state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Eligible for retry while attempts remain.
    Transient,

    /// Skips the retry budget entirely.
    Fatal,
}

/// The single outcome a backend delivers per dispatched job.
///
/// Serializable because it also crosses the process-worker boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecOutcome {
    Success {
        output: serde_json::Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl ExecOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        ExecOutcome::Success { output }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ExecOutcome::Failure {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ExecOutcome::Failure {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success { .. })
    }
}
