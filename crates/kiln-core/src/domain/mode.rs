use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// Backend selector for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Shared-memory worker pool: I/O-bound or interleaved work.
    Thread,

    /// Isolated worker pool: CPU-bound work; payloads and results cross a
    /// process boundary and must serialize.
    Process,

    /// Cooperative single-thread runner: high fan-out suspending work.
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Thread => "thread",
            ExecutionMode::Process => "process",
            ExecutionMode::Async => "async",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(ExecutionMode::Thread),
            "process" => Ok(ExecutionMode::Process),
            "async" => Ok(ExecutionMode::Async),
            other => Err(KilnError::InvalidJob(format!(
                "execution mode must be one of thread, process, async (got '{other}')"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("thread".parse::<ExecutionMode>().unwrap(), ExecutionMode::Thread);
        assert_eq!("process".parse::<ExecutionMode>().unwrap(), ExecutionMode::Process);
        assert_eq!("async".parse::<ExecutionMode>().unwrap(), ExecutionMode::Async);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = "fiber".parse::<ExecutionMode>().unwrap_err();
        assert!(err.to_string().contains("fiber"));
    }

    #[test]
    fn serializes_lowercase() {
        let s = serde_json::to_string(&ExecutionMode::Async).unwrap();
        assert_eq!(s, "\"async\"");
    }
}
