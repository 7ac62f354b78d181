//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::scheduler::AgingPolicy;

/// Tuning knobs for the engine and its backends.
///
/// Durations are integer milliseconds so the struct deserializes cleanly
/// from flat config sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sleep between empty scheduler polls.
    pub poll_interval_ms: u64,

    /// Wait needed for one aging step.
    pub aging_interval_ms: u64,

    /// Score added per aging step.
    pub aging_boost: i64,

    /// First retry delay; multiplied for each subsequent retry.
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,

    pub thread_workers: usize,

    /// Thread backend queue bound; submit blocks while it is full.
    pub thread_queue_capacity: usize,

    pub process_workers: usize,
    pub process_queue_capacity: usize,

    /// Command used to start process workers. Defaults to re-running the
    /// current executable in worker mode.
    pub process_worker_command: Option<PathBuf>,

    pub async_queue_capacity: usize,

    /// Upper bound for one execution attempt; exceeding it is a transient
    /// "timeout" failure.
    pub job_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            aging_interval_ms: 1_000,
            aging_boost: 1,
            retry_base_delay_ms: 2_000,
            retry_multiplier: 2.0,
            thread_workers: 4,
            thread_queue_capacity: 4,
            process_workers: 2,
            process_queue_capacity: 2,
            process_worker_command: None,
            async_queue_capacity: 64,
            job_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn aging_policy(&self) -> AgingPolicy {
        AgingPolicy {
            interval: Duration::from_millis(self.aging_interval_ms),
            boost: self.aging_boost,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policies() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.aging_policy().interval, Duration::from_secs(1));
        assert_eq!(config.aging_policy().boost, 1);
        assert_eq!(config.retry_policy().base_delay, Duration::from_secs(2));
        assert!(config.job_timeout().is_none());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 10, "thread_workers": 8}"#).unwrap();
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.thread_workers, 8);
        assert_eq!(config.aging_boost, 1);
    }
}
