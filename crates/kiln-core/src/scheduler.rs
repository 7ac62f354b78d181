//! Priority-based job scheduling with aging.
//!
//! Ordering is priority-respecting but starvation-free: a queued entry's
//! effective score grows with its wait time, so any job waiting long enough
//! eventually outranks newer fixed-priority work.

use std::cmp::Reverse;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::domain::{Job, JobStatus};
use crate::error::KilnError;

/// Aging policy: one `boost` is added to the base priority per full
/// `interval` of waiting.
#[derive(Debug, Clone)]
pub struct AgingPolicy {
    pub interval: Duration,
    pub boost: i64,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            boost: 1,
        }
    }
}

impl AgingPolicy {
    fn steps(&self, waited: Duration) -> i64 {
        if self.interval.is_zero() {
            return 0;
        }
        (waited.as_nanos() / self.interval.as_nanos()) as i64
    }
}

/// One queued entry. References the job; the single durable copy stays with
/// the engine and the store.
struct SchedEntry {
    job: Arc<Mutex<Job>>,
    job_id: String,
    base_priority: i64,
    enqueued_at: Instant,

    /// Retry backoff gate: the entry is not eligible before this instant.
    not_before: Option<Instant>,

    /// FIFO tiebreak for equal scores; allocated under the scheduler lock.
    seq: u64,
}

impl SchedEntry {
    fn effective_score(&self, now: Instant, aging: &AgingPolicy) -> i64 {
        let waited = now.saturating_duration_since(self.enqueued_at);
        self.base_priority
            .saturating_add(aging.steps(waited).saturating_mul(aging.boost))
    }

    fn eligible(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

struct SchedState {
    entries: Vec<SchedEntry>,
    next_seq: u64,
}

/// Thread-safe scheduler. A single mutex guards all state; `submit` and
/// `next_job` are atomic with respect to each other.
pub struct Scheduler {
    state: Mutex<SchedState>,
    aging: AgingPolicy,
}

impl Scheduler {
    pub fn new(aging: AgingPolicy) -> Self {
        Self {
            state: Mutex::new(SchedState {
                entries: Vec::new(),
                next_seq: 0,
            }),
            aging,
        }
    }

    /// Queue a PENDING job.
    pub fn submit(&self, job: Arc<Mutex<Job>>) -> Result<(), KilnError> {
        self.submit_inner(job, None)
    }

    /// Re-queue a RETRYING job; it becomes eligible only after `delay`.
    pub fn submit_after(&self, job: Arc<Mutex<Job>>, delay: Duration) -> Result<(), KilnError> {
        self.submit_inner(job, Some(Instant::now() + delay))
    }

    fn submit_inner(
        &self,
        job: Arc<Mutex<Job>>,
        not_before: Option<Instant>,
    ) -> Result<(), KilnError> {
        let (job_id, base_priority) = {
            let job = job.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
                return Err(KilnError::InvalidJob(format!(
                    "only PENDING or RETRYING jobs can be scheduled (job {} is {})",
                    job.job_id, job.status
                )));
            }
            (job.job_id.clone(), job.priority)
        };

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(SchedEntry {
            job,
            job_id,
            base_priority,
            enqueued_at: Instant::now(),
            not_before,
            seq,
        });
        Ok(())
    }

    /// Remove and return the highest-ranked eligible job, or `None` if the
    /// queue holds nothing runnable right now. Never blocks.
    ///
    /// Scores are recomputed for every resident entry under the lock, so the
    /// aging policy is exact. Entries whose job was cancelled while queued
    /// are discarded here rather than delivered.
    pub fn next_job(&self) -> Option<Arc<Mutex<Job>>> {
        let mut state = self.lock();
        let now = Instant::now();
        loop {
            let best = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.eligible(now))
                .max_by_key(|(_, e)| (e.effective_score(now, &self.aging), Reverse(e.seq)))
                .map(|(i, _)| i)?;
            let entry = state.entries.swap_remove(best);

            let status = entry
                .job
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .status;
            if status == JobStatus::Cancelled {
                continue;
            }
            return Some(entry.job);
        }
    }

    /// Observe the top eligible entry without removing it:
    /// `(job_id, effective score)`.
    pub fn peek(&self) -> Option<(String, i64)> {
        let state = self.lock();
        let now = Instant::now();
        state
            .entries
            .iter()
            .filter(|e| e.eligible(now))
            .max_by_key(|e| (e.effective_score(now, &self.aging), Reverse(e.seq)))
            .map(|e| (e.job_id.clone(), e.effective_score(now, &self.aging)))
    }

    /// Queued entry count, backoff-gated entries included.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(AgingPolicy::default())
    }
}
