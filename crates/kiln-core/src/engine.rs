//! The engine: submission intake, main loop, state transitions, persistence,
//! retries, and shutdown orchestration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::domain::{ExecOutcome, FailureKind, Job, JobResult, JobStatus};
use crate::error::KilnError;
use crate::exec::{Completion, ExecTask, ExecutorRouter};
use crate::metrics::MetricsRegistry;
use crate::pipeline::PipelineRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownCoordinator;
use crate::store::StateStore;

/// Orchestrates the job lifecycle end to end.
///
/// Cheaply cloneable; submissions may come from any thread while the loop
/// runs elsewhere. Within one job, every transition and its persistence
/// happen under that job's own lock, so they are totally ordered.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    jobs: Mutex<HashMap<String, Arc<Mutex<Job>>>>,
    scheduler: Scheduler,
    registry: Arc<PipelineRegistry>,
    store: Arc<dyn StateStore>,
    metrics: Arc<MetricsRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    router: ExecutorRouter,
    retry_policy: RetryPolicy,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<PipelineRegistry>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, KilnError> {
        let router = ExecutorRouter::new(&config)?;
        let scheduler = Scheduler::new(config.aging_policy());
        let retry_policy = config.retry_policy();
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                jobs: Mutex::new(HashMap::new()),
                scheduler,
                registry,
                store,
                metrics: Arc::new(MetricsRegistry::new()),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                router,
                retry_policy,
            }),
        })
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.inner.shutdown)
    }

    /// Broadcast the shutdown signal. The loop observes it at the top of its
    /// next iteration; already-dispatched jobs finish.
    pub fn initiate_shutdown(&self) {
        if self.inner.shutdown.trigger() {
            tracing::info!("shutdown initiated");
        }
    }

    /// Accept a CREATED job: validate, move to PENDING, persist, schedule.
    ///
    /// Duplicate identifiers are rejected before any side effect, checked
    /// against both the live jobs and the store.
    pub fn submit(&self, job: Job) -> Result<(), KilnError> {
        job.validate()?;
        if job.status != JobStatus::Created {
            return Err(KilnError::InvalidJob(format!(
                "only CREATED jobs can be submitted (job {} is {})",
                job.job_id, job.status
            )));
        }

        // The map lock is held across the duplicate check and the insert so
        // concurrent submits of the same id cannot both pass.
        let mut jobs = self.inner.lock_jobs();
        if jobs.contains_key(&job.job_id) {
            return Err(KilnError::DuplicateJob(job.job_id));
        }
        if self.inner.store.load_job(&job.job_id)?.is_some() {
            return Err(KilnError::DuplicateJob(job.job_id));
        }

        let mut job = job;
        job.transition_to(JobStatus::Pending)?;
        self.inner.store.save_job(&job)?;

        let job_id = job.job_id.clone();
        let shared = Arc::new(Mutex::new(job));
        jobs.insert(job_id.clone(), Arc::clone(&shared));
        drop(jobs);

        self.inner.scheduler.submit(shared)?;
        self.inner.metrics.inc("job.submitted");
        tracing::debug!(job_id = %job_id, "job submitted");
        Ok(())
    }

    /// Cancel a job. PENDING jobs become CANCELLED immediately (the queued
    /// entry is discarded lazily); RUNNING and RETRYING jobs get a
    /// best-effort intent marker and resolve at the next safe point.
    pub fn cancel(&self, job_id: &str) -> Result<(), KilnError> {
        let shared = self
            .inner
            .lock_jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))?;

        let mut job = lock_job(&shared);
        match job.status {
            JobStatus::Pending => {
                job.transition_to(JobStatus::Cancelled)?;
                self.inner.store.save_job(&job)?;
                self.inner.metrics.inc("job.cancelled");
                tracing::info!(job_id = %job.job_id, "job cancelled while pending");
            }
            JobStatus::Running | JobStatus::Retrying => {
                job.request_cancel();
                self.inner.store.save_job(&job)?;
                tracing::info!(job_id = %job.job_id, "cancellation requested");
            }
            status => {
                return Err(KilnError::IllegalTransition {
                    from: status,
                    to: JobStatus::Cancelled,
                });
            }
        }
        Ok(())
    }

    /// Re-schedule PENDING jobs found in the store. Opt-in recovery for the
    /// surrounding environment; RUNNING jobs found at startup are left as
    /// they are. Returns how many jobs were scheduled.
    pub fn resume_pending(&self) -> Result<usize, KilnError> {
        let mut resumed = 0;
        for job in self.inner.store.list_jobs()? {
            if job.status != JobStatus::Pending {
                continue;
            }
            let job_id = job.job_id.clone();
            let shared = {
                let mut jobs = self.inner.lock_jobs();
                if jobs.contains_key(&job_id) {
                    continue;
                }
                let shared = Arc::new(Mutex::new(job));
                jobs.insert(job_id, Arc::clone(&shared));
                shared
            };
            self.inner.scheduler.submit(shared)?;
            resumed += 1;
        }
        if resumed > 0 {
            tracing::info!(count = resumed, "re-scheduled pending jobs from the store");
        }
        Ok(resumed)
    }

    /// Current record for a job: live copy if the engine owns one, stored
    /// copy otherwise.
    pub fn job(&self, job_id: &str) -> Result<Option<Job>, KilnError> {
        if let Some(shared) = self.inner.lock_jobs().get(job_id) {
            return Ok(Some(lock_job(shared).clone()));
        }
        Ok(self.inner.store.load_job(job_id)?)
    }

    pub fn result(&self, job_id: &str) -> Result<Option<JobResult>, KilnError> {
        Ok(self.inner.store.load_result(job_id)?)
    }

    /// Queued job count (backoff-gated entries included).
    pub fn queued(&self) -> usize {
        self.inner.scheduler.size()
    }

    /// Main loop. Polls the scheduler until the shutdown signal is observed,
    /// then drains the backends, runs registered cleanups in reverse order,
    /// and flushes a final metrics snapshot.
    pub fn run_loop(&self) {
        tracing::info!("engine loop started");
        while !self.inner.shutdown.is_triggered() {
            match self.inner.scheduler.next_job() {
                Some(job) => self.process_one(job),
                None => thread::sleep(self.inner.config.poll_interval()),
            }
        }

        tracing::info!("shutdown observed; draining backends");
        self.inner.router.shutdown_all(true);
        self.inner.shutdown.unwind();
        self.flush_metrics();
        tracing::info!("engine loop stopped");
    }

    /// Transition one scheduled job to RUNNING, persist, and dispatch it.
    fn process_one(&self, shared: Arc<Mutex<Job>>) {
        let snapshot = {
            let mut job = lock_job(&shared);

            if let Err(e) = job.transition_to(JobStatus::Running) {
                tracing::error!(job_id = %job.job_id, error = %e, "scheduler delivered an undispatchable job");
                return;
            }

            // Cancellation intent recorded while queued (RETRYING) resolves
            // here, without executing.
            if job.cancel_requested {
                self.inner.finish_cancelled(&mut job);
                return;
            }

            if let Err(e) = self.inner.store.save_job(&job) {
                tracing::error!(job_id = %job.job_id, error = %e, "failed to persist RUNNING transition");
            }

            (
                job.job_id.clone(),
                job.execution_mode,
                job.payload.clone(),
                job.pipeline_type().map(str::to_string),
            )
        };
        let (job_id, mode, payload, pipeline_type) = snapshot;
        let started_at = Utc::now();

        let pipeline_type = match pipeline_type {
            Ok(t) => t,
            Err(e) => {
                self.inner
                    .finalize(&shared, started_at, ExecOutcome::fatal(e.to_string()));
                return;
            }
        };

        let factory = match self.inner.registry.get(&pipeline_type) {
            Some(factory) => factory,
            None => {
                self.inner.finalize(
                    &shared,
                    started_at,
                    ExecOutcome::fatal(format!("unknown pipeline type '{pipeline_type}'")),
                );
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        let for_finalize = Arc::clone(&shared);
        let completion = Completion::new(move |outcome| {
            inner.finalize(&for_finalize, started_at, outcome);
        });

        tracing::debug!(job_id = %job_id, mode = %mode, "dispatching");
        self.inner.router.dispatch(
            mode,
            ExecTask {
                job_id,
                pipeline_type,
                payload,
                pipeline: factory.build(),
                timeout: self.inner.config.job_timeout(),
                metrics: Arc::clone(&self.inner.metrics),
                complete: completion,
            },
        );
    }

    fn flush_metrics(&self) {
        tracing::info!(
            counters = ?self.inner.metrics.counters(),
            timings = ?self.inner.metrics.timings(),
            "final metrics"
        );
    }
}

impl EngineInner {
    /// Turn a backend outcome into the job's next state, persisting the
    /// result record before the terminal job transition is committed.
    /// Runs on whichever thread completed the work.
    fn finalize(
        &self,
        shared: &Arc<Mutex<Job>>,
        started_at: DateTime<Utc>,
        outcome: ExecOutcome,
    ) {
        let ended_at = Utc::now();
        if let Ok(elapsed) = (ended_at - started_at).to_std() {
            self.metrics.record_timing("job.execution", elapsed);
        }

        let resubmit = {
            let mut job = lock_job(shared);

            // Best-effort cancellation: the outcome is discarded.
            if job.cancel_requested {
                self.finish_cancelled(&mut job);
                return;
            }

            match outcome {
                ExecOutcome::Success { output } => {
                    self.finish_success(&mut job, output, started_at, ended_at);
                    None
                }
                ExecOutcome::Failure { kind, message } => {
                    self.finish_failure(&mut job, kind, message, started_at, ended_at)
                }
            }
        };

        // The scheduler takes the job lock itself, so re-submission happens
        // after the guard above is released.
        if let Some(delay) = resubmit {
            if let Err(e) = self.scheduler.submit_after(Arc::clone(shared), delay) {
                tracing::error!(error = %e, "failed to re-schedule retrying job");
            }
        }
    }

    fn finish_success(
        &self,
        job: &mut Job,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) {
        let result = match JobResult::completed(job.job_id.clone(), output, started_at, ended_at) {
            Ok(result) => result,
            Err(e) => {
                // e.g. a pipeline that "succeeded" with a null output
                self.finish_failure(
                    job,
                    FailureKind::Fatal,
                    e.to_string(),
                    started_at,
                    ended_at,
                );
                return;
            }
        };

        self.persist_result(&result);
        if let Err(e) = job.transition_to(JobStatus::Completed) {
            tracing::error!(job_id = %job.job_id, error = %e, "completion transition failed");
            return;
        }
        self.persist_job(job);
        self.metrics.inc("job.success");
        tracing::info!(job_id = %job.job_id, "job completed");
    }

    /// Returns the backoff delay when the job should be re-queued.
    fn finish_failure(
        &self,
        job: &mut Job,
        kind: FailureKind,
        message: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Option<std::time::Duration> {
        let message = if message.is_empty() {
            "execution failed".to_string()
        } else {
            message
        };
        let fatal = kind == FailureKind::Fatal;

        match job.record_failure(message.as_str(), fatal) {
            Ok(JobStatus::Failed) => {
                match JobResult::failed(job.job_id.clone(), message.as_str(), started_at, ended_at)
                {
                    Ok(result) => self.persist_result(&result),
                    Err(e) => {
                        tracing::error!(job_id = %job.job_id, error = %e, "could not build failure result")
                    }
                }
                self.persist_job(job);
                self.metrics.inc("job.failure");
                tracing::warn!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    error = %message,
                    "job failed terminally"
                );
                None
            }
            Ok(JobStatus::Retrying) => {
                self.persist_job(job);
                self.metrics.inc("job.retries");
                let delay = self.retry_policy.next_delay(job.attempts);
                tracing::info!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient failure; retry scheduled"
                );
                Some(delay)
            }
            Ok(_) | Err(_) => {
                tracing::error!(job_id = %job.job_id, "failure accounting hit an illegal transition");
                None
            }
        }
    }

    fn finish_cancelled(&self, job: &mut Job) {
        match job.transition_to(JobStatus::Cancelled) {
            Ok(()) => {
                // Cancellation produces no result record.
                self.persist_job(job);
                self.metrics.inc("job.cancelled");
                tracing::info!(job_id = %job.job_id, "job cancelled");
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "cancellation transition failed")
            }
        }
    }

    fn persist_job(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job) {
            tracing::error!(job_id = %job.job_id, error = %e, "failed to persist job");
        }
    }

    fn persist_result(&self, result: &JobResult) {
        if let Err(e) = self.store.save_result(result) {
            // Write-once violations leave the stored record untouched.
            tracing::error!(job_id = %result.job_id, error = %e, "failed to persist result");
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<Job>>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_job(shared: &Arc<Mutex<Job>>) -> MutexGuard<'_, Job> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
