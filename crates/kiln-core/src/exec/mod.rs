//! Execution backends and the router that selects among them.

mod async_runner;
mod process_pool;
mod thread_pool;

pub use async_runner::{AsyncTaskRunner, TaskFuture};
pub use process_pool::{
    process_worker_requested, run_process_worker, ProcessPoolConfig, ProcessWorkRequest,
    ProcessWorkResponse, ProcessWorkerPool, PROCESS_WORKER_ENV,
};
pub use thread_pool::{ThreadWorkerPool, Work};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::domain::{ExecOutcome, ExecutionMode};
use crate::error::KilnError;
use crate::metrics::MetricsRegistry;
use crate::pipeline::Pipeline;

/// Delivers the outcome for one dispatched job. First caller wins; later
/// calls are no-ops, so every dispatch path can guarantee exactly one
/// outcome without coordinating.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Mutex<Option<Box<dyn FnOnce(ExecOutcome) + Send>>>>,
}

impl Completion {
    pub fn new<F>(finalize: F) -> Self
    where
        F: FnOnce(ExecOutcome) + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(finalize)))),
        }
    }

    pub fn complete(&self, outcome: ExecOutcome) {
        let finalize = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(finalize) = finalize {
            finalize(outcome);
        }
    }
}

/// Everything a backend needs to run one job's pipeline and report back.
pub struct ExecTask {
    pub job_id: String,
    pub pipeline_type: String,
    pub payload: serde_json::Value,
    pub pipeline: Pipeline,

    /// Per-attempt execution budget; exceeding it is a transient failure.
    pub timeout: Option<Duration>,

    pub metrics: Arc<MetricsRegistry>,
    pub complete: Completion,
}

/// Stateless dispatcher mapping a job's execution mode to a backend.
///
/// Whatever path a dispatch takes (backend execution, serialization
/// rejection, halted pool), exactly one outcome reaches `task.complete`.
pub struct ExecutorRouter {
    thread_pool: ThreadWorkerPool,
    process_pool: ProcessWorkerPool,
    async_runner: AsyncTaskRunner,
}

impl ExecutorRouter {
    pub fn new(config: &EngineConfig) -> Result<Self, KilnError> {
        Ok(Self {
            thread_pool: ThreadWorkerPool::new(
                config.thread_workers,
                config.thread_queue_capacity,
            )?,
            process_pool: ProcessWorkerPool::new(ProcessPoolConfig {
                workers: config.process_workers,
                queue_capacity: config.process_queue_capacity,
                worker_command: config.process_worker_command.clone(),
                response_timeout: config.job_timeout(),
            })?,
            async_runner: AsyncTaskRunner::new(config.async_queue_capacity)?,
        })
    }

    pub fn dispatch(&self, mode: ExecutionMode, task: ExecTask) {
        match mode {
            ExecutionMode::Thread => self.dispatch_thread(task),
            ExecutionMode::Process => self.dispatch_process(task),
            ExecutionMode::Async => self.dispatch_async(task),
        }
    }

    fn dispatch_thread(&self, task: ExecTask) {
        let ExecTask {
            pipeline,
            payload,
            timeout,
            metrics,
            complete,
            ..
        } = task;

        let completion = complete.clone();
        let work: Work = Box::new(move || {
            let deadline = timeout.map(|t| Instant::now() + t);
            let outcome = {
                let _timer = metrics.timer("pipeline.run");
                outcome_from(pipeline.run(payload, deadline))
            };
            complete.complete(outcome);
        });

        if self.thread_pool.submit(work).is_err() {
            completion.complete(ExecOutcome::transient("thread pool halted"));
        }
    }

    fn dispatch_process(&self, task: ExecTask) {
        let request = ProcessWorkRequest {
            job_id: task.job_id.clone(),
            pipeline_type: task.pipeline_type.clone(),
            payload: task.payload,
        };
        // The serialization check happens before any submit side effect;
        // a payload that cannot cross the boundary is fatal, not retried.
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                task.complete
                    .complete(ExecOutcome::fatal(format!("payload not serializable: {e}")));
                return;
            }
        };

        let completion = task.complete.clone();
        if self
            .process_pool
            .submit(line, task.complete, task.metrics)
            .is_err()
        {
            completion.complete(ExecOutcome::transient("process pool halted"));
        }
    }

    fn dispatch_async(&self, task: ExecTask) {
        let ExecTask {
            pipeline,
            payload,
            timeout,
            metrics,
            complete,
            ..
        } = task;

        let completion = complete.clone();
        let future: TaskFuture = Box::pin(async move {
            let outcome = {
                let _timer = metrics.timer("pipeline.run");
                let run = pipeline.run_cooperative(payload, None);
                match timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, run).await {
                        Ok(result) => outcome_from(result),
                        Err(_) => ExecOutcome::transient("timeout"),
                    },
                    None => outcome_from(run.await),
                }
            };
            complete.complete(outcome);
        });

        if self.async_runner.submit(future).is_err() {
            completion.complete(ExecOutcome::transient("async runner halted"));
        }
    }

    /// Close every backend; with `drain=true` queued work finishes first.
    pub fn shutdown_all(&self, drain: bool) {
        self.thread_pool.shutdown(drain);
        self.process_pool.shutdown(drain);
        self.async_runner.shutdown(drain);
    }

    pub fn is_halted(&self) -> bool {
        self.thread_pool.is_halted()
            && self.process_pool.is_halted()
            && self.async_runner.is_halted()
    }
}

fn outcome_from(result: Result<serde_json::Value, crate::pipeline::PipelineError>) -> ExecOutcome {
    match result {
        Ok(output) => ExecOutcome::success(output),
        Err(e) => e.into(),
    }
}
