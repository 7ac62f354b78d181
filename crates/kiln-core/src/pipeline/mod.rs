//! Staged record pipelines.
//!
//! A pipeline is an ordered list of stages; each stage transforms a lazy
//! stream of records into another lazy stream. Execution is demand-driven:
//! the runner pulls from the final stage and the pull propagates backwards,
//! so memory stays bounded by one in-flight record per stage plus whatever a
//! stage explicitly buffers. The last record the final stage emits is the
//! pipeline's output.

mod registry;

pub use registry::{PipelineFactory, PipelineRegistry};

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::domain::ExecOutcome;

/// One record flowing through a pipeline.
pub type Record = serde_json::Value;

/// A lazy stream of records; stages consume and produce these.
pub type RecordStream = Box<dyn Iterator<Item = Result<Record, PipelineError>> + Send>;

/// A stage: lazy stream in, lazy stream out.
pub type StageFn = Arc<dyn Fn(RecordStream) -> RecordStream + Send + Sync>;

/// Structured pipeline failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A stage reported a failure; `fatal` bypasses the retry budget.
    #[error("{message}")]
    Stage { message: String, fatal: bool },

    /// The execution deadline passed while records were still flowing.
    #[error("timeout")]
    Timeout,

    #[error("pipeline produced no output")]
    EmptyOutput,
}

impl PipelineError {
    /// A transient stage failure.
    pub fn stage(message: impl Into<String>) -> Self {
        PipelineError::Stage {
            message: message.into(),
            fatal: false,
        }
    }

    /// A stage failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        PipelineError::Stage {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<PipelineError> for ExecOutcome {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Stage {
                message,
                fatal: true,
            } => ExecOutcome::fatal(message),
            PipelineError::Timeout => ExecOutcome::transient("timeout"),
            other => ExecOutcome::transient(other.to_string()),
        }
    }
}

/// An ordered sequence of stages.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<StageFn>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageFn>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// A stage that applies `f` to each record independently.
    pub fn map_stage<F>(f: F) -> StageFn
    where
        F: Fn(Record) -> Result<Record, PipelineError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Arc::new(move |input: RecordStream| -> RecordStream {
            let f = Arc::clone(&f);
            Box::new(input.map(move |item| item.and_then(|record| f(record))))
        })
    }

    /// Chain the stages over a one-element stream seeded with `payload`.
    fn stream(&self, payload: Record, deadline: Option<Instant>) -> RecordStream {
        let mut stream: RecordStream = Box::new(std::iter::once(Ok(payload)));
        for stage in &self.stages {
            stream = (stage)(stream);
        }
        match deadline {
            Some(deadline) => Box::new(DeadlineStream {
                inner: stream,
                deadline,
                expired: false,
            }),
            None => stream,
        }
    }

    /// Drive the pipeline to completion; errors short-circuit.
    pub fn run(
        &self,
        payload: Record,
        deadline: Option<Instant>,
    ) -> Result<Record, PipelineError> {
        let mut last = None;
        for item in self.stream(payload, deadline) {
            last = Some(item?);
        }
        last.ok_or(PipelineError::EmptyOutput)
    }

    /// Like `run`, but yields to the scheduler between records so sibling
    /// tasks on a cooperative runner make progress.
    pub async fn run_cooperative(
        &self,
        payload: Record,
        deadline: Option<Instant>,
    ) -> Result<Record, PipelineError> {
        let mut stream = self.stream(payload, deadline);
        let mut last = None;
        while let Some(item) = stream.next() {
            last = Some(item?);
            tokio::task::yield_now().await;
        }
        last.ok_or(PipelineError::EmptyOutput)
    }
}

/// Fails the stream once the deadline passes; checked per pulled record.
/// Pulling interleaves every stage, so this acts as the watchdog for
/// backends that cannot interrupt a running thread.
struct DeadlineStream {
    inner: RecordStream,
    deadline: Instant,
    expired: bool,
}

impl Iterator for DeadlineStream {
    type Item = Result<Record, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.expired {
            return None;
        }
        if Instant::now() >= self.deadline {
            self.expired = true;
            return Some(Err(PipelineError::Timeout));
        }
        self.inner.next()
    }
}
