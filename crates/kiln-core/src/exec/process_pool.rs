//! Isolated worker pool: long-lived child processes fed over pipes.
//!
//! Each pool slot is a service thread that owns one child process running
//! this binary in worker mode. Requests and responses are single JSON lines;
//! everything crossing the boundary must serialize. A child that times out
//! or dies is killed and respawned, and the in-flight job is reported as a
//! transient failure.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ExecOutcome;
use crate::error::KilnError;
use crate::metrics::MetricsRegistry;
use crate::pipeline::PipelineRegistry;

use super::Completion;

/// Set in a child's environment to route it into the worker loop.
pub const PROCESS_WORKER_ENV: &str = "KILN_PROCESS_WORKER";

const DEQUEUE_WAIT: Duration = Duration::from_millis(500);

/// Cap on one response wait when no per-job timeout is configured; a child
/// silent for this long is considered wedged.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// One unit of work shipped to a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessWorkRequest {
    pub job_id: String,
    pub pipeline_type: String,
    pub payload: serde_json::Value,
}

/// A child's answer for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessWorkResponse {
    pub job_id: String,
    pub outcome: ExecOutcome,
}

#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,

    /// Worker command; defaults to the current executable with
    /// [`PROCESS_WORKER_ENV`] set.
    pub worker_command: Option<PathBuf>,

    /// Per-response wait; falls back to [`DEFAULT_RESPONSE_TIMEOUT`].
    pub response_timeout: Option<Duration>,
}

struct ProcessRequest {
    line: String,
    complete: Completion,
    metrics: Arc<MetricsRegistry>,
}

/// Fixed-size isolated worker pool.
pub struct ProcessWorkerPool {
    sender: Mutex<Option<SyncSender<ProcessRequest>>>,
    services: Mutex<Vec<thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
}

impl ProcessWorkerPool {
    pub fn new(config: ProcessPoolConfig) -> Result<Self, KilnError> {
        let (tx, rx) = sync_channel::<ProcessRequest>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stop = Arc::new(AtomicBool::new(false));
        let drain = Arc::new(AtomicBool::new(true));
        let response_timeout = config.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);

        let mut services = Vec::with_capacity(config.workers.max(1));
        for i in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let stop = Arc::clone(&stop);
            let drain = Arc::clone(&drain);
            let worker_command = config.worker_command.clone();
            let handle = thread::Builder::new()
                .name(format!("kiln-process-service-{i}"))
                .spawn(move || service_loop(&rx, &stop, &drain, worker_command, response_timeout))?;
            services.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            services: Mutex::new(services),
            stop,
            drain,
        })
    }

    /// Queue a serialized request; blocks while the backlog is at capacity.
    /// The outcome reaches `complete` exactly once.
    pub fn submit(
        &self,
        line: String,
        complete: Completion,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<(), KilnError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(KilnError::ExecutorHalted);
        }
        let tx = {
            let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(KilnError::ExecutorHalted),
            }
        };
        tx.send(ProcessRequest {
            line,
            complete,
            metrics,
        })
        .map_err(|_| KilnError::ExecutorHalted)
    }

    /// Stop the pool: best-effort drain of queued requests, then children are
    /// terminated forcefully. Idempotent.
    pub fn shutdown(&self, drain: bool) {
        self.drain.store(drain, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let handles = std::mem::take(
            &mut *self.services.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
            && self
                .services
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }
}

fn service_loop(
    rx: &Mutex<Receiver<ProcessRequest>>,
    stop: &AtomicBool,
    drain: &AtomicBool,
    worker_command: Option<PathBuf>,
    response_timeout: Duration,
) {
    let mut child: Option<ChildWorker> = None;

    loop {
        if stop.load(Ordering::SeqCst) {
            if drain.load(Ordering::SeqCst) {
                loop {
                    let request = {
                        let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
                        rx.try_recv()
                    };
                    match request {
                        Ok(request) => {
                            handle_request(&mut child, request, &worker_command, response_timeout)
                        }
                        Err(_) => break,
                    }
                }
            }
            break;
        }

        let request = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv_timeout(DEQUEUE_WAIT)
        };
        match request {
            Ok(request) => handle_request(&mut child, request, &worker_command, response_timeout),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(child) = child.take() {
        child.kill();
    }
}

fn handle_request(
    slot: &mut Option<ChildWorker>,
    request: ProcessRequest,
    worker_command: &Option<PathBuf>,
    response_timeout: Duration,
) {
    let _timer = request.metrics.timer("pipeline.run");

    // Reuse the live child or spawn a fresh one.
    if slot.as_mut().map_or(true, |c| !c.alive()) {
        match ChildWorker::spawn(worker_command) {
            Ok(child) => *slot = Some(child),
            Err(e) => {
                request.complete.complete(ExecOutcome::transient(format!(
                    "failed to start process worker: {e}"
                )));
                return;
            }
        }
    }
    let child = match slot.as_mut() {
        Some(child) => child,
        None => return,
    };

    if let Err(e) = child.send_line(&request.line) {
        tracing::warn!(error = %e, "process worker write failed; respawning");
        if let Some(dead) = slot.take() {
            dead.kill();
        }
        request
            .complete
            .complete(ExecOutcome::transient(format!(
                "process worker write failed: {e}"
            )));
        return;
    }

    match child.recv_line(response_timeout) {
        RecvOutcome::Line(line) => match serde_json::from_str::<ProcessWorkResponse>(&line) {
            Ok(response) => request.complete.complete(response.outcome),
            Err(e) => {
                tracing::warn!(error = %e, "malformed process worker response; respawning");
                if let Some(dead) = slot.take() {
                    dead.kill();
                }
                request
                    .complete
                    .complete(ExecOutcome::transient(format!(
                        "malformed process worker response: {e}"
                    )));
            }
        },
        RecvOutcome::Timeout => {
            // Wedged or over budget: kill the execution context.
            if let Some(dead) = slot.take() {
                dead.kill();
            }
            request.complete.complete(ExecOutcome::transient("timeout"));
        }
        RecvOutcome::Dead => {
            if let Some(dead) = slot.take() {
                dead.kill();
            }
            request
                .complete
                .complete(ExecOutcome::transient("process worker exited unexpectedly"));
        }
    }
}

enum RecvOutcome {
    Line(String),
    Timeout,
    Dead,
}

/// One child process plus the plumbing to talk to it.
struct ChildWorker {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
}

impl ChildWorker {
    fn spawn(worker_command: &Option<PathBuf>) -> std::io::Result<Self> {
        let program = match worker_command {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let mut child = Command::new(program)
            .env(PROCESS_WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdout unavailable")
        })?;

        // Reader thread turns blocking pipe reads into timed channel receives.
        let (tx, lines) = sync_channel(1);
        thread::Builder::new()
            .name("kiln-process-reader".into())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            child,
            stdin,
            lines,
        })
    }

    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    fn recv_line(&mut self, timeout: Duration) -> RecvOutcome {
        match self.lines.recv_timeout(timeout) {
            Ok(Ok(line)) => RecvOutcome::Line(line),
            Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => RecvOutcome::Dead,
            Err(RecvTimeoutError::Timeout) => RecvOutcome::Timeout,
        }
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Whether this process was started as a worker child.
pub fn process_worker_requested() -> bool {
    std::env::var_os(PROCESS_WORKER_ENV).is_some_and(|v| v == "1")
}

/// Worker-mode entry point: read one JSON request per line from stdin, run
/// the named pipeline, write one JSON response per line to stdout. Returns
/// when stdin closes.
///
/// The host binary must register its pipelines first; the registry here is
/// this process's own copy (stages never cross the boundary, names do).
pub fn run_process_worker(registry: &PipelineRegistry) -> std::io::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ProcessWorkRequest>(&line) {
            Ok(request) => {
                let outcome = execute_request(registry, &request);
                ProcessWorkResponse {
                    job_id: request.job_id,
                    outcome,
                }
            }
            Err(e) => ProcessWorkResponse {
                job_id: String::new(),
                outcome: ExecOutcome::fatal(format!("malformed work request: {e}")),
            },
        };

        let encoded = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut out = stdout.lock();
        out.write_all(encoded.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

fn execute_request(registry: &PipelineRegistry, request: &ProcessWorkRequest) -> ExecOutcome {
    match registry.get(&request.pipeline_type) {
        Some(factory) => match factory.build().run(request.payload.clone(), None) {
            Ok(output) => ExecOutcome::success(output),
            Err(e) => e.into(),
        },
        None => ExecOutcome::fatal(format!(
            "unknown pipeline type '{}'",
            request.pipeline_type
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_protocol_roundtrips() {
        let request = ProcessWorkRequest {
            job_id: "job-1".into(),
            pipeline_type: "demo".into(),
            payload: json!({"type": "demo", "n": 3}),
        };
        let line = serde_json::to_string(&request).unwrap();
        let back: ProcessWorkRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(back.job_id, "job-1");
        assert_eq!(back.payload, request.payload);

        let response = ProcessWorkResponse {
            job_id: "job-1".into(),
            outcome: ExecOutcome::success(json!(9)),
        };
        let line = serde_json::to_string(&response).unwrap();
        let back: ProcessWorkResponse = serde_json::from_str(&line).unwrap();
        assert!(back.outcome.is_success());
    }

    #[test]
    fn execute_request_runs_registered_pipeline() {
        use crate::pipeline::Pipeline;

        let registry = PipelineRegistry::new();
        registry
            .register_fn("double", || {
                Pipeline::new(vec![Pipeline::map_stage(|r| {
                    Ok(json!(r["n"].as_i64().unwrap_or(0) * 2))
                })])
            })
            .unwrap();

        let outcome = execute_request(
            &registry,
            &ProcessWorkRequest {
                job_id: "job-1".into(),
                pipeline_type: "double".into(),
                payload: json!({"n": 4}),
            },
        );
        assert_eq!(outcome, ExecOutcome::success(json!(8)));
    }

    #[test]
    fn execute_request_flags_unknown_type_fatal() {
        let registry = PipelineRegistry::new();
        let outcome = execute_request(
            &registry,
            &ProcessWorkRequest {
                job_id: "job-1".into(),
                pipeline_type: "nonexistent".into(),
                payload: json!({}),
            },
        );
        assert!(matches!(
            outcome,
            ExecOutcome::Failure {
                kind: crate::domain::FailureKind::Fatal,
                ..
            }
        ));
    }

    #[test]
    fn shutdown_without_work_never_spawns_children() {
        let pool = ProcessWorkerPool::new(ProcessPoolConfig {
            workers: 2,
            queue_capacity: 2,
            worker_command: None,
            response_timeout: None,
        })
        .unwrap();
        pool.shutdown(true);
        assert!(pool.is_halted());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = ProcessWorkerPool::new(ProcessPoolConfig {
            workers: 1,
            queue_capacity: 1,
            worker_command: None,
            response_timeout: None,
        })
        .unwrap();
        pool.shutdown(true);
        let completion = Completion::new(|_| {});
        let err = pool
            .submit("{}".into(), completion, Arc::new(MetricsRegistry::new()))
            .unwrap_err();
        assert!(matches!(err, KilnError::ExecutorHalted));
    }
}
