//! End-to-end engine scenarios: priority ordering, retry exhaustion, aging,
//! cancellation, graceful shutdown, and recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use kiln_core::domain::{ExecutionMode, Job, JobStatus, ResultStatus};
use kiln_core::pipeline::{Pipeline, PipelineError, PipelineRegistry};
use kiln_core::store::{InMemoryStateStore, StateStore};
use kiln_core::{Engine, EngineConfig, KilnError};

/// Fast-polling config with millisecond retry backoff so tests stay quick.
fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 5,
        retry_base_delay_ms: 10,
        retry_multiplier: 2.0,
        thread_workers: 4,
        thread_queue_capacity: 4,
        process_workers: 1,
        process_queue_capacity: 1,
        async_queue_capacity: 16,
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: Engine,
    registry: Arc<PipelineRegistry>,
    loop_handle: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn start(config: EngineConfig) -> Self {
        let registry = Arc::new(PipelineRegistry::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let engine = Engine::new(config, Arc::clone(&registry), store).unwrap();
        let loop_engine = engine.clone();
        let loop_handle = thread::spawn(move || loop_engine.run_loop());
        Self {
            engine,
            registry,
            loop_handle: Some(loop_handle),
        }
    }

    fn stop(mut self) {
        self.engine.initiate_shutdown();
        if let Some(handle) = self.loop_handle.take() {
            handle.join().unwrap();
        }
    }

    fn wait_for_status(&self, job_id: &str, status: JobStatus, deadline: Duration) {
        let start = Instant::now();
        loop {
            let current = self.engine.job(job_id).unwrap().map(|j| j.status);
            if current == Some(status) {
                return;
            }
            assert!(
                start.elapsed() < deadline,
                "job {job_id} did not reach {status:?} in time (currently {current:?})"
            );
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn job(job_id: &str, priority: i64, mode: ExecutionMode, pipeline_type: &str) -> Job {
    Job::new(
        job_id,
        priority,
        mode,
        json!({"type": pipeline_type}),
        3,
    )
    .unwrap()
}

#[test]
fn priority_ordering_runs_highest_first() {
    let config = test_config();
    let registry = Arc::new(PipelineRegistry::new());
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    registry
        .register_fn("record", move || {
            let seen = Arc::clone(&seen);
            Pipeline::new(vec![Pipeline::map_stage(move |r| {
                seen.lock().unwrap().push(r["id"].as_str().unwrap().to_string());
                Ok(json!({"ok": true}))
            })])
        })
        .unwrap();

    // Single worker so completions serialize in dispatch order.
    let config = EngineConfig {
        thread_workers: 1,
        thread_queue_capacity: 1,
        ..config
    };
    let engine = Engine::new(config, Arc::clone(&registry), store).unwrap();

    for (id, priority) in [("a", 1), ("b", 5), ("c", 3)] {
        let job = Job::new(
            id,
            priority,
            ExecutionMode::Thread,
            json!({"type": "record", "id": id}),
            3,
        )
        .unwrap();
        engine.submit(job).unwrap();
    }

    let loop_engine = engine.clone();
    let handle = thread::spawn(move || loop_engine.run_loop());

    let deadline = Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "jobs did not all execute");
        thread::sleep(Duration::from_millis(10));
    }

    engine.initiate_shutdown();
    handle.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["b", "c", "a"]);
}

#[test]
fn retry_exhaustion_counts_attempts_exactly() {
    let harness = Harness::start(test_config());
    harness
        .registry
        .register_fn("boom", || {
            Pipeline::new(vec![Pipeline::map_stage(|_| Err(PipelineError::stage("boom")))])
        })
        .unwrap();

    harness
        .engine
        .submit(job("j-retry", 1, ExecutionMode::Thread, "boom"))
        .unwrap();

    harness.wait_for_status("j-retry", JobStatus::Failed, Duration::from_secs(5));

    let job = harness.engine.job("j-retry").unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("boom"));

    let result = harness.engine.result("j-retry").unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("boom"));
    assert!(result.ended_at >= result.started_at);

    let metrics = harness.engine.metrics();
    assert_eq!(metrics.counter("job.retries"), 2);
    assert_eq!(metrics.counter("job.failure"), 1);
    assert_eq!(metrics.counter("job.success"), 0);

    harness.stop();
}

#[test]
fn completed_job_has_exactly_one_result() {
    let harness = Harness::start(test_config());
    harness
        .registry
        .register_fn("echo", || {
            Pipeline::new(vec![Pipeline::map_stage(|r| Ok(json!({"echo": r})))])
        })
        .unwrap();

    harness
        .engine
        .submit(job("j-ok", 1, ExecutionMode::Thread, "echo"))
        .unwrap();
    harness.wait_for_status("j-ok", JobStatus::Completed, Duration::from_secs(5));

    let result = harness.engine.result("j-ok").unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Completed);
    assert!(result.output.is_some());
    assert!(result.error.is_none());

    harness.stop();
}

#[test]
fn async_mode_runs_cooperatively() {
    let harness = Harness::start(test_config());
    harness
        .registry
        .register_fn("sum", || {
            Pipeline::new(vec![
                Pipeline::map_stage(|r| Ok(json!(r["n"].as_i64().unwrap() + 1))),
                Pipeline::map_stage(|r| Ok(json!(r.as_i64().unwrap() * 3))),
            ])
        })
        .unwrap();

    let job = Job::new(
        "j-async",
        1,
        ExecutionMode::Async,
        json!({"type": "sum", "n": 2}),
        3,
    )
    .unwrap();
    harness.engine.submit(job).unwrap();
    harness.wait_for_status("j-async", JobStatus::Completed, Duration::from_secs(5));

    let result = harness.engine.result("j-async").unwrap().unwrap();
    assert_eq!(result.output, Some(json!(9)));

    harness.stop();
}

#[test]
fn unknown_pipeline_type_fails_fatally() {
    let harness = Harness::start(test_config());

    harness
        .engine
        .submit(job("j-unknown", 1, ExecutionMode::Thread, "nonexistent"))
        .unwrap();
    harness.wait_for_status("j-unknown", JobStatus::Failed, Duration::from_secs(5));

    let job = harness.engine.job("j-unknown").unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("unknown pipeline type"));

    let result = harness.engine.result("j-unknown").unwrap().unwrap();
    assert!(result.error.unwrap().contains("nonexistent"));

    let metrics = harness.engine.metrics();
    assert_eq!(metrics.counter("job.retries"), 0);

    harness.stop();
}

#[test]
fn duplicate_job_id_is_rejected_without_side_effects() {
    let harness = Harness::start(test_config());
    harness
        .registry
        .register_fn("echo", || {
            Pipeline::new(vec![Pipeline::map_stage(|r| Ok(json!({"echo": r})))])
        })
        .unwrap();

    harness
        .engine
        .submit(job("j-dup", 1, ExecutionMode::Thread, "echo"))
        .unwrap();
    let err = harness
        .engine
        .submit(job("j-dup", 9, ExecutionMode::Thread, "echo"))
        .unwrap_err();
    assert!(matches!(err, KilnError::DuplicateJob(id) if id == "j-dup"));

    harness.wait_for_status("j-dup", JobStatus::Completed, Duration::from_secs(5));
    // The first submission's priority survived.
    assert_eq!(harness.engine.job("j-dup").unwrap().unwrap().priority, 1);

    harness.stop();
}

#[test]
fn cancel_pending_job_never_executes() {
    // No loop running yet: the job stays queued until we start one.
    let registry = Arc::new(PipelineRegistry::new());
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&executed);
    registry
        .register_fn("count", move || {
            let counter = Arc::clone(&counter);
            Pipeline::new(vec![Pipeline::map_stage(move |r| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(r)
            })])
        })
        .unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let engine = Engine::new(test_config(), registry, store).unwrap();

    engine
        .submit(job("j-cancel", 5, ExecutionMode::Thread, "count"))
        .unwrap();
    engine.cancel("j-cancel").unwrap();

    let loop_engine = engine.clone();
    let handle = thread::spawn(move || loop_engine.run_loop());
    thread::sleep(Duration::from_millis(100));
    engine.initiate_shutdown();
    handle.join().unwrap();

    assert_eq!(executed.load(Ordering::SeqCst), 0);
    let job = engine.job("j-cancel").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(engine.result("j-cancel").unwrap().is_none());
}

#[test]
fn graceful_shutdown_finishes_in_flight_and_keeps_rest_pending() {
    let registry = Arc::new(PipelineRegistry::new());
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    registry
        .register_fn("slow", move || {
            let counter = Arc::clone(&counter);
            Pipeline::new(vec![Pipeline::map_stage(move |r| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(25));
                Ok(r)
            })])
        })
        .unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    // Two workers, tight queue: dispatch is throttled by backpressure.
    let config = EngineConfig {
        thread_workers: 2,
        thread_queue_capacity: 1,
        ..test_config()
    };
    let engine = Engine::new(config, registry, store).unwrap();

    for i in 0..50 {
        engine
            .submit(job(&format!("j-{i}"), 1, ExecutionMode::Thread, "slow"))
            .unwrap();
    }

    let loop_engine = engine.clone();
    let handle = thread::spawn(move || loop_engine.run_loop());

    // Let a handful start, then pull the plug.
    while started.load(Ordering::SeqCst) < 4 {
        thread::sleep(Duration::from_millis(5));
    }
    engine.initiate_shutdown();
    handle.join().unwrap();

    let mut completed = 0;
    let mut pending = 0;
    for i in 0..50 {
        let job = engine.job(&format!("j-{i}")).unwrap().unwrap();
        match job.status {
            JobStatus::Completed => {
                completed += 1;
                // Every terminal job has a persisted result.
                assert!(engine.result(&job.job_id).unwrap().is_some());
            }
            JobStatus::Pending => {
                pending += 1;
                assert!(engine.result(&job.job_id).unwrap().is_none());
            }
            other => panic!("job {} ended in unexpected state {other:?}", job.job_id),
        }
    }
    assert!(completed >= 4, "in-flight jobs should have finished");
    assert!(pending > 0, "undispatched jobs should stay PENDING");
    assert_eq!(completed + pending, 50);
}

#[test]
fn aging_prevents_starvation() {
    // Tightened aging so the low-priority job overtakes in well under a
    // second of queue time.
    let config = EngineConfig {
        aging_interval_ms: 20,
        aging_boost: 2,
        thread_workers: 1,
        thread_queue_capacity: 1,
        ..test_config()
    };
    let registry = Arc::new(PipelineRegistry::new());
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    registry
        .register_fn("track", move || {
            let seen = Arc::clone(&seen);
            Pipeline::new(vec![Pipeline::map_stage(move |r| {
                seen.lock().unwrap().push(r["id"].as_str().unwrap().to_string());
                thread::sleep(Duration::from_millis(10));
                Ok(json!({"ok": true}))
            })])
        })
        .unwrap();
    let engine = Engine::new(config, registry, store).unwrap();

    let low = Job::new(
        "low",
        0,
        ExecutionMode::Thread,
        json!({"type": "track", "id": "low"}),
        3,
    )
    .unwrap();
    engine.submit(low).unwrap();

    let loop_engine = engine.clone();
    let handle = thread::spawn(move || loop_engine.run_loop());

    // Keep a stream of high-priority arrivals coming.
    let feeder_engine = engine.clone();
    let feeder = thread::spawn(move || {
        for i in 0..40 {
            let high = Job::new(
                format!("high-{i}"),
                10,
                ExecutionMode::Thread,
                json!({"type": "track", "id": format!("high-{i}")}),
                3,
            )
            .unwrap();
            if feeder_engine.submit(high).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(15));
        }
    });

    let start = Instant::now();
    loop {
        if order.lock().unwrap().iter().any(|id| id == "low") {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "low-priority job starved"
        );
        thread::sleep(Duration::from_millis(10));
    }

    feeder.join().unwrap();
    engine.initiate_shutdown();
    handle.join().unwrap();
}

#[test]
fn resume_pending_reschedules_stored_jobs() {
    let store = Arc::new(InMemoryStateStore::new());

    // First engine accepts the job but never runs a loop.
    {
        let registry = Arc::new(PipelineRegistry::new());
        let engine = Engine::new(
            test_config(),
            registry,
            Arc::clone(&store) as Arc<dyn StateStore>,
        )
        .unwrap();
        engine
            .submit(job("j-resume", 1, ExecutionMode::Thread, "echo"))
            .unwrap();
    }

    // Second engine picks it up from the store and runs it.
    let registry = Arc::new(PipelineRegistry::new());
    registry
        .register_fn("echo", || {
            Pipeline::new(vec![Pipeline::map_stage(|r| Ok(json!({"echo": r})))])
        })
        .unwrap();
    let engine = Engine::new(
        test_config(),
        registry,
        Arc::clone(&store) as Arc<dyn StateStore>,
    )
    .unwrap();
    assert_eq!(engine.resume_pending().unwrap(), 1);
    assert_eq!(engine.queued(), 1);

    let loop_engine = engine.clone();
    let handle = thread::spawn(move || loop_engine.run_loop());
    let start = Instant::now();
    loop {
        if engine.job("j-resume").unwrap().unwrap().status == JobStatus::Completed {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        thread::sleep(Duration::from_millis(10));
    }
    engine.initiate_shutdown();
    handle.join().unwrap();
}

#[test]
fn timeout_is_classified_transient_and_retried() {
    let config = EngineConfig {
        job_timeout_ms: Some(30),
        ..test_config()
    };
    let harness = Harness::start(config);
    harness
        .registry
        .register_fn("sleepy", || {
            Pipeline::new(vec![
                // Burn past the deadline record by record.
                Pipeline::map_stage(|r| {
                    thread::sleep(Duration::from_millis(40));
                    Ok(r)
                }),
                Pipeline::map_stage(Ok),
            ])
        })
        .unwrap();

    harness
        .engine
        .submit(job("j-timeout", 1, ExecutionMode::Thread, "sleepy"))
        .unwrap();
    harness.wait_for_status("j-timeout", JobStatus::Failed, Duration::from_secs(10));

    let job = harness.engine.job("j-timeout").unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("timeout"));

    harness.stop();
}
