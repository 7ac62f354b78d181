//! Cooperative task runner: one driver thread hosting many logical tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::KilnError;

/// A boxed task future; suspension happens only where the task awaits.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Single-thread cooperative executor.
///
/// Submissions are delivered over a bounded channel in FIFO order and spawned
/// onto a current-thread tokio runtime, so a suspended task never blocks its
/// siblings and nothing here blocks the engine. Shutdown closes intake;
/// `drain=true` runs accepted tasks to completion, `drain=false` aborts them
/// (an aborted task unwinds at its next await point, one cooperative step).
pub struct AsyncTaskRunner {
    sender: Mutex<Option<mpsc::Sender<TaskFuture>>>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    drain: Arc<AtomicBool>,
    stop: AtomicBool,
}

impl AsyncTaskRunner {
    pub fn new(queue_capacity: usize) -> Result<Self, KilnError> {
        let (tx, rx) = mpsc::channel::<TaskFuture>(queue_capacity.max(1));
        let drain = Arc::new(AtomicBool::new(true));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let driver = {
            let drain = Arc::clone(&drain);
            thread::Builder::new()
                .name("kiln-async-driver".into())
                .spawn(move || drive(runtime, rx, &drain))?
        };

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            driver: Mutex::new(Some(driver)),
            drain,
            stop: AtomicBool::new(false),
        })
    }

    /// FIFO admission; blocks while the queue is full.
    pub fn submit(&self, task: TaskFuture) -> Result<(), KilnError> {
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
        tx.blocking_send(task).map_err(|_| KilnError::ExecutorHalted)
    }

    /// Close intake and join the driver. Idempotent.
    pub fn shutdown(&self, drain: bool) {
        self.drain.store(drain, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the sender ends the driver's receive loop.
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
            && self
                .driver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
    }
}

fn drive(runtime: tokio::runtime::Runtime, mut rx: mpsc::Receiver<TaskFuture>, drain: &AtomicBool) {
    runtime.block_on(async move {
        let mut tasks = JoinSet::new();

        while let Some(task) = rx.recv().await {
            tasks.spawn(task);
            // Reap whatever already finished so the set stays small.
            while tasks.try_join_next().is_some() {}
        }

        if drain.load(Ordering::SeqCst) {
            while tasks.join_next().await.is_some() {}
        } else {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    });
}
