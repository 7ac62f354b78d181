//! Shared-memory worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::KilnError;

/// Work accepted by the pool.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Timed dequeue so workers notice the shutdown flag promptly.
const DEQUEUE_WAIT: Duration = Duration::from_millis(500);

/// Fixed-size set of long-lived workers pulling from a bounded queue.
///
/// `submit` blocks while the queue is full (backpressure). Workers check the
/// shutdown flag on each dequeue; with `drain=true` they empty the queue
/// before exiting.
pub struct ThreadWorkerPool {
    sender: Mutex<Option<SyncSender<Work>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
}

impl ThreadWorkerPool {
    pub fn new(num_workers: usize, queue_capacity: usize) -> Result<Self, KilnError> {
        let (tx, rx) = sync_channel::<Work>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stop = Arc::new(AtomicBool::new(false));
        let drain = Arc::new(AtomicBool::new(true));

        let mut workers = Vec::with_capacity(num_workers.max(1));
        for i in 0..num_workers.max(1) {
            let rx = Arc::clone(&rx);
            let stop = Arc::clone(&stop);
            let drain = Arc::clone(&drain);
            let handle = thread::Builder::new()
                .name(format!("kiln-thread-worker-{i}"))
                .spawn(move || worker_loop(&rx, &stop, &drain))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stop,
            drain,
        })
    }

    /// Queue one unit of work; blocks while the backlog is at capacity.
    pub fn submit(&self, work: Work) -> Result<(), KilnError> {
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
        tx.send(work).map_err(|_| KilnError::ExecutorHalted)
    }

    /// Stop the pool and join every worker. Idempotent.
    pub fn shutdown(&self, drain: bool) {
        self.drain.store(drain, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        // Disconnect so workers blocked in the timed dequeue wake up.
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
            && self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }
}

fn worker_loop(rx: &Mutex<Receiver<Work>>, stop: &AtomicBool, drain: &AtomicBool) {
    loop {
        if stop.load(Ordering::SeqCst) {
            if drain.load(Ordering::SeqCst) {
                loop {
                    let work = {
                        let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
                        rx.try_recv()
                    };
                    match work {
                        Ok(work) => work(),
                        Err(_) => break,
                    }
                }
            }
            break;
        }

        let work = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv_timeout(DEQUEUE_WAIT)
        };
        match work {
            Ok(work) => work(),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
