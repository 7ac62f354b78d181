//! Shutdown coordination: a one-shot broadcast flag plus ordered cleanups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

type Cleanup = Box<dyn FnOnce() + Send>;

/// Coordinates graceful shutdown.
///
/// `trigger` is the broadcast signal; pollers (the engine loop, backend
/// workers) observe it via `is_triggered`. Cleanups registered with
/// `register` run in reverse registration order when `unwind` is called:
/// components that acquire resources later release them earlier. The engine
/// unwinds after it has drained the backends.
#[derive(Default)]
pub struct ShutdownCoordinator {
    triggered: AtomicBool,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup to run during `unwind`.
    pub fn register<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().push(Box::new(cleanup));
    }

    /// Signal shutdown. Idempotent; returns whether this call was the first.
    pub fn trigger(&self) -> bool {
        !self.triggered.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Run registered cleanups, last registered first. Each cleanup runs at
    /// most once; calling again is a no-op.
    pub fn unwind(&self) {
        let drained: Vec<Cleanup> = {
            let mut cleanups = self.lock();
            cleanups.drain(..).collect()
        };
        for cleanup in drained.into_iter().rev() {
            cleanup();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Cleanup>> {
        self.cleanups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
