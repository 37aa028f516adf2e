use crate::runtime::{Builder, Scheduler};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Installs a fmt subscriber filtered by `RUST_LOG`, once per test binary.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[must_use = "dropping the scheduler shuts it down"]
pub(crate) fn init_scheduler(worker_threads: usize, builder: Option<Builder>) -> Result<Scheduler> {
    init_tracing();

    builder
        .unwrap_or_default()
        .worker_threads(worker_threads)
        .fiber_pool_size(8)
        .try_build()
}

/// Keeps the CPU busy without sleeping, so a worker stays occupied and its
/// queue is left for others to steal from.
pub(crate) fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// Shared append-only record of what ran, in completion order.
#[derive(Debug, Clone)]
pub(crate) struct ExecLog<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> ExecLog<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn push(&self, entry: T) {
        self.entries.lock().push(entry);
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Global sequence numbers, to order events across threads.
#[derive(Debug, Clone, Default)]
pub(crate) struct Sequencer(Arc<AtomicUsize>);

impl Sequencer {
    pub(crate) fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
