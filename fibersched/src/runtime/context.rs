//! Thread-local context of worker threads.
//!
//! Tasks reach the worker they run on through this context, for instance to
//! push child tasks onto its local queue. A suspended fiber may resume on a
//! different worker, so the context must be looked up again after every
//! suspension and never cached across one.

use crate::runtime::scheduler::Shared;
use crate::runtime::worker::Worker;
use std::cell::OnceCell;
use std::sync::Arc;
use std::thread_local;

thread_local! {
    static CONTEXT: OnceCell<Worker> = const { OnceCell::new() };
}

#[track_caller]
pub(crate) fn init_worker_context(worker: Worker) {
    CONTEXT.with(|ctx| {
        if ctx.set(worker).is_err() {
            panic!("worker context already initialized on this thread");
        }
    });
}

/// Runs `f` with the worker owning the current thread, if any.
#[inline(never)]
pub(crate) fn with_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Worker) -> R,
{
    CONTEXT.with(|ctx| ctx.get().map(f))
}

/// Like [`with_worker`], restricted to workers of the scheduler `shared`.
pub(crate) fn with_worker_of<F, R>(shared: &Arc<Shared>, f: F) -> Option<R>
where
    F: FnOnce(&Worker) -> R,
{
    with_worker(|worker| Arc::ptr_eq(worker.shared(), shared).then(|| f(worker))).flatten()
}

#[track_caller]
pub(crate) fn expect_worker<F, R>(f: F) -> R
where
    F: FnOnce(&Worker) -> R,
{
    with_worker(f).expect("Worker context not initialized")
}

/// Index of the worker running the calling task, `None` outside of worker
/// threads.
pub fn current_worker() -> Option<usize> {
    with_worker(|worker| worker.index())
}
