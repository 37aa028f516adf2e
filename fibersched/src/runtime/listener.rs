use crate::task::{StackClass, TaskGroup, TaskId};
use std::fmt;
use std::sync::Arc;

/// Observes scheduler activity, for profilers and timeline tools.
///
/// Every method defaults to doing nothing. Callbacks run inline on the thread
/// where the event happens, so they should be cheap and never block. A
/// panicking callback is logged and otherwise ignored.
///
/// Task execution is reported per slice: a task that suspends reports a stop
/// when it switches out and a new start, possibly on another worker, when it
/// is resumed.
#[allow(unused_variables)]
pub trait SchedulerListener: Send + Sync + 'static {
    /// Fibers allocated up front when the scheduler starts.
    fn on_fibers_created(&self, class: StackClass, count: usize) {}

    /// All worker threads were spawned.
    fn on_threads_created(&self, count: usize) {}

    fn on_thread_started(&self, worker: usize) {}

    fn on_thread_stopped(&self, worker: usize) {}

    /// The worker found no work and is about to sleep.
    fn on_idle_started(&self, worker: usize) {}

    fn on_idle_finished(&self, worker: usize) {}

    /// The worker switched into the fiber running `task`.
    fn on_task_execute_start(&self, worker: usize, task: TaskId) {}

    /// The fiber running `task` finished or suspended.
    fn on_task_execute_stop(&self, worker: usize, task: TaskId) {}

    /// A task or thread started waiting on `group`, or on every task when
    /// `group` is `None`.
    fn on_wait_started(&self, group: Option<TaskGroup>) {}

    fn on_wait_finished(&self, group: Option<TaskGroup>) {}
}

#[derive(Clone)]
pub(crate) struct Listener(pub(crate) Arc<dyn SchedulerListener>);

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&"<listener>").finish()
    }
}
