use crate::fiber::{self, Fiber, FiberSignal};
use crate::task::Task;

// Public API
mod builder;
pub use builder::{Builder, TaskStealing};

mod scheduler;
pub use scheduler::{Handle, Scheduler};

pub(crate) mod context;
pub use context::current_worker;

mod listener;
pub use listener::SchedulerListener;

mod pool;

mod ticker;

mod worker;
pub use worker::WorkerStats;

/// Unit of work held by the scheduler queues.
pub(crate) enum Runnable {
    /// A task that has not started yet. It gets a fiber when a worker picks it
    /// up.
    Task(Task),

    /// A suspended fiber ready to continue its task.
    Resume(Fiber),
}

/// Suspends the running task and requeues it behind the worker's other work.
///
/// Outside of a task this is [`std::thread::yield_now`].
pub fn yield_now() {
    if fiber::is_in_fiber() {
        fiber::suspend(FiberSignal::Yield);
    } else {
        std::thread::yield_now();
    }
}
