//! A fiber-based task scheduler.
//!
//! A fixed pool of worker threads runs tasks on pooled stackful fibers.
//! Tasks are grouped into counted [`TaskGroup`]s, and waiting on a group from
//! inside a task suspends only that task: the worker thread goes on running
//! other ready work until the group completes. Idle workers steal from busy
//! ones.
//!
//! ```ignore
//! let scheduler = fibersched::Builder::new().worker_threads(4).try_build()?;
//!
//! let group = scheduler.create_group()?;
//! scheduler.submit_batch((0..100).map(|i| Task::new(move || work(i))), Some(group));
//! scheduler.wait_for_group(group);
//! scheduler.release_group(group);
//!
//! scheduler.shutdown()?;
//! ```

pub mod error;
pub use error::{SchedulerError, TaskFailure};

pub mod fiber;

pub mod runtime;
pub use runtime::{
    Builder, Handle, Scheduler, SchedulerListener, TaskStealing, WorkerStats, current_worker,
    yield_now,
};

pub mod sync;

pub mod task;
pub use task::{Affinity, Priority, StackClass, Task, TaskBuilder, TaskGroup, TaskId};

mod utils;

#[cfg(test)]
mod test_utils;
