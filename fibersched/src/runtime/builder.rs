use crate::error::{SchedulerError, TaskFailure};
use crate::fiber::MIN_STACK_SIZE;
use crate::runtime::listener::Listener;
use crate::runtime::{Scheduler, SchedulerListener};
use anyhow::Result;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Stack size of standard fibers.
const FIBER_STACK_SIZE: usize = 64 * 1024;

/// Stack size of extended fibers.
const EXTENDED_FIBER_STACK_SIZE: usize = 1024 * 1024;

/// Standard fibers created when the scheduler starts.
const FIBER_POOL_SIZE: usize = 64;

/// Growth ceiling of each fiber pool.
const MAX_FIBERS: usize = 1024;

const MAX_GROUPS: u32 = 1024;

/// Inbox interval default value. Same value tokio uses for its global queue.
const INBOX_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// Upper bound on how long an idle worker sleeps without being signaled.
const IDLE_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("fibersched-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Clone)]
pub(crate) struct FailureHook(pub(crate) Arc<dyn Fn(&TaskFailure) + Send + Sync + 'static>);

impl fmt::Debug for FailureHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FailureHook").field(&"<function>").finish()
    }
}

/// Whether idle workers take work from each other.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStealing {
    #[default]
    Enabled,

    /// Each worker only runs what was routed to it. Tasks submitted from
    /// inside a task stay on the submitting worker.
    Disabled,
}

#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads. Defaults to one per core minus one,
    /// leaving a core for the thread that submits work.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the scheduler.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the scheduler.
    thread_stack_size: Option<usize>,

    /// Pin worker N to core N.
    pin_workers: bool,

    fiber_stack_size: usize,

    extended_fiber_stack_size: usize,

    /// Standard fibers allocated up front.
    fiber_pool_size: usize,

    /// Extended fibers allocated up front.
    extended_fiber_pool_size: usize,

    /// Upper bound on fibers per stack class. A task that finds its pool
    /// exhausted is deferred until a fiber of its class is released.
    max_fibers: usize,

    /// Groups that may exist at the same time.
    max_groups: u32,

    task_stealing: TaskStealing,

    /// How many ticks before a worker checks its inbox ahead of its local
    /// queue.
    inbox_interval: u32,

    /// How many times a worker will loop over the other workers' queues to
    /// try and find work before going idle.
    max_steal_retries: usize,

    /// Bound on the idle backoff wait.
    idle_timeout: Duration,

    /// Called on the worker thread for every task that panics.
    on_task_failure: Option<FailureHook>,

    listener: Option<Listener>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Returns a new builder with default configuration. Configuration
    /// methods can be chained on the return value.
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            pin_workers: false,
            fiber_stack_size: FIBER_STACK_SIZE,
            extended_fiber_stack_size: EXTENDED_FIBER_STACK_SIZE,
            fiber_pool_size: FIBER_POOL_SIZE,
            extended_fiber_pool_size: 0,
            max_fibers: MAX_FIBERS,
            max_groups: MAX_GROUPS,
            task_stealing: TaskStealing::default(),
            inbox_interval: INBOX_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            idle_timeout: IDLE_TIMEOUT,
            on_task_failure: None,
            listener: None,
        }
    }

    /// The number of worker threads.
    ///
    /// 0 or not set means the number of cores minus one, and at least one.
    pub fn worker_threads(mut self, val: usize) -> Self {
        self.worker_threads = (val > 0).then_some(val);
        self
    }

    /// Sets name of threads spawned by the `Scheduler`.
    ///
    /// The default name is "fibersched-{id}", where id is monotonically
    /// increasing.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Scheduler`.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the OS stack size (in bytes) for worker threads. Tasks never run
    /// on this stack, only the scheduling loop does.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Pin worker N to CPU core N (modulo the number of cores).
    pub fn pin_workers(mut self, val: bool) -> Self {
        self.pin_workers = val;
        self
    }

    /// Stack size of [`StackClass::Standard`](crate::StackClass) fibers.
    /// Must be at least [`MIN_STACK_SIZE`](crate::fiber::MIN_STACK_SIZE).
    pub fn fiber_stack_size(mut self, val: usize) -> Self {
        self.fiber_stack_size = val;
        self
    }

    /// Stack size of [`StackClass::Extended`](crate::StackClass) fibers.
    pub fn extended_fiber_stack_size(mut self, val: usize) -> Self {
        self.extended_fiber_stack_size = val;
        self
    }

    pub fn fiber_pool_size(mut self, val: usize) -> Self {
        self.fiber_pool_size = val;
        self
    }

    pub fn extended_fiber_pool_size(mut self, val: usize) -> Self {
        self.extended_fiber_pool_size = val;
        self
    }

    #[track_caller]
    pub fn max_fibers(mut self, val: usize) -> Self {
        assert!(val > 0, "max_fibers must be greater than 0");
        self.max_fibers = val;
        self
    }

    #[track_caller]
    pub fn max_groups(mut self, val: u32) -> Self {
        assert!(val > 0, "max_groups must be greater than 0");
        self.max_groups = val;
        self
    }

    pub fn task_stealing(mut self, val: TaskStealing) -> Self {
        self.task_stealing = val;
        self
    }

    /// Sets the number of ticks after which a worker checks its inbox before
    /// its local queue.
    ///
    /// A tick corresponds to one task started or resumed. Work submitted
    /// from outside the scheduler lands in worker inboxes, work submitted by
    /// running tasks in the local queue. A smaller interval gets external
    /// work started sooner, a larger one favors finishing what is already
    /// in flight.
    #[track_caller]
    pub fn inbox_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "inbox_interval must be greater than 0");
        self.inbox_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    #[track_caller]
    pub fn idle_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "idle_timeout must be greater than 0");
        self.idle_timeout = val;
        self
    }

    /// Registers a callback invoked for every task that panics. It runs on
    /// the worker thread, after the failure was logged. A panic in the
    /// callback is logged and ignored.
    pub fn on_task_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        self.on_task_failure = Some(FailureHook(Arc::new(f)));
        self
    }

    /// Registers a [`SchedulerListener`] notified of thread, idle, task
    /// execution and wait events.
    pub fn listener<L: SchedulerListener>(mut self, listener: L) -> Self {
        self.listener = Some(Listener(Arc::new(listener)));
        self
    }

    /// Creates the configured `Scheduler`.
    ///
    /// The returned `Scheduler` has its workers running and is ready to
    /// accept tasks.
    pub fn try_build(self) -> Result<Scheduler> {
        let cfg = SchedulerConfig::try_from(self)?;
        Scheduler::start(cfg)
    }
}

// Export builder as a SchedulerConfig object to be consumed by the scheduler
// and each worker.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) pin_workers: bool,
    pub(crate) fiber_stack_size: usize,
    pub(crate) extended_fiber_stack_size: usize,
    pub(crate) fiber_pool_size: usize,
    pub(crate) extended_fiber_pool_size: usize,
    pub(crate) max_fibers: usize,
    pub(crate) max_groups: u32,
    pub(crate) task_stealing: TaskStealing,
    pub(crate) inbox_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) on_task_failure: Option<FailureHook>,
    pub(crate) listener: Option<Listener>,
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |msg: String| Err(SchedulerError::InvalidConfig(msg));

        if self.fiber_stack_size < MIN_STACK_SIZE {
            return invalid(format!(
                "fiber_stack_size of {} bytes is below the {MIN_STACK_SIZE} bytes minimum",
                self.fiber_stack_size
            ));
        }

        if self.extended_fiber_stack_size < self.fiber_stack_size {
            return invalid(format!(
                "extended_fiber_stack_size ({}) must be at least fiber_stack_size ({})",
                self.extended_fiber_stack_size, self.fiber_stack_size
            ));
        }

        let prealloc = self.fiber_pool_size.max(self.extended_fiber_pool_size);
        if prealloc > self.max_fibers {
            return invalid(format!(
                "fiber pools pre-allocate {prealloc} fibers, above max_fibers ({})",
                self.max_fibers
            ));
        }

        Ok(())
    }

    /// Stealing only makes sense with someone to steal from.
    pub(crate) fn stealing_enabled(&self) -> bool {
        self.task_stealing == TaskStealing::Enabled && self.worker_threads > 1
    }
}

impl TryFrom<Builder> for SchedulerConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get().saturating_sub(1).max(1),
        };

        let cfg = SchedulerConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            pin_workers: builder.pin_workers,
            fiber_stack_size: builder.fiber_stack_size,
            extended_fiber_stack_size: builder.extended_fiber_stack_size,
            fiber_pool_size: builder.fiber_pool_size,
            extended_fiber_pool_size: builder.extended_fiber_pool_size,
            max_fibers: builder.max_fibers,
            max_groups: builder.max_groups,
            task_stealing: builder.task_stealing,
            inbox_interval: builder.inbox_interval,
            max_steal_retries: builder.max_steal_retries,
            idle_timeout: builder.idle_timeout,
            on_task_failure: builder.on_task_failure,
            listener: builder.listener,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
