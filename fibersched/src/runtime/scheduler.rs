use crate::error::{SchedulerError, fatal, panic_payload_as_str};
use crate::fiber::pool::FiberPool;
use crate::fiber::{self, Fiber, FiberSignal};
use crate::runtime::builder::{Builder, SchedulerConfig};
use crate::runtime::pool::ThreadPool;
use crate::runtime::worker::{Remote, Worker, WorkerStats};
use crate::runtime::{Runnable, SchedulerListener, context};
use crate::sync::{Event, ResetMode};
use crate::task::group::{GroupState, GroupTable};
use crate::task::{Affinity, Priority, StackClass, Task, TaskGroup};
use anyhow::Result;
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use smallvec::SmallVec;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering, fence};
use std::time::{Duration, Instant};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running = 0,

    /// Shutdown requested. Only tasks already inside the scheduler may still
    /// submit work.
    Draining = 1,

    /// All work completed, workers are exiting.
    Stopped = 2,
}

/// State shared by the scheduler handles and every worker.
pub(crate) struct Shared {
    pub(crate) cfg: SchedulerConfig,

    /// One entry per worker, visible to every other worker.
    pub(crate) remotes: Box<[Remote]>,

    /// High priority tasks, checked by every worker first.
    pub(crate) high: Injector<Runnable>,

    pub(crate) groups: GroupTable<Fiber>,

    /// Implicit group every submitted task joins. Backs `wait_all`.
    pub(crate) all: GroupState<Fiber>,

    /// Indexed by `StackClass::index`.
    pools: [FiberPool; 2],

    /// Round-robin cursor for external submissions.
    next_inbox: AtomicUsize,

    state: AtomicU8,
}

impl Shared {
    fn new(cfg: SchedulerConfig, stealers: Vec<Stealer<Runnable>>) -> Result<Self, SchedulerError> {
        let pools = StackClass::ALL.map(|class| {
            let stack_size = match class {
                StackClass::Standard => cfg.fiber_stack_size,
                StackClass::Extended => cfg.extended_fiber_stack_size,
            };
            FiberPool::new(class, stack_size, cfg.max_fibers)
        });

        pools[StackClass::Standard.index()].prealloc(cfg.fiber_pool_size)?;
        pools[StackClass::Extended.index()].prealloc(cfg.extended_fiber_pool_size)?;

        let shared = Self {
            remotes: stealers.into_iter().map(Remote::new).collect(),
            high: Injector::new(),
            groups: GroupTable::new(cfg.max_groups),
            all: GroupState::new(),
            pools,
            next_inbox: AtomicUsize::new(0),
            state: AtomicU8::new(State::Running as u8),
            cfg,
        };

        for pool in &shared.pools {
            shared.listen(|l| l.on_fibers_created(pool.class(), pool.allocated()));
        }

        Ok(shared)
    }

    pub(crate) fn pool(&self, class: StackClass) -> &FiberPool {
        &self.pools[class.index()]
    }

    /// Calls the configured listener, if any. A panic in the callback is
    /// logged and swallowed, it must not take a worker down.
    pub(crate) fn listen<F>(&self, f: F)
    where
        F: FnOnce(&dyn SchedulerListener),
    {
        let Some(listener) = &self.cfg.listener else {
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(&*listener.0))) {
            tracing::error!(
                message = panic_payload_as_str(&payload),
                "scheduler listener panicked"
            );
        }
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Running,
            1 => State::Draining,
            _ => State::Stopped,
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state() == State::Stopped
    }

    /// Returns false if shutdown was already requested.
    fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(
                State::Running as u8,
                State::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn stop(&self) {
        self.state.store(State::Stopped as u8, Ordering::Release);
        for remote in self.remotes.iter() {
            remote.wakeup.signal();
        }
    }

    /// Wakes worker `index` if it is idle. Call after making work visible to
    /// it.
    pub(crate) fn notify(&self, index: usize) {
        fence(Ordering::SeqCst);

        let remote = &self.remotes[index];
        if remote.sleeping.load(Ordering::SeqCst) {
            remote.wakeup.signal();
        }
    }

    /// Wakes one idle worker other than `except`, so it can steal.
    pub(crate) fn notify_idle(&self, except: Option<usize>) {
        fence(Ordering::SeqCst);

        if let Some(remote) = self
            .remotes
            .iter()
            .enumerate()
            .find(|(i, r)| Some(*i) != except && r.sleeping.load(Ordering::SeqCst))
            .map(|(_, r)| r)
        {
            remote.wakeup.signal();
        }
    }

    /// Validates a batch and accounts for it in its group and in the implicit
    /// all-tasks group. Runs before any task of the batch is enqueued.
    #[track_caller]
    fn admit(&self, tasks: &mut [Task], group: Option<TaskGroup>, internal: bool) {
        match self.state() {
            State::Running => {}
            State::Draining if internal => {}
            state => fatal(format!("task submission after shutdown ({state:?})")),
        }

        let workers = self.remotes.len();
        for task in tasks.iter_mut() {
            if let Affinity::Worker(index) = task.affinity()
                && index >= workers
            {
                fatal(format!(
                    "task {} pinned to worker {index}, the scheduler has {workers} workers",
                    task.id()
                ));
            }
            task.meta.group = group;
        }

        if let Some(group) = group {
            match self.groups.get(group) {
                Some(state) => state.add(tasks.len()),
                None => fatal(format!("submission to released or unknown task group {group}")),
            }
        }

        self.all.add(tasks.len());
    }

    /// Places a task on a queue according to its hints. `worker` is the
    /// worker running the submitting task, if any.
    fn route(&self, task: Task, worker: Option<&Worker>) {
        match (task.affinity(), task.priority(), worker) {
            (Affinity::Worker(index), _, _) => {
                self.remotes[index].pinned.push(Runnable::Task(task));
                self.notify(index);
            }
            (Affinity::Any, Priority::High, worker) => {
                self.high.push(Runnable::Task(task));
                self.notify_idle(worker.map(|w| w.index()));
            }
            (Affinity::Any, Priority::Normal, Some(worker)) => worker.push_local(Runnable::Task(task)),
            (Affinity::Any, Priority::Normal, None) => {
                let index = self.next_inbox.fetch_add(1, Ordering::Relaxed) % self.remotes.len();
                self.remotes[index].inbox.push(Runnable::Task(task));
                self.notify(index);
            }
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("workers", &self.remotes.len())
            .field("state", &self.state())
            .field("pending", &self.all.pending())
            .finish_non_exhaustive()
    }
}

/// Owns the worker threads. Dropping it shuts the scheduler down: it waits
/// for every submitted task to complete, then joins the workers.
///
/// All submission and wait operations live on [`Handle`], which `Scheduler`
/// dereferences to.
#[derive(Debug)]
pub struct Scheduler {
    handle: Handle,
    pool: ThreadPool,
}

impl Scheduler {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(cfg: SchedulerConfig) -> Result<Self> {
        let num_workers = cfg.worker_threads;

        // Create Crossbeam LIFO queues and their stealers
        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_lifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let shared = Arc::new(Shared::new(cfg, stealers)?);
        let pool = ThreadPool::spawn(&shared, local_queues)?;

        tracing::debug!(workers = num_workers, "scheduler started");

        Ok(Self {
            handle: Handle(shared),
            pool,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops accepting new work from outside the scheduler, waits until
    /// every submitted task completed, including tasks those tasks submit
    /// while draining, then joins the workers.
    ///
    /// The `Drop` implementation does the same and logs errors.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        if self.handle.0.begin_drain() {
            tracing::debug!("scheduler draining");
            self.handle.wait_all();
            self.handle.0.stop();
        }

        self.pool.join_all()?;
        tracing::debug!("scheduler stopped");
        Ok(())
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::error!(error = ?e, "error during scheduler shutdown");
        }
    }
}

/// Cloneable reference to a running scheduler, used to submit and wait on
/// work. Handles stay valid after shutdown, but submitting through them then
/// is a fatal error.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Shared>);

impl Handle {
    /// Handle of the scheduler running the calling task.
    pub fn try_current() -> Option<Handle> {
        context::with_worker(|worker| Handle(Arc::clone(worker.shared())))
    }

    /// Fails once `max_groups` groups exist at the same time.
    pub fn create_group(&self) -> Result<TaskGroup, SchedulerError> {
        self.0.groups
            .create()
            .ok_or(SchedulerError::GroupsExhausted {
                capacity: self.0.groups.capacity(),
            })
    }

    /// Returns the group's slot for reuse. Old copies of `group` become
    /// invalid.
    ///
    /// # Panics
    ///
    /// Releasing a group that still has outstanding tasks or waiters, or that
    /// was already released, is a fatal error.
    #[track_caller]
    pub fn release_group(&self, group: TaskGroup) {
        self.0.groups.release(group);
    }

    #[track_caller]
    pub fn submit(&self, task: Task, group: Option<TaskGroup>) {
        self.submit_batch([task], group);
    }

    /// Enqueues `tasks` and returns immediately. The group counter is
    /// incremented for the whole batch before any task is enqueued.
    ///
    /// From inside a task, tasks without hints go to the local queue of the
    /// worker running it. From any other thread they are spread round-robin
    /// over the workers.
    ///
    /// # Panics
    ///
    /// Submitting after shutdown, to a released group, or pinned to a worker
    /// that doesn't exist is a fatal error.
    #[track_caller]
    pub fn submit_batch<I>(&self, tasks: I, group: Option<TaskGroup>)
    where
        I: IntoIterator<Item = Task>,
    {
        let mut tasks: SmallVec<[Task; 8]> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return;
        }

        let internal = context::with_worker_of(&self.0, |_| ()).is_some();
        self.0.admit(&mut tasks, group, internal);

        context::with_worker_of(&self.0, |worker| {
            for task in tasks.drain(..) {
                self.0.route(task, Some(worker));
            }
        });

        for task in tasks {
            self.0.route(task, None);
        }
    }

    /// Returns once every task submitted against `group` has completed.
    /// Invalid or released groups count as complete.
    ///
    /// Inside a task of this scheduler only the task is suspended, the worker
    /// thread goes on running other work. Anywhere else the calling thread
    /// blocks.
    pub fn wait_for_group(&self, group: TaskGroup) {
        let Some(state) = self.0.groups.get(group) else {
            return;
        };

        if state.is_done() {
            return;
        }

        if self.in_own_fiber() {
            self.suspend_until_done(group);
        } else {
            self.block_until_done(state, Some(group), None);
        }
    }

    /// Like [`wait_for_group`](Self::wait_for_group) with a bound on how long
    /// the calling thread blocks. Returns whether the group completed.
    ///
    /// Inside a task of this scheduler the wait is unbounded, suspension is
    /// only ever resolved by group completion.
    pub fn wait_for_group_timeout(&self, group: TaskGroup, timeout: Duration) -> bool {
        let Some(state) = self.0.groups.get(group) else {
            return true;
        };

        if state.is_done() {
            return true;
        }

        if self.in_own_fiber() {
            self.suspend_until_done(group);
            true
        } else {
            self.block_until_done(state, Some(group), Some(timeout))
        }
    }

    /// Returns once every task submitted so far, grouped or not, has
    /// completed.
    ///
    /// # Panics
    ///
    /// Calling this from a task of the same scheduler is a fatal error, the
    /// task would wait for itself.
    #[track_caller]
    pub fn wait_all(&self) {
        self.reject_own_worker("wait_all");
        self.block_until_done(&self.0.all, None, None);
    }

    /// Like [`wait_all`](Self::wait_all) with a bound on how long the calling
    /// thread blocks. Returns whether every task completed.
    ///
    /// # Panics
    ///
    /// Same as [`wait_all`](Self::wait_all).
    #[track_caller]
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        self.reject_own_worker("wait_all_timeout");
        self.block_until_done(&self.0.all, None, Some(timeout))
    }

    /// Number of tasks of `group` that have not completed yet, `None` for an
    /// invalid group.
    pub fn group_pending(&self, group: TaskGroup) -> Option<usize> {
        self.0.groups.get(group).map(|state| state.pending())
    }

    /// Number of tasks of `group` that panicked.
    pub fn group_failures(&self, group: TaskGroup) -> Option<usize> {
        self.0.groups.get(group).map(|state| state.failures())
    }

    pub fn worker_count(&self) -> usize {
        self.0.remotes.len()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.0.remotes.iter().map(|r| r.stats.snapshot()).collect()
    }

    #[track_caller]
    fn reject_own_worker(&self, op: &str) {
        if context::with_worker_of(&self.0, |_| ()).is_some() {
            fatal(format!("{op} called from a worker of the same scheduler"));
        }
    }

    fn in_own_fiber(&self) -> bool {
        fiber::is_in_fiber() && context::with_worker_of(&self.0, |_| ()).is_some()
    }

    fn suspend_until_done(&self, group: TaskGroup) {
        self.0.listen(|l| l.on_wait_started(Some(group)));

        // A wake-up only means the counter reached zero at some point, the
        // group may have been refilled since.
        while self.0.groups.get(group).is_some_and(|state| !state.is_done()) {
            fiber::suspend(FiberSignal::Wait(group));
        }

        self.0.listen(|l| l.on_wait_finished(Some(group)));
    }

    /// `group` is `None` for the implicit all-tasks group.
    fn block_until_done(
        &self,
        state: &GroupState<Fiber>,
        group: Option<TaskGroup>,
        timeout: Option<Duration>,
    ) -> bool {
        self.0.listen(|l| l.on_wait_started(group));
        let done = Self::block_on(state, timeout);
        self.0.listen(|l| l.on_wait_finished(group));
        done
    }

    fn block_on(state: &GroupState<Fiber>, timeout: Option<Duration>) -> bool {
        // A deadline `Instant` cannot represent is no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let event = Arc::new(Event::new(ResetMode::Manual));

        loop {
            if !state.register_thread(&event) {
                return true;
            }

            let signaled = match deadline {
                None => {
                    event.wait();
                    true
                }
                Some(deadline) => {
                    event.wait_timeout(deadline.saturating_duration_since(Instant::now()))
                }
            };

            if !signaled {
                state.remove_thread(&event);
                return state.is_done();
            }

            if state.is_done() {
                return true;
            }

            event.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Shared: Send, Sync);
    assert_impl_all!(Handle: Send, Sync, Clone);
    assert_impl_all!(Scheduler: Send, Sync);
}
