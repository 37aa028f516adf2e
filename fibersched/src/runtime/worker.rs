use crate::error::{TaskFailure, fatal, is_fatal, panic_payload_as_str};
use crate::fiber::{Fiber, FiberSignal, FiberState};
use crate::runtime::Runnable;
use crate::runtime::scheduler::Shared;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::sync::{Event, ResetMode};
use crate::task::group::Waiters;
use crate::task::{Affinity, Task, TaskGroup, TaskMeta};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CbWorker};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

/// Counters of one worker, see [`Handle::worker_stats`](crate::Handle::worker_stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks started on this worker.
    pub executed: u64,

    /// Successful steals from other workers.
    pub stolen: u64,

    /// Times a task running here suspended, to wait or to yield.
    pub suspended: u64,

    /// Suspended tasks continued on this worker.
    pub resumed: u64,

    /// Tasks set aside because their fiber pool was exhausted.
    pub deferred: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    executed: AtomicU64,
    stolen: AtomicU64,
    suspended: AtomicU64,
    resumed: AtomicU64,
    deferred: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            executed: self.executed.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

/// The part of a worker other threads can reach.
pub(crate) struct Remote {
    /// Work submitted from outside the scheduler and yielded fibers. Other
    /// workers may steal from it.
    pub(crate) inbox: Injector<Runnable>,

    /// Work that must run on this worker. Never stolen.
    pub(crate) pinned: Injector<Runnable>,

    /// Steal end of the worker's local queue.
    pub(crate) stealer: Stealer<Runnable>,

    pub(crate) wakeup: Event,

    pub(crate) sleeping: AtomicBool,

    pub(crate) stats: StatCounters,
}

impl Remote {
    pub(crate) fn new(stealer: Stealer<Runnable>) -> Self {
        Self {
            inbox: Injector::new(),
            pinned: Injector::new(),
            stealer,
            wakeup: Event::new(ResetMode::Auto),
            sleeping: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    fn has_stealable_work(&self) -> bool {
        !self.stealer.is_empty() || !self.inbox.is_empty()
    }
}

/// Turns ticks into events for the scheduling loop.
#[derive(Debug)]
struct LoopPolicy {
    inbox_interval: u32,
}

impl TickerData for LoopPolicy {
    type Context = Shared;

    #[inline(always)]
    fn check(&self, shared: &Shared, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if shared.is_stopped() {
            return TickerEvents::SHUTDOWN;
        }

        if tick.is_multiple_of(self.inbox_interval) {
            TickerEvents::CHECK_INBOX
        } else {
            TickerEvents::empty()
        }
    }
}

/// Per-thread half of a worker. Lives in the worker thread's context.
pub(crate) struct Worker {
    index: usize,

    shared: Arc<Shared>,

    /// Owner end of the local queue. Tasks submitted by tasks running here
    /// and fibers woken here land on it.
    local: CbWorker<Runnable>,

    /// Other workers, in the order this worker probes them.
    victims: Vec<usize>,

    /// Where the next stealing round starts in `victims`.
    steal_cursor: Cell<usize>,

    ticker: RefCell<Ticker>,

    policy: LoopPolicy,

    /// Whether the next lookup starts with the inbox.
    check_inbox: Cell<bool>,

    /// Tasks that found their fiber pool exhausted. Started before anything
    /// else as soon as a fiber of their class is free.
    deferred: RefCell<VecDeque<Task>>,
}

impl Worker {
    pub(crate) fn new(index: usize, shared: Arc<Shared>, local: CbWorker<Runnable>) -> Self {
        let mut victims = (0..shared.remotes.len())
            .filter(|&i| i != index)
            .collect::<Vec<_>>();

        // Shuffle the victims so that each worker's search order when trying to
        // steal work is different, to reduce contention.
        fastrand::shuffle(&mut victims);

        Self {
            index,
            policy: LoopPolicy {
                inbox_interval: shared.cfg.inbox_interval,
            },
            shared,
            local,
            victims,
            steal_cursor: Cell::new(0),
            ticker: RefCell::new(Ticker::new()),
            check_inbox: Cell::new(false),
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn remote(&self) -> &Remote {
        &self.shared.remotes[self.index]
    }

    fn stats(&self) -> &StatCounters {
        &self.remote().stats
    }

    /// Pushes onto the owner end of the local queue and lets an idle worker
    /// know there is something to steal.
    pub(crate) fn push_local(&self, runnable: Runnable) {
        self.local.push(runnable);

        if self.shared.cfg.stealing_enabled() {
            self.shared.notify_idle(Some(self.index));
        }
    }

    pub(crate) fn run(&self) {
        tracing::debug!(worker = self.index, "worker started");
        self.shared.listen(|l| l.on_thread_started(self.index));

        loop {
            let events = self.ticker.borrow_mut().tick(&*self.shared, &self.policy);

            // Shutdown is only requested once all work completed, nothing is
            // left behind in the queues.
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            }

            if events.contains(TickerEvents::CHECK_INBOX) {
                self.check_inbox.set(true);
            }

            match self.find_runnable() {
                Some(runnable) => self.execute(runnable),
                None => self.idle(),
            }
        }

        tracing::debug!(
            worker = self.index,
            stats = ?self.stats().snapshot(),
            "worker stopped"
        );
        self.shared.listen(|l| l.on_thread_stopped(self.index));
    }

    fn find_runnable(&self) -> Option<Runnable> {
        if let Some(task) = self.pop_deferred() {
            return Some(Runnable::Task(task));
        }

        let remote = self.remote();

        // Enforce fairness for externally submitted work by force-checking
        // the inbox with frequency `inbox_interval`.
        if self.check_inbox.replace(false)
            && let Some(runnable) = steal_now(|| remote.inbox.steal_batch_and_pop(&self.local))
        {
            return Some(runnable);
        }

        steal_now(|| self.shared.high.steal())
            // Recently pushed work first, its data is likely still in cache.
            .or_else(|| self.local.pop())
            .or_else(|| steal_now(|| remote.pinned.steal()))
            .or_else(|| steal_now(|| remote.inbox.steal_batch_and_pop(&self.local)))
            .or_else(|| self.steal_work())
    }

    fn pop_deferred(&self) -> Option<Task> {
        let mut deferred = self.deferred.borrow_mut();
        let class = deferred.front()?.stack_class();

        if self.shared.pool(class).has_capacity() {
            deferred.pop_front()
        } else {
            None
        }
    }

    /// One round over the other workers' local queues and inboxes, starting
    /// one victim further than the previous round.
    fn steal_work(&self) -> Option<Runnable> {
        let n = self.victims.len();
        if n == 0 || !self.shared.cfg.stealing_enabled() {
            return None;
        }

        let start = self.steal_cursor.get();
        self.steal_cursor.set((start + 1) % n);

        let found = iter::repeat_with(|| {
            // The behavior of collect here is to return the first Success(T) so
            // *we are not* iterating through all victims every time.
            (0..n)
                .map(|k| &self.shared.remotes[self.victims[(start + k) % n]])
                .map(|victim| {
                    victim
                        .stealer
                        .steal_batch_and_pop(&self.local)
                        .or_else(|| victim.inbox.steal_batch_and_pop(&self.local))
                })
                .collect::<Steal<_>>()
        })
        .take(self.shared.cfg.max_steal_retries)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success());

        if found.is_some() {
            StatCounters::bump(&self.stats().stolen);
            tracing::trace!(worker = self.index, "stole work");
        }

        found
    }

    /// Sleeps until signaled or `idle_timeout` elapses. The timeout bounds how
    /// long a deferred task waits for a fiber released on another worker.
    fn idle(&self) {
        let remote = self.remote();

        remote.sleeping.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        // Re-check after announcing ourselves, a submitter that pushed before
        // seeing `sleeping` did not signal.
        if !self.has_work() && !self.shared.is_stopped() {
            self.shared.listen(|l| l.on_idle_started(self.index));
            remote.wakeup.wait_timeout(self.shared.cfg.idle_timeout);
            self.shared.listen(|l| l.on_idle_finished(self.index));
        }

        remote.sleeping.store(false, Ordering::SeqCst);
    }

    fn has_work(&self) -> bool {
        let remote = self.remote();

        !self.local.is_empty()
            || !remote.pinned.is_empty()
            || !remote.inbox.is_empty()
            || !self.shared.high.is_empty()
            || (self.shared.cfg.stealing_enabled()
                && self
                    .victims
                    .iter()
                    .any(|&v| self.shared.remotes[v].has_stealable_work()))
    }

    fn execute(&self, runnable: Runnable) {
        match runnable {
            Runnable::Task(task) => self.start(task),
            Runnable::Resume(mut fiber) => {
                let pool = self.shared.pool(fiber.class());
                pool.transition(fiber.id(), FiberState::Suspended, FiberState::Running);

                StatCounters::bump(&self.stats().resumed);
                tracing::trace!(worker = self.index, fiber = %fiber.id(), "resuming fiber");

                let task = fiber.task().map(|t| t.id);
                if let Some(task) = task {
                    self.shared.listen(|l| l.on_task_execute_start(self.index, task));
                }

                let signal = fiber.resume();

                if let Some(task) = task {
                    self.shared.listen(|l| l.on_task_execute_stop(self.index, task));
                }
                self.handle_signal(fiber, signal);
            }
        }
    }

    fn start(&self, task: Task) {
        let class = task.stack_class();
        let mut fiber = match self.shared.pool(class).acquire() {
            Ok(Some(fiber)) => fiber,
            Ok(None) => {
                tracing::warn!(
                    worker = self.index,
                    task = %task.id(),
                    ?class,
                    "fiber pool exhausted, deferring task"
                );
                return self.defer(task);
            }
            Err(err) => {
                tracing::error!(
                    worker = self.index,
                    task = %task.id(),
                    error = %err,
                    "failed to allocate fiber, deferring task"
                );
                return self.defer(task);
            }
        };

        StatCounters::bump(&self.stats().executed);

        let id = task.id();
        self.shared.listen(|l| l.on_task_execute_start(self.index, id));
        let signal = fiber.run(task);
        self.shared.listen(|l| l.on_task_execute_stop(self.index, id));

        self.handle_signal(fiber, signal);
    }

    fn defer(&self, task: Task) {
        StatCounters::bump(&self.stats().deferred);
        self.deferred.borrow_mut().push_back(task);
    }

    fn handle_signal(&self, mut fiber: Fiber, signal: FiberSignal) {
        let pool = self.shared.pool(fiber.class());

        match signal {
            FiberSignal::Finished(outcome) => {
                pool.transition(fiber.id(), FiberState::Running, FiberState::Finished);

                let Some(meta) = fiber.take_task() else {
                    fatal(format!("fiber {} finished without a task", fiber.id()));
                };

                pool.release(fiber);
                self.complete(meta, outcome);
            }
            FiberSignal::Yield => {
                pool.transition(fiber.id(), FiberState::Running, FiberState::Suspended);
                StatCounters::bump(&self.stats().suspended);

                // Behind everything this worker already has.
                let remote = self.remote();
                match fiber.task().map(|t| t.affinity) {
                    Some(Affinity::Worker(_)) => remote.pinned.push(Runnable::Resume(fiber)),
                    _ => remote.inbox.push(Runnable::Resume(fiber)),
                }
            }
            FiberSignal::Wait(group) => {
                pool.transition(fiber.id(), FiberState::Running, FiberState::Suspended);
                StatCounters::bump(&self.stats().suspended);
                self.park(fiber, group);
            }
        }
    }

    /// Hands a suspended fiber to the group's waiter registry. The fiber
    /// switched out before registering, so whoever completes the group can
    /// resume it right away.
    fn park(&self, fiber: Fiber, group: TaskGroup) {
        let id = fiber.id();

        let rejected = match self.shared.groups.get(group) {
            Some(state) => state.register_fiber(fiber).err(),
            None => Some(fiber),
        };

        match rejected {
            // Completed between the task's check and the registration.
            Some(fiber) => self.reschedule(fiber),
            None => tracing::trace!(worker = self.index, fiber = %id, %group, "fiber parked"),
        }
    }

    /// Makes a woken fiber runnable. Pinned fibers go back to their worker,
    /// others to this worker's local queue where idle workers may steal them.
    fn reschedule(&self, fiber: Fiber) {
        match fiber.task().map(|t| t.affinity) {
            Some(Affinity::Worker(index)) => {
                self.shared.remotes[index].pinned.push(Runnable::Resume(fiber));
                self.shared.notify(index);
            }
            _ => self.push_local(Runnable::Resume(fiber)),
        }
    }

    fn complete(&self, meta: TaskMeta, outcome: Result<(), Box<dyn Any + Send>>) {
        if let Err(payload) = outcome {
            self.report_failure(&meta, payload);
        }

        // The task's own group first, so `wait_all` returning implies every
        // group is settled.
        if let Some(group) = meta.group {
            let Some(state) = self.shared.groups.get(group) else {
                fatal(format!("task {} completed after its group {group} was released", meta.id));
            };

            if let Some(waiters) = state.finish() {
                self.wake(waiters);
            }
        }

        if let Some(waiters) = self.shared.all.finish() {
            self.wake(waiters);
        }
    }

    fn wake(&self, waiters: Waiters<Fiber>) {
        for fiber in waiters.wake_threads() {
            self.reschedule(fiber);
        }
    }

    fn report_failure(&self, meta: &TaskMeta, payload: Box<dyn Any + Send>) {
        if is_fatal(&payload) {
            tracing::error!(
                worker = self.index,
                task = %meta.id,
                message = panic_payload_as_str(&payload),
                "contract violation inside task, aborting"
            );
            std::process::abort();
        }

        let failure = TaskFailure {
            task: meta.id,
            group: meta.group,
            worker: self.index,
            message: panic_payload_as_str(&payload)
                .unwrap_or("non-string panic payload")
                .to_string(),
        };

        tracing::error!(%failure, "task panicked");

        if let Some(state) = meta.group.and_then(|g| self.shared.groups.get(g)) {
            state.record_failure();
        }

        if let Some(hook) = &self.shared.cfg.on_task_failure
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (hook.0)(&failure)))
        {
            tracing::error!(
                worker = self.index,
                message = panic_payload_as_str(&payload),
                "task failure hook panicked"
            );
        }
    }
}

/// Retries a steal operation until it gives a definite answer.
fn steal_now<T>(mut f: impl FnMut() -> Steal<T>) -> Option<T> {
    iter::repeat_with(&mut f)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
}
