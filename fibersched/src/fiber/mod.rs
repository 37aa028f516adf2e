//! Scheduler fibers.
//!
//! A [`Fiber`] is a pooled stackful context running a loop: receive a task,
//! run it to completion under `catch_unwind`, report back, wait for the next
//! task. While a task runs it may [`suspend`] the fiber, for instance to wait
//! on a group. The worker that resumes it later may be a different OS thread.

pub mod context;
pub use context::{FiberContext, FiberError, FiberStack, MIN_STACK_SIZE, Suspender, Switch};

pub(crate) mod pool;

use crate::error::fatal;
use crate::task::{StackClass, Task, TaskGroup, TaskId, TaskMeta};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

/// Slot index in the owning pool plus the generation the slot had when this
/// fiber was handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    Idle = 0,
    Running = 1,
    Suspended = 2,
    Finished = 3,
}

impl FiberState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Idle,
            1 => FiberState::Running,
            2 => FiberState::Suspended,
            3 => FiberState::Finished,
            _ => unreachable!("invalid fiber state {v}"),
        }
    }
}

/// Value passed into a fiber when switching to it.
pub(crate) enum FiberInput {
    Run(Task),
    Resume,
    Exit,
}

/// Value a fiber hands back to its worker when it switches out.
pub(crate) enum FiberSignal {
    /// The bound task returned, or panicked with the given payload.
    Finished(Result<(), Box<dyn Any + Send>>),

    /// Park until the group's counter reaches zero.
    Wait(TaskGroup),

    /// Requeue behind other ready work.
    Yield,
}

impl fmt::Debug for FiberSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberSignal::Finished(Ok(())) => f.write_str("Finished(Ok)"),
            FiberSignal::Finished(Err(_)) => f.write_str("Finished(Panicked)"),
            FiberSignal::Wait(group) => write!(f, "Wait({group})"),
            FiberSignal::Yield => f.write_str("Yield"),
        }
    }
}

type SchedContext = FiberContext<FiberInput, FiberSignal, ()>;
type SchedSuspender = Suspender<FiberInput, FiberSignal>;

pub struct Fiber {
    id: FiberId,
    class: StackClass,
    context: ManuallyDrop<SchedContext>,
    task: Option<TaskMeta>,

    /// Send but not Sync: the context may only be touched by its holder.
    _not_sync: PhantomData<Cell<()>>,
}

// Safety: a fiber is only ever switched to by the single worker holding it,
// and the scheduler hands the value from one worker to the next through its
// queues. Thread-local state the task sees is re-read after every switch.
unsafe impl Send for Fiber {}

impl Fiber {
    pub(crate) fn new(slot: u32, class: StackClass, stack_size: usize) -> Result<Self, FiberError> {
        let stack = FiberStack::new(stack_size)?;

        Ok(Self {
            id: FiberId {
                slot,
                generation: 0,
            },
            class,
            context: ManuallyDrop::new(FiberContext::new(stack, fiber_main)),
            task: None,
            _not_sync: PhantomData,
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn class(&self) -> StackClass {
        self.class
    }

    pub(crate) fn set_generation(&mut self, generation: u32) {
        self.id.generation = generation;
    }

    pub(crate) fn task(&self) -> Option<&TaskMeta> {
        self.task.as_ref()
    }

    /// Unbinds the task after the fiber reported `Finished`.
    pub(crate) fn take_task(&mut self) -> Option<TaskMeta> {
        self.task.take()
    }

    /// Binds `task` and runs it until it finishes or suspends.
    #[track_caller]
    pub(crate) fn run(&mut self, task: Task) -> FiberSignal {
        if let Some(bound) = &self.task {
            fatal(format!("fiber {} is still bound to task {}", self.id, bound.id));
        }

        self.task = Some(task.meta);
        self.switch(FiberInput::Run(task))
    }

    /// Continues the bound task after a suspension.
    #[track_caller]
    pub(crate) fn resume(&mut self) -> FiberSignal {
        if self.task.is_none() {
            fatal(format!("resume of fiber {} with no bound task", self.id));
        }

        self.switch(FiberInput::Resume)
    }

    #[track_caller]
    fn switch(&mut self, input: FiberInput) -> FiberSignal {
        match self.context.switch_to(input) {
            Switch::Suspended(signal) => signal,
            Switch::Returned(()) => fatal(format!("fiber {} exited while bound to a task", self.id)),
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            // Unwinding a parked task's stack from here would run its
            // destructors on whatever thread drops the fiber.
            tracing::warn!(fiber = %self.id, task = %task.id, "leaking stack of suspended fiber");
            return;
        }

        if self.context.is_started() && !self.context.is_finished() {
            let _ = self.context.switch_to(FiberInput::Exit);
        }

        // Safety: not used again after this point.
        unsafe { ManuallyDrop::drop(&mut self.context) };
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("task", &self.task.map(|t| t.id))
            .finish()
    }
}

fn fiber_main(suspender: &SchedSuspender, mut input: FiberInput) {
    loop {
        let task = match input {
            FiberInput::Run(task) => task,
            FiberInput::Exit => return,
            FiberInput::Resume => fatal("resume of an idle fiber"),
        };

        let (meta, func) = task.into_parts();
        let outcome = {
            let _current = CurrentGuard::enter(suspender, meta.id);
            panic::catch_unwind(AssertUnwindSafe(func))
        };

        input = suspender.switch_back(FiberSignal::Finished(outcome));
    }
}

#[derive(Clone, Copy)]
struct Current {
    suspender: NonNull<SchedSuspender>,
    task: TaskId,
}

thread_local! {
    static CURRENT: Cell<Option<Current>> = const { Cell::new(None) };
}

// Never inlined: a fiber may resume on another thread, and a thread-local
// address computed before the switch must not be reused after it.
#[inline(never)]
fn current() -> Option<Current> {
    CURRENT.with(|c| c.get())
}

#[inline(never)]
fn set_current(value: Option<Current>) -> Option<Current> {
    CURRENT.with(|c| c.replace(value))
}

struct CurrentGuard;

impl CurrentGuard {
    fn enter(suspender: &SchedSuspender, task: TaskId) -> Self {
        set_current(Some(Current {
            suspender: NonNull::from(suspender),
            task,
        }));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        set_current(None);
    }
}

/// Returns true when called from a task running on a scheduler fiber.
pub fn is_in_fiber() -> bool {
    current().is_some()
}

pub(crate) fn current_task_id() -> Option<TaskId> {
    current().map(|c| c.task)
}

/// Switches from the running task back to its worker, handing it `signal`.
/// Returns once some worker switches into the fiber again.
#[track_caller]
pub(crate) fn suspend(signal: FiberSignal) {
    let Some(current) = set_current(None) else {
        fatal("fiber suspension outside of a fiber");
    };

    // Safety: the suspender lives in `fiber_main`'s frame, which outlives
    // the task running on top of it.
    let input = unsafe { current.suspender.as_ref() }.switch_back(signal);
    set_current(Some(current));

    if !matches!(input, FiberInput::Resume) {
        fatal(format!("suspended task {} woken without a resume", current.task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    assert_impl_all!(Fiber: Send);
    assert_not_impl_any!(Fiber: Sync);

    fn fiber() -> Fiber {
        Fiber::new(0, StackClass::Standard, 64 * 1024).unwrap()
    }

    #[test]
    fn test_fiber_runs_many_tasks() {
        let mut fiber = fiber();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let hits = Arc::clone(&hits);
            let task = Task::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });

            let id = task.id();
            assert!(matches!(fiber.run(task), FiberSignal::Finished(Ok(()))));
            assert_eq!(fiber.take_task().map(|m| m.id), Some(id));
        }

        assert_eq!(hits.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_panicking_task_keeps_fiber_usable() {
        let mut fiber = fiber();

        let signal = fiber.run(Task::new(|| panic!("task failed")));
        let FiberSignal::Finished(Err(payload)) = signal else {
            panic!("expected a panicked outcome, got {signal:?}");
        };
        assert_eq!(crate::error::panic_payload_as_str(&payload), Some("task failed"));
        fiber.take_task();

        assert!(matches!(fiber.run(Task::new(|| {})), FiberSignal::Finished(Ok(()))));
    }

    #[test]
    fn test_current_task_visible_inside_fiber_only() {
        let mut fiber = fiber();
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let task = {
            let seen = Arc::clone(&seen);
            Task::new(move || *seen.lock() = Some((is_in_fiber(), current_task_id())))
        };
        let id = task.id();

        assert!(!is_in_fiber());
        assert!(matches!(fiber.run(task), FiberSignal::Finished(Ok(()))));
        fiber.take_task();
        assert!(!is_in_fiber());
        assert_eq!(current_task_id(), None);
        assert_eq!(*seen.lock(), Some((true, Some(id))));
    }

    #[test]
    fn test_suspend_and_resume_on_another_thread() {
        let mut fiber = fiber();
        let task = Task::new(|| {
            let before = thread::current().id();
            let id = current_task_id();
            suspend(FiberSignal::Yield);

            assert_ne!(thread::current().id(), before);
            assert_eq!(current_task_id(), id);
        });

        assert!(matches!(fiber.run(task), FiberSignal::Yield));
        assert!(fiber.task().is_some());

        let (signal, mut fiber) = thread::spawn(move || (fiber.resume(), fiber))
            .join()
            .unwrap();

        assert!(matches!(signal, FiberSignal::Finished(Ok(()))));
        assert!(fiber.take_task().is_some());
        assert!(!is_in_fiber());
    }

    #[test]
    fn test_suspend_outside_fiber_is_fatal() {
        let payload = panic::catch_unwind(|| suspend(FiberSignal::Yield)).unwrap_err();
        assert!(crate::error::is_fatal(&payload));
    }

    #[test]
    fn test_fiber_state_roundtrip() {
        for state in [
            FiberState::Idle,
            FiberState::Running,
            FiberState::Suspended,
            FiberState::Finished,
        ] {
            assert_eq!(FiberState::from_u8(state as u8), state);
        }
    }
}
