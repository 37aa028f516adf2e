use super::{Fiber, FiberError, FiberId, FiberState};
use crate::error::fatal;
use crate::task::StackClass;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

struct FiberSlot {
    generation: AtomicU32,
    state: AtomicU8,
}

/// Fixed-capacity arena of fibers of one stack class.
///
/// Every slot carries a generation counter bumped on release, so a stale
/// [`FiberId`] kept after its fiber went back to the pool is detected on the
/// next state transition. Fibers are created lazily up to `capacity` and are
/// never freed before the pool is dropped.
pub(crate) struct FiberPool {
    class: StackClass,
    stack_size: usize,
    slots: Box<[FiberSlot]>,
    idle: ArrayQueue<Fiber>,

    // Guards growth only. Allocating a stack is a syscall, the lock is never
    // taken on the fast path.
    allocated: Mutex<u32>,
}

impl FiberPool {
    pub(crate) fn new(class: StackClass, stack_size: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "fiber pool capacity must be greater than 0");
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX) as usize;

        Self {
            class,
            stack_size,
            slots: (0..capacity)
                .map(|_| FiberSlot {
                    generation: AtomicU32::new(0),
                    state: AtomicU8::new(FiberState::Idle as u8),
                })
                .collect(),
            idle: ArrayQueue::new(capacity),
            allocated: Mutex::new(0),
        }
    }

    /// Creates `count` idle fibers up front.
    pub(crate) fn prealloc(&self, count: usize) -> Result<(), FiberError> {
        for _ in 0..count.min(self.capacity()) {
            match self.grow()? {
                Some(fiber) => self.push_idle(fiber),
                None => break,
            }
        }

        Ok(())
    }

    /// Hands out an idle fiber in the `Running` state, creating one if the
    /// pool is below capacity. `Ok(None)` means the pool is exhausted.
    pub(crate) fn acquire(&self) -> Result<Option<Fiber>, FiberError> {
        let fiber = match self.idle.pop() {
            Some(fiber) => fiber,
            None => match self.grow()? {
                Some(fiber) => fiber,
                None => return Ok(None),
            },
        };

        self.transition(fiber.id(), FiberState::Idle, FiberState::Running);
        Ok(Some(fiber))
    }

    /// Takes back a fiber in the `Finished` state.
    #[track_caller]
    pub(crate) fn release(&self, mut fiber: Fiber) {
        if let Some(task) = fiber.task() {
            fatal(format!("release of fiber {} still bound to task {}", fiber.id(), task.id));
        }

        let id = fiber.id();
        let slot = self.slot(id);
        let generation = slot.generation.load(Ordering::Acquire).wrapping_add(1);

        self.transition(id, FiberState::Finished, FiberState::Idle);
        slot.generation.store(generation, Ordering::Release);

        fiber.set_generation(generation);
        self.push_idle(fiber);
    }

    /// Moves the fiber `id` from `from` to `to`. A stale id or a state other
    /// than `from` is a fatal bookkeeping error, such as a fiber resumed
    /// twice.
    #[track_caller]
    pub(crate) fn transition(&self, id: FiberId, from: FiberState, to: FiberState) {
        let slot = self.slot(id);

        let generation = slot.generation.load(Ordering::Acquire);
        if generation != id.generation {
            fatal(format!(
                "stale {:?} fiber handle {id}, slot is at generation {generation}",
                self.class
            ));
        }

        if let Err(actual) =
            slot.state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            fatal(format!(
                "{:?} fiber {id} expected {from:?} -> {to:?}, found {:?}",
                self.class,
                FiberState::from_u8(actual)
            ));
        }
    }

    /// Returns `None` for a stale handle.
    #[cfg(test)]
    pub(crate) fn state(&self, id: FiberId) -> Option<FiberState> {
        let slot = self.slots.get(id.slot as usize)?;
        (slot.generation.load(Ordering::Acquire) == id.generation)
            .then(|| FiberState::from_u8(slot.state.load(Ordering::Acquire)))
    }

    pub(crate) fn class(&self) -> StackClass {
        self.class
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn allocated(&self) -> usize {
        *self.allocated.lock() as usize
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Whether `acquire` can currently succeed. Another thread may take the
    /// fiber first.
    pub(crate) fn has_capacity(&self) -> bool {
        !self.idle.is_empty() || self.allocated() < self.capacity()
    }

    fn grow(&self) -> Result<Option<Fiber>, FiberError> {
        let mut allocated = self.allocated.lock();
        if *allocated as usize >= self.capacity() {
            return Ok(None);
        }

        let fiber = Fiber::new(*allocated, self.class, self.stack_size)?;
        *allocated += 1;

        tracing::trace!(class = ?self.class, fiber = %fiber.id(), "allocated fiber");
        Ok(Some(fiber))
    }

    fn push_idle(&self, fiber: Fiber) {
        if let Err(fiber) = self.idle.push(fiber) {
            fatal(format!("{:?} fiber pool overflow on {}", self.class, fiber.id()));
        }
    }

    #[track_caller]
    fn slot(&self, id: FiberId) -> &FiberSlot {
        self.slots
            .get(id.slot as usize)
            .unwrap_or_else(|| fatal(format!("fiber slot {} out of range", id.slot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{FiberSignal, MIN_STACK_SIZE};
    use crate::task::Task;
    use static_assertions::assert_impl_all;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    assert_impl_all!(FiberPool: Send, Sync);

    fn pool(capacity: usize) -> FiberPool {
        FiberPool::new(StackClass::Standard, MIN_STACK_SIZE, capacity)
    }

    fn run_to_completion(pool: &FiberPool, mut fiber: Fiber) {
        assert!(matches!(fiber.run(Task::new(|| {})), FiberSignal::Finished(Ok(()))));
        fiber.take_task();
        pool.transition(fiber.id(), FiberState::Running, FiberState::Finished);
        pool.release(fiber);
    }

    #[test]
    fn test_prealloc() -> anyhow::Result<()> {
        let pool = pool(8);
        pool.prealloc(3)?;

        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.idle(), 3);
        assert_eq!(pool.capacity(), 8);
        Ok(())
    }

    #[test]
    fn test_growth_is_bounded() -> anyhow::Result<()> {
        let pool = pool(2);

        let a = pool.acquire()?.unwrap();
        let b = pool.acquire()?.unwrap();
        assert!(!pool.has_capacity());
        assert!(pool.acquire()?.is_none());
        assert_eq!(pool.allocated(), 2);

        run_to_completion(&pool, a);
        assert!(pool.has_capacity());
        let c = pool.acquire()?.unwrap();
        assert_eq!(pool.allocated(), 2);

        run_to_completion(&pool, b);
        run_to_completion(&pool, c);
        assert_eq!(pool.idle(), 2);
        Ok(())
    }

    #[test]
    fn test_release_bumps_generation() -> anyhow::Result<()> {
        let pool = pool(1);

        let fiber = pool.acquire()?.unwrap();
        let old = fiber.id();
        assert_eq!(pool.state(old), Some(FiberState::Running));

        run_to_completion(&pool, fiber);
        assert_eq!(pool.state(old), None);

        let fiber = pool.acquire()?.unwrap();
        assert_eq!(fiber.id().slot, old.slot);
        assert_eq!(fiber.id().generation, old.generation + 1);
        run_to_completion(&pool, fiber);
        Ok(())
    }

    #[test]
    fn test_stale_handle_is_fatal() -> anyhow::Result<()> {
        let pool = pool(1);
        let fiber = pool.acquire()?.unwrap();
        let stale = fiber.id();
        run_to_completion(&pool, fiber);

        let payload = catch_unwind(AssertUnwindSafe(|| {
            pool.transition(stale, FiberState::Suspended, FiberState::Running)
        }))
        .unwrap_err();
        assert!(crate::error::is_fatal(&payload));
        Ok(())
    }

    #[test]
    fn test_double_resume_is_fatal() -> anyhow::Result<()> {
        let pool = pool(1);
        let fiber = pool.acquire()?.unwrap();
        let id = fiber.id();

        pool.transition(id, FiberState::Running, FiberState::Suspended);
        pool.transition(id, FiberState::Suspended, FiberState::Running);

        let payload = catch_unwind(AssertUnwindSafe(|| {
            pool.transition(id, FiberState::Suspended, FiberState::Running)
        }))
        .unwrap_err();
        assert!(crate::error::is_fatal(&payload));
        Ok(())
    }

    #[test]
    fn test_stack_below_minimum_fails_growth() {
        let pool = FiberPool::new(StackClass::Standard, 1024, 1);
        assert!(matches!(
            pool.acquire(),
            Err(FiberError::StackTooSmall { .. })
        ));
        assert_eq!(pool.allocated(), 0);
    }
}
