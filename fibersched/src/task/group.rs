//! Task groups: counted barriers over a set of tasks.
//!
//! A group's counter is incremented before its tasks are enqueued and
//! decremented once per completion. The completion that brings it to zero
//! drains the waiter registry. Waiters register under the same lock and only
//! while the counter is non-zero, so a wake-up cannot be lost between a
//! waiter's check and its registration.

use crate::error::fatal;
use crate::sync::Event;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Opaque handle to a group created with
/// [`Handle::create_group`](crate::Handle::create_group).
///
/// Handles are generation-checked: once a group is released, old copies of
/// its handle refer to nothing, even after the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskGroup {
    index: u32,
    generation: u32,
}

impl fmt::Display for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Parties parked on a group.
pub(crate) struct Waiters<P> {
    /// Suspended fibers, moved back to a ready queue on completion.
    pub(crate) fibers: Vec<P>,

    /// Threads with no fiber to suspend, blocked on a manual-reset event.
    pub(crate) threads: SmallVec<[Arc<Event>; 2]>,
}

impl<P> Default for Waiters<P> {
    fn default() -> Self {
        Self {
            fibers: Vec::new(),
            threads: SmallVec::new(),
        }
    }
}

impl<P> Waiters<P> {
    pub(crate) fn is_empty(&self) -> bool {
        self.fibers.is_empty() && self.threads.is_empty()
    }

    /// Wakes blocked threads and hands back the fibers for rescheduling.
    pub(crate) fn wake_threads(self) -> Vec<P> {
        for event in &self.threads {
            event.signal();
        }
        self.fibers
    }
}

pub(crate) struct GroupState<P> {
    generation: AtomicU32,
    live: AtomicBool,
    pending: AtomicUsize,
    failures: AtomicUsize,
    waiters: Mutex<Waiters<P>>,
}

impl<P> GroupState<P> {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            live: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pending() == 0
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts for `n` tasks about to be enqueued.
    #[track_caller]
    pub(crate) fn add(&self, n: usize) {
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(n))
            .is_err()
        {
            fatal("task group counter overflow");
        }
    }

    /// Accounts for one completed task. Returns the waiters to wake if this
    /// was the last outstanding task.
    #[track_caller]
    pub(crate) fn finish(&self) -> Option<Waiters<P>> {
        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Err(_) => fatal("task group counter underflow: completion without matching submission"),
            Ok(1) => {
                let waiters = mem::take(&mut *self.waiters.lock());
                Some(waiters)
            }
            Ok(_) => None,
        }
    }

    /// Parks `fiber` until the counter reaches zero. Gives it back if the
    /// counter is already zero.
    pub(crate) fn register_fiber(&self, fiber: P) -> Result<(), P> {
        let mut waiters = self.waiters.lock();
        if self.is_done() {
            return Err(fiber);
        }

        waiters.fibers.push(fiber);
        Ok(())
    }

    /// Returns false, without registering, if the counter is already zero.
    pub(crate) fn register_thread(&self, event: &Arc<Event>) -> bool {
        let mut waiters = self.waiters.lock();
        if self.is_done() {
            return false;
        }

        waiters.threads.push(Arc::clone(event));
        true
    }

    pub(crate) fn remove_thread(&self, event: &Arc<Event>) {
        self.waiters
            .lock()
            .threads
            .retain(|e| !Arc::ptr_eq(e, event));
    }

    fn matches(&self, generation: u32) -> bool {
        self.live.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }
}

/// Fixed-capacity table of groups with a free-index stack.
pub(crate) struct GroupTable<P> {
    slots: Box<[GroupState<P>]>,
    free: Mutex<Vec<u32>>,
}

impl<P> GroupTable<P> {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| GroupState::new()).collect(),
            free: Mutex::new((0..capacity).rev().collect()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }

    /// Returns `None` when every slot is taken.
    pub(crate) fn create(&self) -> Option<TaskGroup> {
        let index = self.free.lock().pop()?;
        let state = &self.slots[index as usize];

        debug_assert!(state.is_done());
        debug_assert!(state.waiters.lock().is_empty());

        state.failures.store(0, Ordering::Relaxed);
        state.live.store(true, Ordering::Release);

        Some(TaskGroup {
            index,
            generation: state.generation.load(Ordering::Acquire),
        })
    }

    /// Resolves a handle, `None` if it was released or never created.
    pub(crate) fn get(&self, group: TaskGroup) -> Option<&GroupState<P>> {
        self.slots
            .get(group.index as usize)
            .filter(|state| state.matches(group.generation))
    }

    #[track_caller]
    pub(crate) fn release(&self, group: TaskGroup) {
        let Some(state) = self.get(group) else {
            fatal(format!("release of unknown or already released task group {group}"));
        };

        {
            let waiters = state.waiters.lock();
            let pending = state.pending();
            if pending != 0 || !waiters.is_empty() {
                drop(waiters);
                fatal(format!(
                    "release of task group {group} with {pending} outstanding tasks or parked waiters"
                ));
            }

            state.live.store(false, Ordering::Release);
            state.generation.fetch_add(1, Ordering::AcqRel);
        }

        self.free.lock().push(group.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalError;
    use static_assertions::assert_impl_all;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Barrier;
    use std::thread;

    assert_impl_all!(TaskGroup: Send, Sync, Copy);
    assert_impl_all!(GroupTable<u32>: Send, Sync);

    fn is_fatal_panic(f: impl FnOnce()) -> bool {
        catch_unwind(AssertUnwindSafe(f))
            .err()
            .is_some_and(|p| p.is::<FatalError>())
    }

    #[test]
    fn test_last_finish_drains_waiters() {
        let state = GroupState::<u32>::new();
        state.add(2);

        assert!(state.register_fiber(7).is_ok());
        let event = Arc::new(Event::new(crate::sync::ResetMode::Manual));
        assert!(state.register_thread(&event));

        assert!(state.finish().is_none());
        assert_eq!(state.pending(), 1);

        let waiters = state.finish().unwrap();
        assert!(state.is_done());
        assert_eq!(waiters.fibers, vec![7]);
        assert_eq!(waiters.threads.len(), 1);

        assert_eq!(waiters.wake_threads(), vec![7]);
        assert!(event.is_signaled());
        assert!(state.waiters.lock().is_empty());
    }

    #[test]
    fn test_register_on_done_group_is_refused() {
        let state = GroupState::<u32>::new();
        assert_eq!(state.register_fiber(1), Err(1));

        let event = Arc::new(Event::new(crate::sync::ResetMode::Manual));
        assert!(!state.register_thread(&event));
    }

    #[test]
    fn test_remove_thread() {
        let state = GroupState::<u32>::new();
        state.add(1);

        let a = Arc::new(Event::new(crate::sync::ResetMode::Manual));
        let b = Arc::new(Event::new(crate::sync::ResetMode::Manual));
        assert!(state.register_thread(&a));
        assert!(state.register_thread(&b));

        state.remove_thread(&a);
        let waiters = state.finish().unwrap();
        assert_eq!(waiters.threads.len(), 1);
        assert!(Arc::ptr_eq(&waiters.threads[0], &b));
    }

    #[test]
    fn test_underflow_is_fatal() {
        let state = GroupState::<u32>::new();
        state.add(1);
        assert!(state.finish().is_some());

        assert!(is_fatal_panic(|| {
            state.finish();
        }));
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn test_counter_never_wraps_under_contention() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2_000;

        let state = Arc::new(GroupState::<u32>::new());
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        state.add(1);
                        state.finish();
                    }
                })
            })
            .collect();

        barrier.wait();
        while !workers.iter().all(|w| w.is_finished()) {
            assert!(state.pending() <= THREADS);
        }

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn test_create_get_release() {
        let table = GroupTable::<u32>::new(2);
        assert_eq!(table.capacity(), 2);

        let g = table.create().unwrap();
        assert_eq!(table.in_use(), 1);
        assert!(table.get(g).is_some());

        table.release(g);
        assert!(table.get(g).is_none());
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_reused_slot_rejects_stale_handle() {
        let table = GroupTable::<u32>::new(1);

        let old = table.create().unwrap();
        table.get(old).unwrap().record_failure();
        table.release(old);

        let new = table.create().unwrap();
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new).unwrap().failures(), 0);
    }

    #[test]
    fn test_exhausted_table() {
        let table = GroupTable::<u32>::new(1);
        let _g = table.create().unwrap();
        assert!(table.create().is_none());
    }

    #[test]
    fn test_release_with_pending_tasks_is_fatal() {
        let table = GroupTable::<u32>::new(1);
        let g = table.create().unwrap();
        table.get(g).unwrap().add(1);

        assert!(is_fatal_panic(|| table.release(g)));
        assert!(table.get(g).is_some());
    }

    #[test]
    fn test_double_release_is_fatal() {
        let table = GroupTable::<u32>::new(1);
        let g = table.create().unwrap();
        table.release(g);

        assert!(is_fatal_panic(|| table.release(g)));
    }
}
