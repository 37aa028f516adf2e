use crate::fiber;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task for the lifetime of the
/// process.
///
/// IDs are handed out when a [`Task`](crate::Task) is created, not when it is
/// submitted, so they do not indicate execution order.
///
/// The ID of the running task can be obtained from inside the task via
/// [`task::try_id()`](crate::task::try_id()) and
/// [`task::id()`](crate::task::id()).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(pub(crate) NonZeroU64);

/// Returns the [`TaskId`] of the currently running task.
///
/// # Panics
///
/// This function panics if called from outside a task. For a version that
/// doesn't panic, see [`task::try_id()`](crate::task::try_id()).
#[track_caller]
pub fn id() -> TaskId {
    try_id().expect("Can't get a task id when not inside a task")
}

/// Returns the [`TaskId`] of the currently running task, or `None` if called
/// outside of a task.
pub fn try_id() -> Option<TaskId> {
    fiber::current_task_id()
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Creating 1 billion tasks/sec, it would take 584 years to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_new_task_id_unique() {
        let n = 13;
        let mut all_ids = HashSet::with_capacity(n);

        for _ in 1..=n {
            all_ids.insert(TaskId::next());
        }

        assert_eq!(all_ids.len(), n);
    }

    #[test]
    fn test_task_id_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..100).map(|_| TaskId::next()).collect::<Vec<_>>()))
            .collect();

        let all: HashSet<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(all.len(), 400);
    }

    #[test]
    fn test_no_id_outside_task() {
        assert_eq!(try_id(), None);
    }
}
