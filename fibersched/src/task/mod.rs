//! Units of work accepted by the scheduler.

mod id;
pub use id::{TaskId, id, try_id};

pub(crate) mod group;
pub use group::TaskGroup;

use std::fmt;

/// Which workers may run a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Any worker, and the task may be stolen before it starts.
    #[default]
    Any,

    /// Only the worker with this index. Pinned tasks are never stolen, and a
    /// pinned fiber resumes on the same worker after a wait.
    Worker(usize),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Checked by every worker before its own queues.
    High,

    #[default]
    Normal,
}

/// Selects the fiber pool, and so the stack size, a task runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StackClass {
    #[default]
    Standard,

    /// For tasks with deep call chains or large stack frames.
    Extended,
}

impl StackClass {
    pub(crate) const ALL: [StackClass; 2] = [StackClass::Standard, StackClass::Extended];

    pub(crate) fn index(self) -> usize {
        match self {
            StackClass::Standard => 0,
            StackClass::Extended => 1,
        }
    }
}

/// Everything the scheduler tracks about a task besides its closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TaskMeta {
    pub(crate) id: TaskId,
    pub(crate) group: Option<TaskGroup>,
    pub(crate) affinity: Affinity,
    pub(crate) priority: Priority,
    pub(crate) stack: StackClass,
}

/// A closure plus its scheduling hints. A task is executed at most once, by
/// exactly one worker.
pub struct Task {
    pub(crate) meta: TaskMeta,
    func: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        TaskBuilder::new().build(func)
    }

    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    pub fn id(&self) -> TaskId {
        self.meta.id
    }

    pub fn affinity(&self) -> Affinity {
        self.meta.affinity
    }

    pub fn priority(&self) -> Priority {
        self.meta.priority
    }

    pub fn stack_class(&self) -> StackClass {
        self.meta.stack
    }

    pub(crate) fn into_parts(self) -> (TaskMeta, Box<dyn FnOnce() + Send + 'static>) {
        (self.meta, self.func)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("meta", &self.meta).finish_non_exhaustive()
    }
}

/// Builds [`Task`]s that carry non-default scheduling hints.
///
/// ```ignore
/// let task = Task::builder()
///     .pinned_to(0)
///     .priority(Priority::High)
///     .build(|| println!("hello from worker 0"));
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskBuilder {
    affinity: Affinity,
    priority: Priority,
    stack: StackClass,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn pinned_to(self, worker: usize) -> Self {
        self.affinity(Affinity::Worker(worker))
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_class(mut self, stack: StackClass) -> Self {
        self.stack = stack;
        self
    }

    pub fn build<F>(self, func: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            meta: TaskMeta {
                id: TaskId::next(),
                group: None,
                affinity: self.affinity,
                priority: self.priority,
                stack: self.stack,
            },
            func: Box::new(func),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(Task: Send);
    assert_impl_all!(TaskId: Send, Sync, Copy);
    assert_impl_all!(TaskBuilder: Send, Sync, Copy);

    #[test]
    fn test_default_hints() {
        let task = Task::new(|| {});
        assert_eq!(task.affinity(), Affinity::Any);
        assert_eq!(task.priority(), Priority::Normal);
        assert_eq!(task.stack_class(), StackClass::Standard);
        assert_eq!(task.meta.group, None);
    }

    #[test]
    fn test_builder_hints() {
        let task = Task::builder()
            .pinned_to(3)
            .priority(Priority::High)
            .stack_class(StackClass::Extended)
            .build(|| {});

        assert_eq!(task.affinity(), Affinity::Worker(3));
        assert_eq!(task.priority(), Priority::High);
        assert_eq!(task.stack_class(), StackClass::Extended);
    }

    #[test]
    fn test_builder_reuse_gives_distinct_ids() {
        let builder = Task::builder().priority(Priority::High);
        let a = builder.build(|| {});
        let b = builder.build(|| {});
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_into_parts_runs_closure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let task = {
            let hits = Arc::clone(&hits);
            Task::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        };

        let id = task.id();
        let (meta, func) = task.into_parts();
        assert_eq!(meta.id, id);

        func();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stack_class_index() {
        for (i, class) in StackClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }
}
