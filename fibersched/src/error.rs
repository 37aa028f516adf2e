use crate::fiber::FiberError;
use crate::task::{TaskGroup, TaskId};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::Location;

/// Errors surfaced while building a [`Scheduler`] or creating task groups.
///
/// [`Scheduler`]: crate::Scheduler
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread {index}")]
    SpawnWorker {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to pre-allocate fiber pool")]
    FiberPool(#[from] FiberError),

    #[error("all {capacity} task groups are in use")]
    GroupsExhausted { capacity: usize },
}

/// A task panicked. The failure is caught at the task boundary, so the worker
/// keeps running and the group counter is still decremented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: TaskId,
    pub group: Option<TaskGroup>,
    pub worker: usize,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} failed on worker {}: {}",
            self.task, self.worker, self.message
        )
    }
}

/// Panic payload used for contract violations. These are programmer errors
/// the scheduler cannot recover from, such as a group counter underflow or a
/// fiber resumed twice.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub message: String,
    pub location: &'static Location<'static>,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal scheduler error at {}: {}", self.location, self.message)
    }
}

/// Raise a contract violation. Inside a task this aborts the process instead
/// of being reported as an ordinary task failure.
#[cold]
#[track_caller]
pub(crate) fn fatal(message: impl Into<String>) -> ! {
    let err = FatalError {
        message: message.into(),
        location: Location::caller(),
    };

    tracing::error!(%err, "contract violation");
    std::panic::panic_any(err)
}

pub(crate) fn panic_payload_as_str(payload: &Box<dyn Any + Send>) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Some(s.as_str())
    } else {
        payload
            .downcast_ref::<FatalError>()
            .map(|err| err.message.as_str())
    }
}

pub(crate) fn is_fatal(payload: &Box<dyn Any + Send>) -> bool {
    payload.is::<FatalError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_fatal_payload_is_downcastable() {
        let payload = catch_unwind(|| -> () { fatal("counter underflow") }).unwrap_err();

        assert!(is_fatal(&payload));
        assert_eq!(panic_payload_as_str(&payload), Some("counter underflow"));

        let err = payload.downcast_ref::<FatalError>().unwrap();
        assert!(err.location.file().ends_with("error.rs"));
    }

    #[test]
    fn test_payload_as_str() {
        let payload = catch_unwind(|| -> () { panic!("boom {}", 42) }).unwrap_err();
        assert!(!is_fatal(&payload));
        assert_eq!(panic_payload_as_str(&payload), Some("boom 42"));

        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_payload_as_str(&payload), None);
    }
}
