//! Low-level synchronization primitives used to coordinate workers, fibers and
//! threads that block outside the scheduler.
//!
//! None of these may be held across a fiber suspension point: a suspended
//! fiber can resume on a different OS thread.

pub mod backend;
pub use backend::{CondvarEvent, DefaultRawEvent, RawEvent};

#[cfg(target_os = "linux")]
pub use backend::FutexEvent;

pub mod event;
pub use event::{Event, ResetMode};

pub mod mutex;
pub use mutex::{RecursiveMutex, RecursiveMutexGuard};
