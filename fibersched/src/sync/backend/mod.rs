use crate::sync::ResetMode;
use std::time::Duration;

mod condvar;
pub use condvar::CondvarEvent;

#[cfg(target_os = "linux")]
mod futex;
#[cfg(target_os = "linux")]
pub use futex::FutexEvent;

/// Native event implementation for the current target.
#[cfg(target_os = "linux")]
pub type DefaultRawEvent = FutexEvent;

#[cfg(not(target_os = "linux"))]
pub type DefaultRawEvent = CondvarEvent;

/// Platform backend for [`Event`](crate::sync::Event).
///
/// Implementations own the signaled flag and the reset policy. Waking one or
/// all waiters on `signal` is decided by `mode`.
pub trait RawEvent: Send + Sync + Sized {
    fn new(mode: ResetMode, signaled: bool) -> Self;

    fn signal(&self);

    fn reset(&self);

    /// Blocks until signaled or until `timeout` elapses. Returns `false` on
    /// timeout. An automatic-reset event is consumed by the waiter it releases.
    fn wait(&self, timeout: Option<Duration>) -> bool;

    fn is_signaled(&self) -> bool;
}
