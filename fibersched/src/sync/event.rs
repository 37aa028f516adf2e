use crate::sync::{DefaultRawEvent, RawEvent};
use std::fmt;
use std::time::Duration;

/// How an [`Event`] behaves once a waiter has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Stays signaled, releasing every waiter, until [`Event::reset`].
    Manual,

    /// Reverts to not-signaled as soon as one waiter is released.
    Auto,
}

/// Binary signaled/not-signaled flag that threads can block on.
///
/// Blocks the calling OS thread, so inside a task prefer waiting on a task
/// group: that suspends the fiber only.
pub struct Event<B: RawEvent = DefaultRawEvent> {
    raw: B,
    mode: ResetMode,
}

impl Event {
    pub fn new(mode: ResetMode) -> Self {
        Self::with_backend(mode, false)
    }

    pub fn new_signaled(mode: ResetMode) -> Self {
        Self::with_backend(mode, true)
    }
}

impl<B: RawEvent> Event<B> {
    pub fn with_backend(mode: ResetMode, signaled: bool) -> Self {
        Self {
            raw: B::new(mode, signaled),
            mode,
        }
    }

    pub fn mode(&self) -> ResetMode {
        self.mode
    }

    /// Wakes one waiter (automatic reset) or all of them (manual reset).
    pub fn signal(&self) {
        self.raw.signal();
    }

    pub fn reset(&self) {
        self.raw.reset();
    }

    pub fn is_signaled(&self) -> bool {
        self.raw.is_signaled()
    }

    pub fn wait(&self) {
        let signaled = self.raw.wait(None);
        debug_assert!(signaled, "untimed wait returned without signal");
    }

    /// Returns `false` if `timeout` elapsed before the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.raw.wait(Some(timeout))
    }
}

impl<B: RawEvent> fmt::Debug for Event<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("mode", &self.mode)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
