use crate::sync::{RawEvent, ResetMode};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Portable event built on a `parking_lot` mutex and condition variable.
#[derive(Debug)]
pub struct CondvarEvent {
    mode: ResetMode,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl RawEvent for CondvarEvent {
    fn new(mode: ResetMode, signaled: bool) -> Self {
        Self {
            mode,
            signaled: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;

        match self.mode {
            ResetMode::Manual => {
                self.cond.notify_all();
            }
            ResetMode::Auto => {
                self.cond.notify_one();
            }
        }
    }

    fn reset(&self) {
        *self.signaled.lock() = false;
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        // A deadline past what `Instant` can represent is no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut signaled = self.signaled.lock();

        // Loop on the flag, condvars wake up spuriously.
        while !*signaled {
            match deadline {
                None => self.cond.wait(&mut signaled),
                Some(deadline) => {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                        return false;
                    }
                }
            }
        }

        if self.mode == ResetMode::Auto {
            *signaled = false;
        }

        true
    }

    fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }
}
