use crate::sync::{RawEvent, ResetMode};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNSIGNALED: u32 = 0;
const SIGNALED: u32 = 1;

/// Linux event backed directly by `futex(2)`. Signaling an already signaled
/// event is a single atomic swap, no syscall.
#[derive(Debug)]
pub struct FutexEvent {
    mode: ResetMode,
    state: AtomicU32,
}

impl FutexEvent {
    #[inline]
    fn try_acquire(&self) -> bool {
        match self.mode {
            ResetMode::Manual => self.state.load(Ordering::Acquire) == SIGNALED,
            ResetMode::Auto => self
                .state
                .compare_exchange(SIGNALED, UNSIGNALED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
        }
    }
}

impl RawEvent for FutexEvent {
    fn new(mode: ResetMode, signaled: bool) -> Self {
        Self {
            mode,
            state: AtomicU32::new(if signaled { SIGNALED } else { UNSIGNALED }),
        }
    }

    fn signal(&self) {
        if self.state.swap(SIGNALED, Ordering::Release) == SIGNALED {
            return;
        }

        let waiters = match self.mode {
            ResetMode::Manual => i32::MAX,
            ResetMode::Auto => 1,
        };
        futex_wake(&self.state, waiters);
    }

    fn reset(&self) {
        self.state.store(UNSIGNALED, Ordering::Release);
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if self.try_acquire() {
                return true;
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => return false,
                },
            };

            // EINTR, EAGAIN and ETIMEDOUT all land back here, the state is
            // re-checked on every iteration.
            futex_wait(&self.state, UNSIGNALED, remaining);
        }
    }

    fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }
}

fn futex_wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as _,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |ts| ts as *const libc::timespec);

    // Safety: the futex word outlives the call and the timespec pointer is
    // either null or points to a live stack value.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        );
    }
}

fn futex_wake(futex: &AtomicU32, count: i32) {
    // Safety: plain wake on a live futex word.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        );
    }
}
