use parking_lot::lock_api::RawMutex;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mutual exclusion that the owning thread may re-acquire without
/// deadlocking. The acquisition count has to drop back to zero before another
/// thread can take the lock.
///
/// Only shared access is handed out since the same thread can hold several
/// guards at once; wrap the data in a `RefCell` or `Cell` to mutate it.
///
/// Ownership is tracked per OS thread. A guard must never be held across a
/// group wait inside a task, the fiber may resume on another thread.
pub struct RecursiveMutex<T: ?Sized, R: RawMutex = parking_lot::RawMutex> {
    raw: R,
    owner: AtomicUsize,
    count: Cell<usize>,
    data: T,
}

// Safety: `count` is only touched by the thread that holds `raw`.
unsafe impl<T: ?Sized + Send, R: RawMutex + Send> Send for RecursiveMutex<T, R> {}
unsafe impl<T: ?Sized + Send, R: RawMutex + Sync> Sync for RecursiveMutex<T, R> {}

impl<T, R: RawMutex> RecursiveMutex<T, R> {
    pub fn new(data: T) -> Self {
        Self {
            raw: R::INIT,
            owner: AtomicUsize::new(0),
            count: Cell::new(0),
            data,
        }
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T: ?Sized, R: RawMutex> RecursiveMutex<T, R> {
    pub fn lock(&self) -> RecursiveMutexGuard<'_, T, R> {
        let me = current_thread_token();

        if self.owner.load(Ordering::Relaxed) != me {
            self.raw.lock();
            self.owner.store(me, Ordering::Relaxed);
        }

        self.acquired()
    }

    pub fn try_lock(&self) -> Option<RecursiveMutexGuard<'_, T, R>> {
        let me = current_thread_token();

        if self.owner.load(Ordering::Relaxed) != me {
            if !self.raw.try_lock() {
                return None;
            }
            self.owner.store(me, Ordering::Relaxed);
        }

        Some(self.acquired())
    }

    /// Number of times the calling thread currently holds the lock.
    pub fn lock_count(&self) -> usize {
        if self.owner.load(Ordering::Relaxed) == current_thread_token() {
            self.count.get()
        } else {
            0
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    fn acquired(&self) -> RecursiveMutexGuard<'_, T, R> {
        let count = self
            .count
            .get()
            .checked_add(1)
            .expect("recursive mutex lock count overflow");
        self.count.set(count);

        RecursiveMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }
}

impl<T: Default, R: RawMutex> Default for RecursiveMutex<T, R> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug, R: RawMutex> fmt::Debug for RecursiveMutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f
                .debug_struct("RecursiveMutex")
                .field("data", &&*guard)
                .finish(),
            None => f
                .debug_struct("RecursiveMutex")
                .field("data", &"<locked>")
                .finish(),
        }
    }
}

#[must_use = "if unused the RecursiveMutex will immediately unlock"]
pub struct RecursiveMutexGuard<'a, T: ?Sized, R: RawMutex = parking_lot::RawMutex> {
    mutex: &'a RecursiveMutex<T, R>,

    // Unlocking has to happen on the owning thread.
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized, R: RawMutex> Deref for RecursiveMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.mutex.data
    }
}

impl<T: ?Sized, R: RawMutex> Drop for RecursiveMutexGuard<'_, T, R> {
    fn drop(&mut self) {
        let count = self.mutex.count.get() - 1;
        self.mutex.count.set(count);

        if count == 0 {
            self.mutex.owner.store(0, Ordering::Relaxed);
            // Safety: this thread acquired `raw` when count went from 0 to 1.
            unsafe { self.mutex.raw.unlock() };
        }
    }
}

/// Non-zero token unique to each live thread: the address of a thread local.
#[inline(never)]
fn current_thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|token| token as *const u8 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    assert_impl_all!(RecursiveMutex<RefCell<u32>>: Send, Sync);
    assert_not_impl_any!(RecursiveMutexGuard<'static, u32>: Send);

    #[test]
    fn test_reentrant_lock_same_thread() {
        let mutex = RecursiveMutex::<_>::new(RefCell::new(Vec::new()));

        let outer = mutex.lock();
        outer.borrow_mut().push(1);
        {
            let inner = mutex.lock();
            inner.borrow_mut().push(2);
            assert_eq!(mutex.lock_count(), 2);

            let third = mutex.try_lock().expect("owner can always re-acquire");
            assert_eq!(mutex.lock_count(), 3);
            drop(third);
        }
        assert_eq!(mutex.lock_count(), 1);
        drop(outer);

        assert_eq!(mutex.lock_count(), 0);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner().into_inner(), vec![1, 2]);
    }

    #[test]
    fn test_other_thread_waits_for_full_release() {
        let mutex = Arc::new(RecursiveMutex::<_>::new(Cell::new(0u32)));
        let (tx, rx) = mpsc::channel();

        let first = mutex.lock();
        let second = mutex.lock();

        let handle = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                assert!(mutex.try_lock().is_none());
                tx.send(()).unwrap();

                let guard = mutex.lock();
                guard.set(guard.get() + 1);
                assert_eq!(mutex.lock_count(), 1);
            })
        };

        rx.recv().unwrap();
        drop(first);

        // Still held once by this thread.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(mutex.lock_count(), 1);
        assert_eq!(second.get(), 0);
        drop(second);

        handle.join().unwrap();
        assert_eq!(mutex.lock().get(), 1);
    }

    #[test]
    fn test_contended_counter() {
        let mutex = Arc::new(RecursiveMutex::<_>::new(Cell::new(0usize)));

        let handles = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let outer = mutex.lock();
                        let inner = mutex.lock();
                        inner.set(inner.get() + 1);
                        drop(inner);
                        drop(outer);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mutex.lock().get(), 4000);
    }
}
