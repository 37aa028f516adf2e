/// Runs a closure when dropped, on normal exit as well as during unwinding.
///
/// Used where cleanup must happen even if the guarded code panics, such as
/// the fail-fast guard around a worker's scheduling loop. Inside the closure,
/// `std::thread::panicking()` tells the two cases apart.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // `FnOnce` has to be moved out to be called from `drop(&mut self)`.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::thread;

    #[test]
    fn test_runs_on_scope_exit() {
        let ran = Cell::new(false);
        {
            let _guard = ScopeGuard::new(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_sees_panicking_during_unwind() {
        let saw_panic = Cell::new(None);

        let res = catch_unwind(AssertUnwindSafe(|| -> () {
            let _guard = ScopeGuard::new(|| saw_panic.set(Some(thread::panicking())));
            panic!("unwinding through the guard");
        }));

        assert!(res.is_err());
        assert_eq!(saw_panic.get(), Some(true));
    }
}
