//! Stackful coroutine primitive the scheduler fibers are built on.
//!
//! Switching is asymmetric: [`FiberContext::switch_to`] transfers control
//! into the fiber and the slot for the caller's machine state is implicit. The
//! fiber transfers control back with [`Suspender::switch_back`]. A switch
//! never allocates, values are moved through registers and the fiber stack.
//!
//! Stack overflow is caught by the guard page below every [`FiberStack`] and
//! kills the process. Size stacks generously.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::fmt;
use std::io;

/// Smallest stack a fiber can be created with.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FiberError {
    #[error("fiber stack of {requested} bytes is below the {min} bytes minimum")]
    StackTooSmall { requested: usize, min: usize },

    #[error("failed to allocate fiber stack")]
    StackAllocation(#[source] io::Error),
}

/// Memory backing a fiber: an anonymous mapping with a guard page.
pub struct FiberStack {
    inner: DefaultStack,
    size: usize,
}

impl FiberStack {
    pub fn new(size: usize) -> Result<Self, FiberError> {
        if size < MIN_STACK_SIZE {
            return Err(FiberError::StackTooSmall {
                requested: size,
                min: MIN_STACK_SIZE,
            });
        }

        let inner = DefaultStack::new(size).map_err(FiberError::StackAllocation)?;
        Ok(Self { inner, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberStack").field("size", &self.size).finish()
    }
}

/// Outcome of [`FiberContext::switch_to`].
#[derive(Debug, PartialEq, Eq)]
pub enum Switch<Y, R> {
    /// The fiber called [`Suspender::switch_back`] with this value.
    Suspended(Y),

    /// The entry function returned, the context cannot be switched to again.
    Returned(R),
}

/// Handle given to the fiber entry function to transfer control back.
#[repr(transparent)]
pub struct Suspender<I, Y> {
    yielder: Yielder<I, Y>,
}

impl<I, Y> Suspender<I, Y> {
    fn from_yielder(yielder: &Yielder<I, Y>) -> &Self {
        // Safety: `Suspender` is a transparent wrapper around `Yielder`.
        unsafe { &*(yielder as *const Yielder<I, Y> as *const Self) }
    }

    /// Suspends the fiber and returns to whoever last switched into it. Returns
    /// the value passed by the next `switch_to`.
    pub fn switch_back(&self, value: Y) -> I {
        self.yielder.suspend(value)
    }
}

/// A suspended or not yet started stackful execution context.
///
/// Only one thread may run a context at a time, which `&mut self` on
/// [`switch_to`](Self::switch_to) enforces.
pub struct FiberContext<I, Y, R> {
    coroutine: Coroutine<I, Y, R, DefaultStack>,
    stack_size: usize,
}

impl<I: 'static, Y: 'static, R: 'static> FiberContext<I, Y, R> {
    /// The first `switch_to` starts `entry` with the value it was given.
    pub fn new<F>(stack: FiberStack, entry: F) -> Self
    where
        F: FnOnce(&Suspender<I, Y>, I) -> R + 'static,
    {
        let stack_size = stack.size;
        let coroutine = Coroutine::with_stack(stack.inner, move |yielder: &Yielder<I, Y>, input| {
            entry(Suspender::from_yielder(yielder), input)
        });

        Self {
            coroutine,
            stack_size,
        }
    }

    /// Suspends the caller and runs the fiber until it switches back or
    /// returns. A panic escaping the entry function is re-raised here.
    #[track_caller]
    pub fn switch_to(&mut self, value: I) -> Switch<Y, R> {
        if self.coroutine.done() {
            crate::error::fatal("switch into a fiber whose entry function returned");
        }

        match self.coroutine.resume(value) {
            CoroutineResult::Yield(y) => Switch::Suspended(y),
            CoroutineResult::Return(r) => Switch::Returned(r),
        }
    }

    pub fn is_started(&self) -> bool {
        self.coroutine.started()
    }

    pub fn is_finished(&self) -> bool {
        self.coroutine.done()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl<I: 'static, Y: 'static, R: 'static> fmt::Debug for FiberContext<I, Y, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("stack_size", &self.stack_size)
            .field("started", &self.is_started())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalError;
    use rstest::rstest;
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    #[rstest]
    #[case::zero(0)]
    #[case::tiny(4096)]
    #[case::just_below(MIN_STACK_SIZE - 1)]
    fn test_stack_below_minimum_is_rejected(#[case] size: usize) {
        assert!(matches!(
            FiberStack::new(size),
            Err(FiberError::StackTooSmall { requested, min }) if requested == size && min == MIN_STACK_SIZE
        ));
    }

    #[test]
    fn test_transfer_values_both_ways() -> anyhow::Result<()> {
        let mut ctx = FiberContext::new(FiberStack::new(MIN_STACK_SIZE)?, |s, first: u32| {
            let second = s.switch_back(first * 10);
            let third = s.switch_back(second * 10);
            format!("done {third}")
        });

        assert!(!ctx.is_started());
        assert_eq!(ctx.switch_to(1), Switch::Suspended(10));
        assert!(ctx.is_started());
        assert_eq!(ctx.switch_to(2), Switch::Suspended(20));
        assert_eq!(ctx.switch_to(3), Switch::Returned("done 3".to_string()));
        assert!(ctx.is_finished());
        Ok(())
    }

    #[test]
    fn test_locals_survive_suspension() -> anyhow::Result<()> {
        let mut ctx = FiberContext::new(FiberStack::new(64 * 1024)?, |s, _: ()| {
            let mut acc = Vec::new();
            for i in 0..5 {
                acc.push(i);
                s.switch_back(acc.len());
            }
            acc.iter().sum::<i32>()
        });

        for expected in 1..=5 {
            assert_eq!(ctx.switch_to(()), Switch::Suspended(expected));
        }
        assert_eq!(ctx.switch_to(()), Switch::Returned(10));
        assert_eq!(ctx.stack_size(), 64 * 1024);
        Ok(())
    }

    #[test]
    fn test_panic_propagates_to_switcher() -> anyhow::Result<()> {
        let mut ctx: FiberContext<(), (), ()> =
            FiberContext::new(FiberStack::new(MIN_STACK_SIZE)?, |_, _| panic!("inside fiber"));

        let res = catch_unwind(AssertUnwindSafe(|| ctx.switch_to(())));
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn test_switch_into_finished_context_is_fatal() -> anyhow::Result<()> {
        let mut ctx: FiberContext<(), (), ()> =
            FiberContext::new(FiberStack::new(MIN_STACK_SIZE)?, |_, _| ());
        assert_eq!(ctx.switch_to(()), Switch::Returned(()));

        let payload = catch_unwind(AssertUnwindSafe(|| ctx.switch_to(()))).unwrap_err();
        assert!(payload.is::<FatalError>());
        Ok(())
    }

    #[test]
    fn test_dropping_suspended_context_unwinds_its_stack() -> anyhow::Result<()> {
        struct SetOnDrop(Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let flag = SetOnDrop(Rc::clone(&dropped));

        let mut ctx = FiberContext::new(FiberStack::new(MIN_STACK_SIZE)?, move |s, _: ()| {
            let _flag = flag;
            s.switch_back(());
        });

        assert_eq!(ctx.switch_to(()), Switch::Suspended(()));
        assert!(!dropped.get());

        drop(ctx);
        assert!(dropped.get());
        Ok(())
    }
}
