use std::panic;

use crate::context::switch::Switch;
use crate::coroutine::{Cancelled, Coroutine, Inbound, State};

pub(crate) trait Suspend<T> {
    /// Payload that unwinds the body of this coroutine and no other.
    fn cancelled(&self) -> Cancelled;

    /// Publishes `value` and hands control back to the caller until the next
    /// resume.
    fn suspend(&self, value: *mut T) -> Inbound;

    /// Switches back to the caller for the last time.
    unsafe fn leave(&self, state: State) -> !;
}

/// Handed to a coroutine body; the only way for the body to suspend itself.
///
/// A `Yielder` can be copied freely inside the body, its lifetime keeps it
/// from escaping the coroutine it belongs to.
pub struct Yielder<'y, T> {
    core: &'y dyn Suspend<T>,
}

impl<T> Clone for Yielder<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Yielder<'_, T> {}

impl<'y, T> Yielder<'y, T> {
    pub(crate) fn new(core: &'y dyn Suspend<T>) -> Self {
        Self { core }
    }

    /// Publishes a reference to `value` and suspends. The caller sees it
    /// through `get`/`get_mut` until it advances, so changes the caller makes
    /// are visible here once this returns.
    ///
    /// When the caller stops the coroutine instead of advancing it, this
    /// call unwinds the body.
    #[inline]
    pub fn yield_(&self, value: &mut T) {
        if self.core.suspend(value) == Inbound::Stop {
            panic::resume_unwind(Box::new(self.core.cancelled()));
        }
    }

    /// Like [`yield_`](Self::yield_) for a value without a home of its own;
    /// it lives on the coroutine stack while suspended.
    #[inline]
    pub fn yield_value(&self, mut value: T) {
        self.yield_(&mut value)
    }

    /// Re-yields every value of `source` until it is exhausted.
    pub fn yield_from<S: Switch>(&self, source: &mut Coroutine<'_, T, S>) {
        while let Some(value) = source.get_mut() {
            self.yield_(value);
            source.advance();
        }
    }

    /// Ends the body right here, unwinding it like a stop from the caller.
    pub fn done(&self) -> ! {
        panic::resume_unwind(Box::new(self.core.cancelled()))
    }

    /// Ends the body right here without unwinding: nothing living on the
    /// coroutine stack is dropped and the stack is reused afterwards.
    ///
    /// # Safety
    ///
    /// No value on the coroutine stack may rely on its destructor running
    /// before its memory is reused, pinned values in particular.
    pub unsafe fn exit(&self) -> ! {
        self.core.leave(State::Finished)
    }
}
