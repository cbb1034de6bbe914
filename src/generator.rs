use std::io::Error;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::builder::Builder;
use crate::context::fcontext::Fcontext;
use crate::context::switch::Switch;
use crate::coroutine::{Coroutine, RawBody};
use crate::yielder::Yielder;

/// Heap slot for an owned body. It is filled before the coroutine first runs
/// and freed only when the [`Generator`] goes away.
struct OwnedBody<'a, T> {
    ptr: NonNull<dyn FnMut(Yielder<'_, T>) + 'a>,
}

impl<'a, T> OwnedBody<'a, T> {
    fn new<F>(body: F) -> (Self, RawBody<T>)
    where
        F: FnMut(Yielder<'_, T>) + 'a,
    {
        let ptr = Box::into_raw(Box::new(body));
        let raw = RawBody::from_mut(ptr);
        let ptr: *mut (dyn FnMut(Yielder<'_, T>) + 'a) = ptr;
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(ptr) };
        (Self { ptr }, raw)
    }
}

impl<T> Drop for OwnedBody<'_, T> {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
    }
}

/// A coroutine that owns its body.
///
/// Fields drop in declaration order: the coroutine is stopped and torn down
/// while the body it runs is still alive, and only then is the body freed.
pub struct Generator<'a, T, S: Switch = Fcontext> {
    coroutine: Coroutine<'a, T, S>,
    _body: OwnedBody<'a, T>,
}

impl<'a, T> Generator<'a, T> {
    /// Starts `body` on a stack of the default size. It runs until its first
    /// yield before this returns.
    ///
    /// ```
    /// let mut fib = stackgen::Generator::new(|y| {
    ///     let (mut a, mut b) = (0u32, 1u32);
    ///     loop {
    ///         y.yield_(&mut a);
    ///         (a, b) = (b, a + b);
    ///     }
    /// })
    /// .unwrap();
    /// let first: Vec<u32> = fib.iter().take(7).collect();
    /// assert_eq!(first, [0, 1, 1, 2, 3, 5, 8]);
    /// ```
    pub fn new<F>(body: F) -> Result<Self, Error>
    where
        F: FnMut(Yielder<'_, T>) + 'a,
    {
        Builder::new().spawn(body)
    }

    pub fn with_stack_size<F>(stack_size: usize, body: F) -> Result<Self, Error>
    where
        F: FnMut(Yielder<'_, T>) + 'a,
    {
        Builder::new().stack_size(stack_size).spawn(body)
    }
}

impl<'a, T, S: Switch> Generator<'a, T, S> {
    pub(crate) fn spawn<F>(body: F, stack_size: usize, name: Option<String>) -> Result<Self, Error>
    where
        F: FnMut(Yielder<'_, T>) + 'a,
    {
        let (owned, raw) = OwnedBody::new(body);
        let coroutine = unsafe { Coroutine::prepare(raw, stack_size, name)? };
        let mut generator = Generator {
            coroutine,
            _body: owned,
        };
        generator.coroutine.start();
        Ok(generator)
    }
}

impl<'a, T, S: Switch> Deref for Generator<'a, T, S> {
    type Target = Coroutine<'a, T, S>;

    fn deref(&self) -> &Self::Target {
        &self.coroutine
    }
}

impl<T, S: Switch> DerefMut for Generator<'_, T, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.coroutine
    }
}
