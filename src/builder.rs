use std::io::Error;
use std::marker::PhantomData;

use crate::config::default_stack_size;
use crate::context::fcontext::Fcontext;
use crate::context::switch::Switch;
use crate::coroutine::{Coroutine, RawBody};
use crate::generator::Generator;
use crate::yielder::Yielder;

/// Coroutine factory, which can be used in order to configure the properties
/// of a new coroutine.
///
/// ```
/// use stackgen::Builder;
///
/// let mut squares = Builder::new()
///     .name("squares")
///     .stack_size(64 << 10)
///     .spawn(|y| {
///         for i in 1..=3u64 {
///             y.yield_value(i * i);
///         }
///     })
///     .unwrap();
/// assert_eq!(squares.name(), Some("squares"));
/// assert_eq!(squares.iter().collect::<Vec<_>>(), [1, 4, 9]);
/// ```
#[must_use = "must eventually spawn the coroutine"]
pub struct Builder<S = Fcontext> {
    stack_size: Option<usize>,
    name: Option<String>,
    _switch: PhantomData<fn() -> S>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            stack_size: None,
            name: None,
            _switch: PhantomData,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Switch> Builder<S> {
    /// Usable stack size in bytes. Smaller values are raised to
    /// [`MIN_STACK_SIZE`](crate::config::MIN_STACK_SIZE).
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Name shown in log lines about the coroutine.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Picks the control-transfer implementation.
    pub fn switch<S2: Switch>(self) -> Builder<S2> {
        Builder {
            stack_size: self.stack_size,
            name: self.name,
            _switch: PhantomData,
        }
    }

    fn resolved_stack_size(&self) -> usize {
        self.stack_size.unwrap_or_else(default_stack_size)
    }

    /// Moves `body` into a new [`Generator`] and runs it up to its first
    /// yield. A panic before that point is re-raised here.
    pub fn spawn<'a, T, F>(self, body: F) -> Result<Generator<'a, T, S>, Error>
    where
        F: FnMut(Yielder<'_, T>) + 'a,
    {
        let stack_size = self.resolved_stack_size();
        Generator::spawn(body, stack_size, self.name)
    }

    /// Runs a body owned by the caller, which keeps access to it while the
    /// coroutine lives and may start it again afterwards.
    pub fn spawn_borrowed<'a, T, F>(self, body: &'a F) -> Result<Coroutine<'a, T, S>, Error>
    where
        F: Fn(Yielder<'_, T>) + 'a,
    {
        let stack_size = self.resolved_stack_size();
        let mut coroutine =
            unsafe { Coroutine::prepare(RawBody::from_ref(body), stack_size, self.name)? };
        coroutine.start();
        Ok(coroutine)
    }
}
