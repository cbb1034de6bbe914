use std::any::Any;
use std::cell::Cell;
use std::io::Error;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, trace, warn};
use strum_macros::Display;

use crate::builder::Builder;
use crate::context::fcontext::Fcontext;
use crate::context::stack::{self, StackRegion};
use crate::context::switch::{EntryPoint, Switch};
use crate::iter::Iter;
use crate::metrics::{metrics, CoroutineEvent};
use crate::yielder::{Suspend, Yielder};

// start from 1 so that 0 never names a live coroutine in logs
static COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(PartialEq, Eq, Debug, Clone, Copy, Display)]
pub enum State {
    NotStarted,
    Running,
    Suspended,
    Finished,
    Cancelled,
}

// coroutine -> caller
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[repr(usize)]
enum Outbound {
    Continue = 0,
    Done = 1,
}

// caller -> coroutine, except for the very first transfer which carries the
// address of the core
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[repr(usize)]
pub(crate) enum Inbound {
    Resume = 0,
    Stop = 1,
}

impl Outbound {
    fn from_word(word: usize) -> Self {
        match word {
            0 => Outbound::Continue,
            1 => Outbound::Done,
            other => unreachable!("{other} not expected from a coroutine"),
        }
    }
}

impl Inbound {
    fn from_word(word: usize) -> Self {
        match word {
            0 => Inbound::Resume,
            1 => Inbound::Stop,
            other => unreachable!("{other} not expected from a caller"),
        }
    }
}

/// Unwind payload raised out of a pending yield when the caller stops the
/// coroutine. Carries the address of the core it cancels: only the launch
/// wrapper of that coroutine ends the unwind.
pub(crate) struct Cancelled(pub(crate) usize);

/// Type-erased client body, called exactly once on the coroutine stack.
pub(crate) struct RawBody<T> {
    data: *mut (),
    call: unsafe fn(*mut (), Yielder<'_, T>),
}

impl<T> Clone for RawBody<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawBody<T> {}

unsafe fn call_ref<T, F: Fn(Yielder<'_, T>)>(data: *mut (), yielder: Yielder<'_, T>) {
    (*(data as *const F))(yielder)
}

unsafe fn call_mut<T, F: FnMut(Yielder<'_, T>)>(data: *mut (), yielder: Yielder<'_, T>) {
    (*(data as *mut F))(yielder)
}

impl<T> RawBody<T> {
    pub(crate) fn from_ref<F: Fn(Yielder<'_, T>)>(body: &F) -> Self {
        Self {
            data: body as *const F as *mut (),
            call: call_ref::<T, F>,
        }
    }

    pub(crate) fn from_mut<F: FnMut(Yielder<'_, T>)>(body: *mut F) -> Self {
        Self {
            data: body as *mut (),
            call: call_mut::<T, F>,
        }
    }
}

/// State shared by the caller side and the coroutine side. It never moves
/// once the coroutine has been launched, every access goes through `&Core`.
pub(crate) struct Core<T, S> {
    outer: Cell<Option<S>>,
    current: Cell<*mut T>,
    state: Cell<State>,
    stopping: Cell<bool>,
    failure: Cell<Option<Box<dyn Any + Send>>>,
    body: RawBody<T>,
}

impl<T, S> Core<T, S> {
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

impl<T, S: Switch> Suspend<T> for Core<T, S> {
    fn cancelled(&self) -> Cancelled {
        Cancelled(self.addr())
    }

    fn suspend(&self, value: *mut T) -> Inbound {
        self.current.set(value);
        self.state.set(State::Suspended);
        let outer = self
            .outer
            .take()
            .expect("yield from a coroutine that is not running");
        let (outer, word) = unsafe { outer.switch(Outbound::Continue as usize) };
        self.outer.set(Some(outer));
        self.state.set(State::Running);
        Inbound::from_word(word)
    }

    unsafe fn leave(&self, state: State) -> ! {
        self.current.set(null_mut());
        self.state.set(state);
        let mut outer = self
            .outer
            .take()
            .expect("leaving a coroutine that is not running");
        // nobody switches back into a finished coroutine, loop in case of a
        // contract violation rather than running off the end of the stack
        loop {
            outer = outer.switch(Outbound::Done as usize).0;
        }
    }
}

struct Launch<T>(PhantomData<fn() -> T>);

unsafe impl<T, S: Switch> EntryPoint<S> for Launch<T> {
    unsafe fn enter(from: S, word: usize) -> ! {
        let core = &*(word as *const Core<T, S>);
        core.outer.set(Some(from));
        core.state.set(State::Running);

        let body = core.body;
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            (body.call)(body.data, Yielder::new(core));
        }));

        let ended = if core.stopping.get() {
            State::Cancelled
        } else {
            State::Finished
        };
        let state = match res {
            Ok(()) => ended,
            Err(payload) => match payload.downcast_ref::<Cancelled>().map(|c| c.0) {
                // ours, or Yielder::done when not stopping
                Some(target) if target == core.addr() => ended,
                // a yielder of an enclosing coroutine was stopped while this
                // stack was on top, keep unwinding towards its owner
                Some(_) => {
                    core.failure.set(Some(payload));
                    State::Cancelled
                }
                None => {
                    core.failure.set(Some(payload));
                    State::Finished
                }
            },
        };

        core.leave(state)
    }
}

/// A stackful coroutine running a borrowed body.
///
/// The body starts as soon as the coroutine is built and runs up to its first
/// yield. Every [`advance`](Coroutine::advance) runs it up to the next one.
/// Dropping a suspended coroutine stops it first, so values living on its
/// stack are dropped exactly once.
///
/// The shared state sits in its own heap allocation, so a started coroutine
/// may be moved freely: the body's [`Yielder`] never points at the handle.
pub struct Coroutine<'a, T, S: Switch = Fcontext> {
    core: NonNull<Core<T, S>>,
    // the coroutine's execution point, None once the body is gone
    inner: Option<S>,
    stack: Option<StackRegion>,
    stack_size: usize,
    id: u64,
    name: Option<String>,
    // borrows the body; invariant in T since the caller may write through
    // get_mut
    _body: PhantomData<(&'a (), *mut T)>,
}

impl<'a, T> Coroutine<'a, T> {
    /// Starts `body` on a stack of the default size.
    pub fn new<F>(body: &'a F) -> Result<Self, Error>
    where
        F: Fn(Yielder<'_, T>) + 'a,
    {
        Builder::new().spawn_borrowed(body)
    }

    pub fn with_stack_size<F>(stack_size: usize, body: &'a F) -> Result<Self, Error>
    where
        F: Fn(Yielder<'_, T>) + 'a,
    {
        Builder::new().stack_size(stack_size).spawn_borrowed(body)
    }
}

impl<'a, T, S: Switch> Coroutine<'a, T, S> {
    /// Maps the stack and prepares the inner execution point without running
    /// anything. `body` must stay valid until the coroutine is dropped.
    pub(crate) unsafe fn prepare(
        body: RawBody<T>,
        stack_size: usize,
        name: Option<String>,
    ) -> Result<Self, Error> {
        let stack = stack::fetch_or_acquire(stack_size)?;
        let inner = match S::prepare::<Launch<T>>(&stack) {
            Ok(inner) => inner,
            Err(err) => {
                // nothing ever ran on it
                stack::recycle(stack);
                return Err(err);
            }
        };
        let core = Box::new(Core {
            outer: Cell::new(None),
            current: Cell::new(null_mut()),
            state: Cell::new(State::NotStarted),
            stopping: Cell::new(false),
            failure: Cell::new(None),
            body,
        });

        metrics().coroutine(CoroutineEvent::Spawned);
        Ok(Self {
            core: NonNull::from(Box::leak(core)),
            inner: Some(inner),
            stack_size: stack.len(),
            id: COROUTINE_ID.fetch_add(1, Ordering::Relaxed),
            stack: Some(stack),
            name,
            _body: PhantomData,
        })
    }

    /// Runs the body up to its first yield. Re-raises a panic of the body.
    pub(crate) fn start(&mut self) {
        assert_eq!(self.state(), State::NotStarted);
        debug!("starting {self}");
        self.transfer(self.core.as_ptr() as usize);
        self.rethrow();
    }

    #[inline]
    fn core(&self) -> &Core<T, S> {
        unsafe { self.core.as_ref() }
    }

    fn transfer(&mut self, word: usize) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        self.core().current.set(null_mut());
        trace!("switching into {self} with {word:#x}");

        let (inner, word) = unsafe { inner.switch(word) };
        match Outbound::from_word(word) {
            Outbound::Continue => self.inner = Some(inner),
            Outbound::Done => {
                drop(inner);
                self.finish();
            }
        }
    }

    fn finish(&mut self) {
        if let Some(stack) = self.stack.take() {
            stack::recycle(stack);
        }
        let core = self.core();
        let failure = core.failure.take();
        let failed = failure.as_ref().is_some_and(|payload| !payload.is::<Cancelled>());
        core.failure.set(failure);
        if failed {
            metrics().coroutine(CoroutineEvent::Failed);
        }
        let event = match core.state.get() {
            State::Cancelled => CoroutineEvent::Cancelled,
            _ => CoroutineEvent::Finished,
        };
        metrics().coroutine(event);
        debug!("{self} is {}{}", core.state.get(), if failed { " with a panic" } else { "" });
    }

    fn rethrow(&mut self) {
        if let Some(payload) = self.core().failure.take() {
            panic::resume_unwind(payload);
        }
    }

    /// Resumes the body until it yields again or returns. No-op once the
    /// coroutine is stopped. A panic in the body is re-raised here.
    pub fn advance(&mut self) {
        if self.stopped() {
            return;
        }
        if self.state() == State::NotStarted {
            return self.start();
        }
        let signal = if self.core().stopping.get() {
            Inbound::Stop
        } else {
            Inbound::Resume
        };
        self.transfer(signal as usize);
        self.rethrow();
    }

    /// Value passed to the last yield, `None` once the coroutine is stopped.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        unsafe { self.core().current.get().as_ref() }
    }

    /// Mutable access to the value the body is suspended on. Writes are seen
    /// by the body when it resumes.
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        unsafe { self.core().current.get().as_mut() }
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.inner.is_none()
    }

    #[inline]
    pub fn state(&self) -> State {
        self.core().state.get()
    }

    /// Cancels a suspended body: its pending yield unwinds, dropping every
    /// value on the coroutine stack. Idempotent.
    ///
    /// A body that catches the unwind and yields again stays suspended, and
    /// every later resume is a stop request again.
    pub fn stop(&mut self) {
        if let Some(payload) = self.cancel() {
            panic::resume_unwind(payload);
        }
    }

    fn cancel(&mut self) -> Option<Box<dyn Any + Send>> {
        if self.stopped() {
            return None;
        }
        self.core().stopping.set(true);
        if self.state() == State::NotStarted {
            // never entered, nothing lives on the stack yet
            self.inner = None;
            self.core().state.set(State::Cancelled);
            self.finish();
            return None;
        }
        self.transfer(Inbound::Stop as usize);

        let payload = self.core().failure.take()?;
        if std::thread::panicking() {
            error!("{self} panicked while being stopped during a panic, dropping it");
            None
        } else {
            Some(payload)
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Usable bytes of the coroutine stack, after clamping and rounding.
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Single-pass iterator over clones of the yielded values, starting with
    /// the current one.
    pub fn iter(&mut self) -> Iter<'_, 'a, T, S>
    where
        T: Clone,
    {
        Iter::new(self)
    }

    /// Hands each yielded value to `f` by mutable reference, advancing after
    /// every call, until the body is done.
    pub fn for_each_mut<G: FnMut(&mut T)>(&mut self, mut f: G) {
        while let Some(value) = self.get_mut() {
            f(value);
            self.advance();
        }
    }
}

impl<T, S: Switch> std::fmt::Display for Coroutine<'_, T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "coroutine {} ({name})", self.id),
            None => write!(f, "coroutine {}", self.id),
        }
    }
}

impl<T, S: Switch> Drop for Coroutine<'_, T, S> {
    fn drop(&mut self) {
        let failure = self.cancel();

        if let Some(inner) = self.inner.take() {
            // the body swallowed the cancellation and yielded again, its
            // frames can never be unwound so neither the stack nor the
            // execution point may be reused
            warn!("{self} ignored cancellation, leaking its stack");
            mem::forget(inner);
            if let Some(stack) = self.stack.take() {
                stack.leak();
            }
            metrics().coroutine(CoroutineEvent::Leaked);
        }

        unsafe { drop(Box::from_raw(self.core.as_ptr())) };

        if let Some(payload) = failure {
            panic::resume_unwind(payload);
        }
    }
}
