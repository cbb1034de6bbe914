use std::io::Error;

use super::stack::StackRegion;

/// A saved execution point that control can be handed to, together with one
/// machine word.
///
/// # Safety
///
/// `switch` must suspend the calling execution point, resume `self`, and
/// return only when some execution point switches back, yielding that point
/// and the word it passed. A prepared point must start in
/// [`EntryPoint::enter`] on its first switch, running on `stack`.
pub unsafe trait Switch: Sized {
    /// Creates the initial execution point of a coroutine that will run `E`
    /// on `stack`. The region must outlive every switch into the point.
    unsafe fn prepare<E: EntryPoint<Self>>(stack: &StackRegion) -> Result<Self, Error>;

    unsafe fn switch(self, word: usize) -> (Self, usize);
}

/// First function to run on a freshly prepared execution point. `from` is the
/// point that switched in, `word` the value it passed.
///
/// # Safety
///
/// Implementations must never return: the frame below them does not exist.
pub unsafe trait EntryPoint<S> {
    unsafe fn enter(from: S, word: usize) -> !;
}
