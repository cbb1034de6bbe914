use std::iter::FusedIterator;

use crate::context::fcontext::Fcontext;
use crate::context::switch::Switch;
use crate::coroutine::Coroutine;
use crate::generator::Generator;

/// Next value of a coroutine whose current value has or has not been handed
/// out yet.
fn step<T: Clone, S: Switch>(coroutine: &mut Coroutine<'_, T, S>, primed: &mut bool) -> Option<T> {
    if *primed {
        coroutine.advance();
    } else {
        // the coroutine already sits on its first (or current) value
        *primed = true;
    }
    coroutine.get().cloned()
}

/// Borrowing iterator, see [`Coroutine::iter`].
pub struct Iter<'g, 'a, T, S: Switch = Fcontext> {
    coroutine: &'g mut Coroutine<'a, T, S>,
    primed: bool,
}

impl<'g, 'a, T, S: Switch> Iter<'g, 'a, T, S> {
    pub(crate) fn new(coroutine: &'g mut Coroutine<'a, T, S>) -> Self {
        Self {
            coroutine,
            primed: false,
        }
    }
}

impl<T: Clone, S: Switch> Iterator for Iter<'_, '_, T, S> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        step(self.coroutine, &mut self.primed)
    }
}

impl<T: Clone, S: Switch> FusedIterator for Iter<'_, '_, T, S> {}

impl<'g, 'a, T: Clone, S: Switch> IntoIterator for &'g mut Coroutine<'a, T, S> {
    type Item = T;
    type IntoIter = Iter<'g, 'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        Iter::new(self)
    }
}

/// Owning iterator over a [`Generator`].
pub struct IntoIter<'a, T, S: Switch = Fcontext> {
    generator: Generator<'a, T, S>,
    primed: bool,
}

impl<T: Clone, S: Switch> Iterator for IntoIter<'_, T, S> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        step(&mut *self.generator, &mut self.primed)
    }
}

impl<T: Clone, S: Switch> FusedIterator for IntoIter<'_, T, S> {}

impl<'a, T: Clone, S: Switch> IntoIterator for Generator<'a, T, S> {
    type Item = T;
    type IntoIter = IntoIter<'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            generator: self,
            primed: false,
        }
    }
}

impl<'g, 'a, T: Clone, S: Switch> IntoIterator for &'g mut Generator<'a, T, S> {
    type Item = T;
    type IntoIter = Iter<'g, 'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        Iter::new(&mut **self)
    }
}
