use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Builder, Generator, Switch, Yielder};

/// Runs each listed generic test once per control-transfer backend.
macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod fcontext {
            $(
                #[test_log::test]
                fn $name() {
                    super::$name::<crate::Fcontext>()
                }
            )*
        }

        mod threaded {
            $(
                #[test_log::test]
                fn $name() {
                    super::$name::<crate::Threaded>()
                }
            )*
        }
    };
}

mod generator_tests;

/// Counts how often values created from it were dropped.
#[derive(Clone, Default)]
pub(crate) struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    pub(crate) fn token(&self) -> Token {
        Token(self.0.clone())
    }

    pub(crate) fn dropped(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct Token(Arc<AtomicUsize>);

impl Drop for Token {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn spawn<'a, S, T, F>(body: F) -> Generator<'a, T, S>
where
    S: Switch,
    F: FnMut(Yielder<'_, T>) + 'a,
{
    Builder::new().switch::<S>().spawn(body).unwrap()
}
