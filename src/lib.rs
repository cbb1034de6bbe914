//! Stackful generators.
//!
//! A generator body is an ordinary closure running on a stack of its own. It
//! publishes values by reference through its [`Yielder`] and is suspended
//! until the caller asks for the next one, so loops and local variables carry
//! the producer state instead of a hand-written state machine.
//!
//! ```
//! use stackgen::Generator;
//!
//! let mut countdown = Generator::new(|y| {
//!     for mut i in (1..=3).rev() {
//!         y.yield_(&mut i);
//!     }
//! })
//! .unwrap();
//!
//! assert_eq!(countdown.get(), Some(&3));
//! countdown.advance();
//! assert_eq!(countdown.get(), Some(&2));
//! countdown.advance();
//! countdown.advance();
//! assert!(countdown.stopped());
//! assert_eq!(countdown.get(), None);
//! ```
//!
//! Control moves between the caller and the body only inside
//! [`Coroutine::advance`], [`Coroutine::stop`] and drop on one side and the
//! yield calls on the other. Nothing runs in parallel.
//!
//! Dropping or stopping a suspended generator unwinds its body from the
//! pending yield, so every value on the generator stack is dropped. A body
//! that catches that unwind and keeps yielding cannot be torn down; its stack
//! is leaked when the generator is dropped.

pub mod builder;
pub mod config;
pub mod context;
pub mod coroutine;
pub mod generator;
pub mod iter;
pub mod metrics;
pub mod yielder;

pub use builder::Builder;
pub use self::context::fcontext::Fcontext;
pub use self::context::stack::StackRegion;
pub use self::context::switch::{EntryPoint, Switch};
#[cfg(any(test, feature = "simulated"))]
pub use self::context::threaded::Threaded;
pub use coroutine::{Coroutine, State};
pub use generator::Generator;
pub use iter::{IntoIter, Iter};
pub use yielder::Yielder;

#[cfg(test)]
mod tests;
