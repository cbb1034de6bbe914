pub mod fcontext;
pub mod stack;
pub mod switch;

#[cfg(any(test, feature = "simulated"))]
pub mod threaded;
