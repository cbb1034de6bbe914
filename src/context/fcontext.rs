use std::io::Error;

use context::stack::Stack;
use context::{Context, Transfer};

use super::stack::StackRegion;
use super::switch::{EntryPoint, Switch};

/// boost.context `fcontext_t`: a stack pointer with the callee-saved registers
/// spilled just below it.
pub struct Fcontext(Context);

// E::enter never returns, falling off the end would exit the process
extern "C" fn task_runner<E: EntryPoint<Fcontext>>(t: Transfer) {
    unsafe { E::enter(Fcontext(t.context), t.data) }
}

unsafe impl Switch for Fcontext {
    #[inline]
    unsafe fn prepare<E: EntryPoint<Self>>(stack: &StackRegion) -> Result<Self, Error> {
        let stack = Stack::new(stack.top().cast(), stack.bottom().cast());
        Ok(Fcontext(Context::new(&stack, task_runner::<E>)))
    }

    #[inline(always)]
    unsafe fn switch(self, word: usize) -> (Self, usize) {
        let Transfer { context, data } = self.0.resume(word);
        (Fcontext(context), data)
    }
}
