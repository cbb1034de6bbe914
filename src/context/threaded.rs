//! Software-simulated control transfer.
//!
//! Every coroutine runs on a helper thread that is parked whenever it does
//! not hold control, so exactly one side runs at a time just like with
//! [`Fcontext`](super::fcontext::Fcontext). Useful for exercising the engine
//! under tools that cannot follow hand-made stack switches.
//!
//! The body really executes on another OS thread: thread locals differ and
//! thread-affine values must not be yielded.

use std::io::Error;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{bounded, Sender};

use super::stack::StackRegion;
use super::switch::{EntryPoint, Switch};

struct Handoff {
    word: usize,
    from: Threaded,
}

/// A parked side waiting for exactly one hand-off.
pub struct Threaded {
    sender: Sender<Handoff>,
}

// unwinds a helper thread whose coroutine will never be resumed again
struct Abandoned;

unsafe impl Switch for Threaded {
    unsafe fn prepare<E: EntryPoint<Self>>(stack: &StackRegion) -> Result<Self, Error> {
        let (sender, receiver) = bounded::<Handoff>(1);
        let enter: unsafe fn(Threaded, usize) -> ! = E::enter;

        thread::Builder::new()
            .name(format!("stackgen-{}", stack.id()))
            .stack_size(stack.len())
            .spawn(move || {
                let Ok(first) = receiver.recv() else {
                    return;
                };
                drop(receiver);
                let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                    enter(first.from, first.word)
                }));
            })?;

        Ok(Threaded { sender })
    }

    unsafe fn switch(self, word: usize) -> (Self, usize) {
        let (sender, receiver) = bounded(1);
        let handoff = Handoff {
            word,
            from: Threaded { sender },
        };
        if self.sender.send(handoff).is_err() {
            panic::resume_unwind(Box::new(Abandoned));
        }
        match receiver.recv() {
            Ok(Handoff { word, from }) => (from, word),
            Err(_) => panic::resume_unwind(Box::new(Abandoned)),
        }
    }
}
