use std::cell::{Cell, RefCell};
use std::io::{Error, ErrorKind};
use std::panic::{self, AssertUnwindSafe};

use rand::Rng;

use super::{spawn, DropCounter};
use crate::config::MIN_STACK_SIZE;
use crate::context::stack;
use crate::metrics::{metrics, CoroutineEvent};
use crate::context::switch::EntryPoint;
use crate::{Builder, Fcontext, StackRegion, State, Switch};

backend_tests!(
    yields_then_stops,
    fibonacci,
    drop_unwinds_suspended_body,
    stop_is_idempotent,
    iterates_once,
    caller_writes_reach_body,
    for_each_mut_sees_every_value,
    panic_reaches_caller,
    panic_before_first_yield,
    swallowed_stop_leaks,
    done_finishes_body,
    moved_generator_keeps_running,
    body_without_yield,
    yield_from_forwards,
    stopping_outer_drops_inner,
    finished_stack_is_reused,
    huge_stack_is_refused,
    outer_yielder_in_inner_body_stops,
    outer_yielder_in_inner_body_drops,
    panic_while_stopping,
    drop_during_unrelated_panic,
    caught_stop_then_return,
);

fn yields_then_stops<S: Switch>() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let n = rng.gen_range(1..50usize);
        let stack_size = rng.gen_range(MIN_STACK_SIZE..4 * MIN_STACK_SIZE);
        let mut gen = Builder::new()
            .switch::<S>()
            .stack_size(stack_size)
            .spawn(move |y| {
                for mut i in 0..n {
                    y.yield_(&mut i);
                }
            })
            .unwrap();
        assert!(gen.stack_size() >= stack_size);

        for i in 0..n {
            assert!(!gen.stopped());
            assert_eq!(gen.state(), State::Suspended);
            assert_eq!(gen.get(), Some(&i));
            gen.advance();
        }
        assert!(gen.stopped());
        assert_eq!(gen.get(), None);
        assert_eq!(gen.state(), State::Finished);
    }
}

fn fibonacci<S: Switch>() {
    let gen = spawn::<S, _, _>(|y| {
        let (mut a, mut b) = (0u64, 1u64);
        loop {
            y.yield_(&mut a);
            (a, b) = (b, a + b);
        }
    });
    let values: Vec<u64> = gen.into_iter().take(7).collect();
    assert_eq!(values, [0, 1, 1, 2, 3, 5, 8]);
}

fn drop_unwinds_suspended_body<S: Switch>() {
    let counter = DropCounter::default();
    let c = counter.clone();
    let mut gen = spawn::<S, _, _>(move |y| {
        let _token = c.token();
        for mut i in 0..10u32 {
            y.yield_(&mut i);
        }
    });
    gen.advance();
    gen.advance();
    assert_eq!(gen.get(), Some(&2));
    assert_eq!(counter.dropped(), 0);

    drop(gen);
    assert_eq!(counter.dropped(), 1);
}

fn stop_is_idempotent<S: Switch>() {
    let counter = DropCounter::default();
    let c = counter.clone();
    let mut gen = spawn::<S, _, _>(move |y| {
        let _token = c.token();
        loop {
            y.yield_value(1u8);
        }
    });

    gen.stop();
    assert!(gen.stopped());
    assert_eq!(gen.state(), State::Cancelled);
    assert_eq!(gen.get(), None);
    assert_eq!(counter.dropped(), 1);

    gen.stop();
    gen.advance();
    assert!(gen.stopped());
    assert_eq!(gen.get(), None);
    drop(gen);
    assert_eq!(counter.dropped(), 1);
}

fn iterates_once<S: Switch>() {
    let mut gen = spawn::<S, _, _>(|y| {
        for mut i in 1..=5 {
            y.yield_(&mut i);
        }
    });
    let seen: Vec<i32> = gen.iter().collect();
    assert_eq!(seen, [1, 2, 3, 4, 5]);
    assert_eq!(gen.iter().next(), None);
    assert_eq!((&mut gen).into_iter().count(), 0);
}

fn caller_writes_reach_body<S: Switch>() {
    let heard = RefCell::new(Vec::new());
    let mut gen = spawn::<S, _, _>(|y| {
        let mut line = String::new();
        loop {
            y.yield_(&mut line);
            if line == "Stop" {
                break;
            }
            heard.borrow_mut().push(line.clone());
        }
    });
    for word in ["hello", "world", "Stop", "ignored"] {
        if let Some(line) = gen.get_mut() {
            *line = word.to_string();
        }
        gen.advance();
    }
    assert!(gen.stopped());
    drop(gen);
    assert_eq!(heard.into_inner(), ["hello", "world"]);
}

fn for_each_mut_sees_every_value<S: Switch>() {
    let sum = Cell::new(0);
    let mut gen = spawn::<S, _, _>(|y| {
        for i in 1..=4u32 {
            let mut v = i;
            y.yield_(&mut v);
            sum.set(sum.get() + v);
        }
    });
    gen.for_each_mut(|v| *v *= 10);
    assert!(gen.stopped());
    drop(gen);
    assert_eq!(sum.get(), 100);
}

fn panic_reaches_caller<S: Switch>() {
    let counter = DropCounter::default();
    let c = counter.clone();
    let failed = metrics().coroutine_count(CoroutineEvent::Failed);
    let mut gen = spawn::<S, _, _>(move |y| {
        let _token = c.token();
        y.yield_value(1);
        panic!("boom");
    });
    assert_eq!(gen.get(), Some(&1));

    let err = panic::catch_unwind(AssertUnwindSafe(|| gen.advance())).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
    assert!(gen.stopped());
    assert_eq!(gen.state(), State::Finished);
    assert_eq!(counter.dropped(), 1);
    assert!(metrics().coroutine_count(CoroutineEvent::Failed) > failed);

    // reported once, dropping it afterwards is quiet
    drop(gen);
}

fn panic_before_first_yield<S: Switch>() {
    let err = panic::catch_unwind(AssertUnwindSafe(|| {
        spawn::<S, u8, _>(|_| panic!("early"));
    }))
    .unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"early"));
}

fn swallowed_stop_leaks<S: Switch>() {
    let counter = DropCounter::default();
    let c = counter.clone();
    let swallowed = Cell::new(0);
    let leaked = metrics().coroutine_count(CoroutineEvent::Leaked);
    let mut gen = spawn::<S, _, _>(|y| {
        let _token = c.token();
        let mut v = 0u32;
        loop {
            if panic::catch_unwind(AssertUnwindSafe(|| y.yield_(&mut v))).is_err() {
                swallowed.set(swallowed.get() + 1);
            }
            v += 1;
        }
    });

    gen.stop();
    assert_eq!(swallowed.get(), 1);
    assert!(!gen.stopped());
    assert_eq!(gen.state(), State::Suspended);
    assert_eq!(gen.get(), Some(&1));

    // still a stop request
    gen.advance();
    assert_eq!(swallowed.get(), 2);

    drop(gen);
    assert_eq!(swallowed.get(), 3);
    assert_eq!(counter.dropped(), 0);
    assert!(metrics().coroutine_count(CoroutineEvent::Leaked) > leaked);
}

fn done_finishes_body<S: Switch>() {
    let counter = DropCounter::default();
    let c = counter.clone();
    let gen = spawn::<S, _, _>(move |y| {
        let _token = c.token();
        for i in 0.. {
            if i == 2 {
                y.done();
            }
            y.yield_value(i);
        }
    });
    let mut iter = gen.into_iter();
    assert_eq!(iter.by_ref().collect::<Vec<_>>(), [0, 1]);
    assert_eq!(counter.dropped(), 1);
}

fn moved_generator_keeps_running<S: Switch>() {
    let mut gen = spawn::<S, _, _>(|y| {
        for i in 0..6u32 {
            y.yield_value(i * 3);
        }
    });
    gen.advance();

    let mut boxed = Box::new(gen);
    assert_eq!(boxed.get(), Some(&3));
    boxed.advance();

    let mut moved = vec![*boxed];
    let rest: Vec<u32> = moved.pop().unwrap().into_iter().collect();
    assert_eq!(rest, [6, 9, 12, 15]);
}

fn body_without_yield<S: Switch>() {
    let ran = Cell::new(false);
    let gen = spawn::<S, u8, _>(|_| ran.set(true));
    assert!(ran.get());
    assert!(gen.stopped());
    assert_eq!(gen.state(), State::Finished);
    assert_eq!(gen.get(), None);
    assert_eq!(gen.into_iter().count(), 0);
}

fn yield_from_forwards<S: Switch>() {
    let mut outer = spawn::<S, _, _>(|y| {
        y.yield_value(0u32);
        let mut inner = spawn::<S, _, _>(|y| {
            for i in 1..=3u32 {
                y.yield_value(i);
            }
        });
        y.yield_from(&mut *inner);
        y.yield_value(4);
    });
    assert_eq!(outer.iter().collect::<Vec<_>>(), [0, 1, 2, 3, 4]);
    assert!(outer.stopped());
}

fn stopping_outer_drops_inner<S: Switch>() {
    let counter = DropCounter::default();
    let mut outer = spawn::<S, _, _>(|y| {
        let mut inner = spawn::<S, _, _>(|y| {
            let _token = counter.token();
            loop {
                y.yield_value(7u8);
            }
        });
        y.yield_from(&mut *inner);
    });
    assert_eq!(outer.get(), Some(&7));
    outer.advance();
    assert_eq!(outer.get(), Some(&7));

    outer.stop();
    assert_eq!(outer.state(), State::Cancelled);
    assert_eq!(counter.dropped(), 1);
}

fn finished_stack_is_reused<S: Switch>() {
    // a size no other test asks for
    let stack_size = MIN_STACK_SIZE + 5 * stack::page_size();
    let gen = Builder::new()
        .switch::<S>()
        .stack_size(stack_size)
        .spawn(|y| y.yield_value(()))
        .unwrap();
    let len = gen.stack_size();
    let pooled = stack::pooled_in_thread(len);

    drop(gen);
    assert_eq!(stack::pooled_in_thread(len), pooled + 1);

    let again = Builder::new()
        .switch::<S>()
        .stack_size(stack_size)
        .spawn(|y| y.yield_value(()))
        .unwrap();
    assert_eq!(again.stack_size(), len);
    assert_eq!(stack::pooled_in_thread(len), pooled);
}

fn huge_stack_is_refused<S: Switch>() {
    let res = Builder::new()
        .switch::<S>()
        .stack_size(usize::MAX)
        .spawn(|y| y.yield_value(0u8));
    assert!(res.is_err());
}

fn outer_yielder_in_inner_body_stops<S: Switch>() {
    let counter = DropCounter::default();
    let rounds = Cell::new(0);
    let mut outer = spawn::<S, _, _>(|y| {
        let _token = counter.token();
        loop {
            rounds.set(rounds.get() + 1);
            // the inner body suspends the outer coroutine from its own stack
            spawn::<S, (), _>(|_| y.yield_value(1u8));
        }
    });
    assert_eq!(outer.get(), Some(&1));
    outer.advance();
    assert_eq!(rounds.get(), 2);

    outer.stop();
    assert!(outer.stopped());
    assert_eq!(outer.state(), State::Cancelled);
    assert_eq!(counter.dropped(), 1);
    assert_eq!(rounds.get(), 2);
}

fn outer_yielder_in_inner_body_drops<S: Switch>() {
    let counter = DropCounter::default();
    let outer = spawn::<S, _, _>(|y| {
        let _token = counter.token();
        loop {
            spawn::<S, (), _>(|_| y.yield_value(1u8));
        }
    });
    assert_eq!(outer.get(), Some(&1));
    drop(outer);
    assert_eq!(counter.dropped(), 1);
}

fn panic_while_stopping<S: Switch>() {
    let mut gen = spawn::<S, _, _>(|y| {
        let mut v = 0u8;
        let _ = panic::catch_unwind(AssertUnwindSafe(|| y.yield_(&mut v)));
        panic!("late");
    });

    let err = panic::catch_unwind(AssertUnwindSafe(|| gen.stop())).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"late"));
    assert!(gen.stopped());
    assert_eq!(gen.get(), None);

    // reported once
    gen.stop();
    drop(gen);
}

fn drop_during_unrelated_panic<S: Switch>() {
    let late = Cell::new(false);
    let gen = spawn::<S, _, _>(|y| {
        let mut v = 0u8;
        let _ = panic::catch_unwind(AssertUnwindSafe(|| y.yield_(&mut v)));
        late.set(true);
        panic!("late");
    });

    let err = panic::catch_unwind(AssertUnwindSafe(|| {
        let _gen = gen;
        panic!("unrelated");
    }))
    .unwrap_err();
    assert_eq!(err.downcast_ref::<&str>(), Some(&"unrelated"));
    assert!(late.get());
}

fn caught_stop_then_return<S: Switch>() {
    let cancelled = metrics().coroutine_count(CoroutineEvent::Cancelled);
    let mut gen = spawn::<S, _, _>(|y| {
        let mut v = 0u8;
        let _ = panic::catch_unwind(AssertUnwindSafe(|| y.yield_(&mut v)));
    });
    gen.stop();
    assert!(gen.stopped());
    assert_eq!(gen.state(), State::Cancelled);
    assert!(metrics().coroutine_count(CoroutineEvent::Cancelled) > cancelled);
}

/// A backend that can never create an execution point.
struct Unpreparable;

unsafe impl Switch for Unpreparable {
    unsafe fn prepare<E: EntryPoint<Self>>(_: &StackRegion) -> Result<Self, Error> {
        Err(Error::new(ErrorKind::Other, "no execution point"))
    }

    unsafe fn switch(self, _: usize) -> (Self, usize) {
        unreachable!("never prepared")
    }
}

#[test_log::test]
fn failed_prepare_recycles_stack_test() {
    // a size no other test asks for
    let stack_size = MIN_STACK_SIZE + 9 * stack::page_size();
    let len = stack::fetch_or_acquire(stack_size).unwrap().len();
    let pooled = stack::pooled_in_thread(len);

    let err = Builder::new()
        .switch::<Unpreparable>()
        .stack_size(stack_size)
        .spawn(|y| y.yield_value(0u8))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Other);
    assert_eq!(stack::pooled_in_thread(len), pooled + 1);
}

#[test_log::test]
fn exit_skips_destructors_test() {
    let counter = DropCounter::default();
    let c = counter.clone();
    let mut gen = spawn::<Fcontext, _, _>(move |y| {
        let _token = c.token();
        y.yield_value(1u8);
        unsafe { y.exit() }
    });
    gen.advance();
    assert!(gen.stopped());
    assert_eq!(gen.state(), State::Finished);
    drop(gen);
    assert_eq!(counter.dropped(), 0);
}

// the default size may be picked up while the env test runs
#[serial_test::serial]
#[test_log::test]
fn default_builder_test() {
    let gen = Builder::default()
        .name("letters")
        .spawn(|y| {
            for c in ['a', 'b'] {
                y.yield_value(c);
            }
        })
        .unwrap();
    assert_eq!(gen.name(), Some("letters"));
    assert!(gen.to_string().contains("(letters)"));
    assert_eq!(gen.stack_size(), crate::config::default_stack_size());
    assert_eq!(gen.into_iter().collect::<String>(), "ab");
}
