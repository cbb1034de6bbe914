use std::cell::Cell;
use std::io::BufRead;

use stackgen::{Coroutine, Generator, Yielder};

struct FunctionObject {
    x: Cell<i32>,
}

impl FunctionObject {
    fn run(&self, y: Yielder<'_, i32>) {
        loop {
            y.yield_value(self.x.get());
        }
    }
}

fn fibonacci() {
    let fib = Generator::new(|y| {
        let (mut a, mut b) = (0u64, 1u64);
        loop {
            y.yield_(&mut a);
            (a, b) = (b, a + b);
        }
    })
    .unwrap();

    let below: Vec<String> = fib
        .into_iter()
        .take_while(|n| *n < 100)
        .map(|n| n.to_string())
        .collect();
    println!("fibonacci: {}", below.join(" "));
}

fn function_object() {
    let object = FunctionObject { x: Cell::new(10) };
    let body = |y: Yielder<'_, i32>| object.run(y);
    let mut co = Coroutine::new(&body).unwrap();

    for next in [20, 30] {
        println!("function object: {}", co.get().unwrap());
        object.x.set(next);
        co.advance();
    }
    println!("function object: {}", co.get().unwrap());
}

fn echo() {
    let mut printer = Generator::new(|y| {
        let mut line = String::new();
        loop {
            y.yield_(&mut line);
            if line == "Stop" {
                break;
            }
            println!("echo: {line}");
        }
    })
    .unwrap();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap();
        let Some(slot) = printer.get_mut() else {
            break;
        };
        *slot = line.trim_end().to_owned();
        printer.advance();
        if printer.stopped() {
            break;
        }
    }
}

fn main() {
    fibonacci();
    function_object();
    println!("type lines to echo, Stop to quit");
    echo();
}
