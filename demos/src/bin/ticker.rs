use std::cell::Cell;
use std::ops::ControlFlow;
use std::rc::Rc;

use millet::{after, every, park, run, unpark, yield_now, Wakeup, NEVER};

fn main() {
    let ticks = Rc::new(Cell::new(0));
    let waiter = millet::co(|| match park(NEVER) {
        Wakeup::Unparked => println!("ticker finished"),
        other => println!("woken by {:?}", other),
    });

    let counter = ticks.clone();
    every(20, move || {
        counter.set(counter.get() + 1);
        println!("tick {}", counter.get());
        if counter.get() < 5 {
            return ControlFlow::Continue(());
        }
        unpark(waiter);
        ControlFlow::Break(())
    });

    after(30, || println!("half way"));
    millet::co(|| {
        for i in 0..3 {
            println!("busy {}", i);
            yield_now();
        }
    });
    run();
    assert_eq!(5, ticks.get());
}
