use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use scheduler::{Config, Interest, Scheduler, Status, Wakeup, NEVER};

fn scheduler() -> Rc<Scheduler> {
    Rc::new(Scheduler::new(Config::default().with_stack_size(64 * 1024)))
}

#[test]
fn every_coroutine_completes_once() {
    let scheduler = scheduler();
    let counts = Rc::new(RefCell::new(vec![0; 32]));
    for i in 0..32 {
        let counts = counts.clone();
        let s = scheduler.clone();
        scheduler
            .spawn(move || {
                if i % 3 == 0 {
                    s.yield_now();
                }
                if i % 5 == 0 {
                    s.nap(i as i64 % 7);
                }
                counts.borrow_mut()[i] += 1;
            })
            .unwrap();
    }
    scheduler.run();
    assert!(counts.borrow().iter().all(|&n| n == 1));
    assert!(scheduler.is_empty());
}

#[test]
fn short_sleep_finishes_first() {
    let scheduler = scheduler();
    let counter = Rc::new(Cell::new(0));
    let finished = Rc::new(RefCell::new(Vec::new()));
    for (name, millis) in [("long", 50), ("short", 10)] {
        let counter = counter.clone();
        let finished = finished.clone();
        let s = scheduler.clone();
        scheduler
            .spawn(move || {
                s.nap(millis);
                counter.set(counter.get() + 1);
                finished.borrow_mut().push((name, counter.get()));
            })
            .unwrap();
    }
    scheduler.run();
    assert_eq!(vec![("short", 1), ("long", 2)], *finished.borrow());
}

#[test]
fn preallocated_stacks_cover_spawns() {
    let scheduler = scheduler();
    assert_eq!(10, scheduler.preallocate(10, 64 * 1024));
    assert_eq!(64 * 1024, scheduler.stack_size());
    let before = scheduler.stack_stats();
    assert_eq!(10, before.cached);

    let done = Rc::new(Cell::new(0));
    for _ in 0..10 {
        let done = done.clone();
        let s = scheduler.clone();
        scheduler
            .spawn(move || {
                s.yield_now();
                done.set(done.get() + 1);
            })
            .unwrap();
    }
    let during = scheduler.stack_stats();
    assert_eq!(before.allocations, during.allocations);
    assert_eq!(10, during.reuses);
    assert_eq!(0, during.cached);

    scheduler.run();
    assert_eq!(10, done.get());
    let after = scheduler.stack_stats();
    assert_eq!(before.allocations, after.allocations);
    assert_eq!(10, after.cached);
}

#[test]
fn sleeping_status_is_visible() {
    let scheduler = scheduler();
    let s = scheduler.clone();
    let sleeper = scheduler.spawn(move || s.nap(5)).unwrap();
    let s = scheduler.clone();
    scheduler
        .spawn(move || {
            assert_eq!(Some(Status::Sleeping), s.status(sleeper));
            assert_ne!(Some(sleeper), s.running());
        })
        .unwrap();
    scheduler.run();
    assert_eq!(None, scheduler.status(sleeper));
}

#[test]
fn unpark_is_idempotent() {
    let scheduler = scheduler();
    let wakeups = Rc::new(RefCell::new(Vec::new()));
    let (s, w) = (scheduler.clone(), wakeups.clone());
    let parked = scheduler
        .spawn(move || {
            w.borrow_mut().push(s.park(timer::deadline_after(60_000)));
            w.borrow_mut().push(s.park(timer::deadline_after(1)));
        })
        .unwrap();
    let s = scheduler.clone();
    scheduler
        .spawn(move || {
            assert!(s.unpark(parked));
            assert!(!s.unpark(parked));
            assert!(!s.unpark(parked));
        })
        .unwrap();
    let start = Instant::now();
    scheduler.run();
    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(vec![Wakeup::Unparked, Wakeup::TimedOut], *wakeups.borrow());
    assert!(!scheduler.unpark(parked));
}

#[test]
fn fd_wait_wakes_on_readiness() {
    let scheduler = scheduler();
    let (mut writer, mut reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));
    let (s, r) = (scheduler.clone(), received.clone());
    scheduler
        .spawn(move || {
            let mut buf = [0u8; 16];
            loop {
                match reader.read(&mut buf) {
                    Ok(n) => {
                        r.borrow_mut().extend_from_slice(&buf[..n]);
                        return;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        let wakeup = s.fd_wait(reader.as_raw_fd(), Interest::Readable, NEVER);
                        assert!(matches!(wakeup, Wakeup::Io(readiness) if readiness.readable));
                    }
                    Err(e) => panic!("read failed: {}", e),
                }
            }
        })
        .unwrap();
    let s = scheduler.clone();
    scheduler
        .spawn(move || {
            s.nap(10);
            writer.write_all(b"ping").unwrap();
        })
        .unwrap();
    scheduler.run();
    assert_eq!(b"ping".to_vec(), *received.borrow());
}

#[test]
fn fd_wait_wakes_while_others_spin() {
    let scheduler = scheduler();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    let seen = Rc::new(Cell::new(false));
    let (s, flag) = (scheduler.clone(), seen.clone());
    scheduler
        .spawn(move || {
            let wakeup = s.fd_wait(reader.as_raw_fd(), Interest::Readable, NEVER);
            assert!(matches!(wakeup, Wakeup::Io(readiness) if readiness.readable));
            flag.set(true);
        })
        .unwrap();
    let (s, flag) = (scheduler.clone(), seen.clone());
    scheduler
        .spawn(move || {
            let start = Instant::now();
            while !flag.get() {
                assert!(
                    start.elapsed() < Duration::from_secs(5),
                    "readiness never observed while yielding"
                );
                s.yield_now();
            }
        })
        .unwrap();
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        writer.write_all(b"x").unwrap();
    });
    scheduler.run();
    writer.join().unwrap();
    assert!(seen.get());
    assert!(scheduler.is_empty());
}

#[test]
fn failed_preallocation_is_not_fatal() {
    let scheduler = scheduler();
    assert_eq!(0, scheduler.preallocate(1, usize::MAX));
    assert_eq!(64 * 1024, scheduler.stack_size());
    assert!(scheduler.spawn(|| {}).is_ok());
    scheduler.run();
    assert!(scheduler.is_empty());
}

#[test]
fn fd_wait_times_out() {
    let scheduler = scheduler();
    let (_writer, reader) = UnixStream::pair().unwrap();
    let result = Rc::new(Cell::new(None));
    let (s, r) = (scheduler.clone(), result.clone());
    scheduler
        .spawn(move || {
            let deadline = timer::deadline_after(10);
            r.set(Some(s.fd_wait(reader.as_raw_fd(), Interest::Readable, deadline)));
        })
        .unwrap();
    scheduler.run();
    assert_eq!(Some(Wakeup::TimedOut), result.get());
}

#[test]
fn schedulers_are_independent() {
    let first = scheduler();
    let second = scheduler();
    let order = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        let second = second.clone();
        first
            .spawn(move || {
                order.borrow_mut().push("first");
                let inner = order.clone();
                second.spawn(move || inner.borrow_mut().push("second")).unwrap();
            })
            .unwrap();
    }
    first.run();
    assert_eq!(1, second.len());
    second.run();
    assert_eq!(vec!["first", "second"], *order.borrow());
    assert_ne!(first.id(), second.id());
}

#[test]
#[should_panic(expected = "run called from inside a coroutine")]
fn run_inside_coroutine_panics() {
    let scheduler = scheduler();
    let s = scheduler.clone();
    scheduler.spawn(move || s.run()).unwrap();
    scheduler.run();
}

#[test]
#[should_panic(expected = "park called outside of a coroutine")]
fn park_outside_coroutine_panics() {
    scheduler().park(NEVER);
}
