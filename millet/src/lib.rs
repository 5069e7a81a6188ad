//! Lightweight stackful coroutines with cooperative scheduling.
//!
//! ```no_run
//! use millet::{co, nap, run};
//!
//! co(|| {
//!     nap(50);
//!     println!("world");
//! });
//! co(|| println!("hello"));
//! run();
//! ```
//!
//! Every function here acts on the scheduler whose [`run`] loop is executing
//! on the calling thread, or on the thread's default scheduler when called
//! outside of one. Coroutines never migrate between threads.

use std::ops::ControlFlow;
use std::os::unix::io::RawFd;

use tracing::trace;

pub use scheduler::{
    Config, CoroutineId, CoroutineInfo, Interest, Readiness, Scheduler, SpawnError, Status,
    Wakeup,
};
pub use timer::{Deadline, NEVER, NO_DEADLINE};

/// Durations are plain milliseconds.
pub type Duration = i64;

/// Current time in milliseconds, on the clock deadlines are measured with.
pub fn now() -> Deadline {
    timer::now()
}

/// Runs `work` in a new coroutine.
///
/// The coroutine starts once the caller suspends, or when [`run`] gets to it.
///
/// # Panics
///
/// Panics if no stack can be allocated for the coroutine; see [`try_co`].
pub fn co<F>(work: F) -> CoroutineId
where
    F: FnOnce() + 'static,
{
    match try_co(work) {
        Ok(id) => id,
        Err(e) => panic!("failed to spawn coroutine: {}", e),
    }
}

/// Like [`co`], but reports a failed stack allocation instead of panicking.
pub fn try_co<F>(work: F) -> Result<CoroutineId, SpawnError>
where
    F: FnOnce() + 'static,
{
    Scheduler::with_active(|s| s.spawn(work))
}

/// Runs `work` in a new coroutine after `delay` milliseconds.
pub fn after<F>(delay: Duration, work: F) -> CoroutineId
where
    F: FnOnce() + 'static,
{
    co(move || {
        nap(delay);
        work()
    })
}

/// Runs `work` in a new coroutine every `period` milliseconds, until it
/// returns [`ControlFlow::Break`].
///
/// The first call happens one period after the coroutine starts.
pub fn every<F>(period: Duration, mut work: F) -> CoroutineId
where
    F: FnMut() -> ControlFlow<()> + 'static,
{
    co(move || {
        let mut ticks = 0usize;
        loop {
            nap(period);
            ticks += 1;
            if work().is_break() {
                break;
            }
        }
        trace!(ticks, "periodic coroutine stopped");
    })
}

/// Sleeps for `duration` milliseconds; a negative duration just lets the
/// other ready coroutines run.
pub fn nap(duration: Duration) {
    Scheduler::with_active(|s| s.nap(duration))
}

/// Sleeps until `deadline`.
pub fn wake_up(deadline: Deadline) {
    Scheduler::with_active(|s| s.sleep(deadline))
}

/// Passes control to the other ready coroutines.
pub fn yield_now() {
    Scheduler::with_active(|s| s.yield_now())
}

/// Blocks until [`unpark`]ed or until `deadline`.
pub fn park(deadline: Deadline) -> Wakeup {
    Scheduler::with_active(|s| s.park(deadline))
}

/// Resumes a sleeping or parked coroutine; false if it was neither.
pub fn unpark(id: CoroutineId) -> bool {
    Scheduler::with_active(|s| s.unpark(id))
}

/// Blocks until `fd` is ready for `interest`, or until `deadline`.
pub fn fd_wait(fd: RawFd, interest: Interest, deadline: Deadline) -> Wakeup {
    Scheduler::with_active(|s| s.fd_wait(fd, interest, deadline))
}

/// The coroutine calling this, `None` outside of coroutines.
pub fn current() -> Option<CoroutineId> {
    Scheduler::with_active(|s| s.running())
}

/// Preallocates coroutine stacks. Returns the number of stacks that it
/// actually managed to allocate.
pub fn preallocate_coroutine_stacks(stack_count: usize, stack_size: usize) -> usize {
    Scheduler::with_active(|s| s.preallocate(stack_count, stack_size))
}

/// Logs every live coroutine of the scheduler through `tracing` and
/// returns them.
pub fn dump() -> Vec<CoroutineInfo> {
    Scheduler::with_active(|s| s.dump())
}

/// Runs coroutines until all of them finished or wait forever.
///
/// # Panics
///
/// Resumes the panic of a coroutine that panicked, and panics when called
/// from inside a coroutine.
pub fn run() {
    Scheduler::with_active(|s| s.run())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn dump_sees_parked_coroutine() {
        let parked = co(|| {
            park(NEVER);
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let out = seen.clone();
        co(move || {
            *out.borrow_mut() = dump();
            unpark(parked);
        });
        run();
        let seen = seen.borrow();
        assert_eq!(2, seen.len());
        assert_eq!(parked, seen[0].id);
        assert_eq!(Status::Blocked, seen[0].status);
        assert_eq!(NEVER, seen[0].deadline);
        assert!(dump().is_empty());
    }

    #[test]
    fn after_delays_start() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        after(10, move || o.borrow_mut().push("late"));
        let o = order.clone();
        co(move || o.borrow_mut().push("early"));
        let start = now();
        run();
        assert!(now() - start >= 9);
        assert_eq!(vec!["early", "late"], *order.borrow());
    }

    #[test]
    fn current_inside_and_outside() {
        assert_eq!(None, current());
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let id = co(move || *s.borrow_mut() = current());
        run();
        assert_eq!(Some(id), *seen.borrow());
    }
}
