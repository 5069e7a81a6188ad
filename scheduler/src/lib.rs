//! Single threaded cooperative scheduler for stackful coroutines.
//!
//! A [`Scheduler`] owns everything its coroutines need: the FIFO ready queue,
//! the deadline queue of sleepers, the stack pool and the [`Waiter`] it
//! blocks in when nobody is ready. Coroutines only give up the CPU at
//! [`yield_now`](Scheduler::yield_now), [`sleep`](Scheduler::sleep),
//! [`park`](Scheduler::park) and [`fd_wait`](Scheduler::fd_wait).
//!
//! Every OS thread has a default instance, created on first use by
//! [`Scheduler::current`] and never torn down. While [`Scheduler::run`] is
//! executing, the running instance is the *active* one, which is what
//! [`Scheduler::with_active`] hands out to code inside coroutines.

mod config;

pub mod waiter;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::panic;
use std::ptr;
use std::time::Duration;

use coroutine::{Context, Coroutine, Payload};
use id_generator::IdGenerator;
use stack_pool::{PoolStats, Stack, StackError, StackPool};
use timer::TimerList;
use tracing::{debug, info, trace, warn};

pub use coroutine::{CoroutineId, Status};
pub use timer::{Deadline, NEVER, NO_DEADLINE};

pub use crate::config::Config;
pub use crate::waiter::{Event, Interest, PollWaiter, Readiness, Registration, Waiter};

// Switches between two non-blocking I/O checks while coroutines are ready.
const IO_POLL_INTERVAL: u32 = 103;

thread_local! {
    static SCHEDULER: &'static Scheduler = Box::leak(Box::new(Scheduler::default()));
    static ACTIVE: Cell<*const Scheduler> = Cell::new(ptr::null());
}

/// Spawning a coroutine failed; no coroutine was created.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to allocate coroutine stack: {0}")]
    Stack(#[from] StackError),
}

/// Why a suspended coroutine was resumed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Wakeup {
    /// Its deadline passed.
    TimedOut,
    /// Someone called [`Scheduler::unpark`] on it.
    Unparked,
    /// The descriptor it waited on became ready.
    Io(Readiness),
}

/// One live coroutine as reported by [`Scheduler::dump`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CoroutineInfo {
    pub id: CoroutineId,
    pub status: Status,
    /// `NEVER` unless the coroutine waits with a deadline.
    pub deadline: Deadline,
}

#[derive(Debug, Copy, Clone)]
enum Blocker {
    Park,
    Io(Registration),
}

pub struct Scheduler {
    id: usize,
    // boxed so coroutines can keep pointing at it while the scheduler moves
    root: Box<UnsafeCell<Context>>,
    stack_size: Cell<usize>,
    inner: RefCell<Inner>,
}

struct Inner {
    coroutines: HashMap<CoroutineId, Box<Coroutine>>,
    ready: VecDeque<CoroutineId>,
    //正在执行的协程id
    running: Option<CoroutineId>,
    suspend: TimerList<CoroutineId>,
    blocked: BTreeMap<CoroutineId, Blocker>,
    wakeups: HashMap<CoroutineId, Wakeup>,
    stacks: StackPool,
    waiter: Box<dyn Waiter>,
    //距离上一次检查I/O的切换次数
    ticks: u32,
}

impl Inner {
    fn make_ready(&mut self, id: CoroutineId, wakeup: Wakeup) {
        if let Some(coroutine) = self.coroutines.get_mut(&id) {
            coroutine.set_status(Status::Ready).set_deadline(NEVER);
            self.wakeups.insert(id, wakeup);
            self.ready.push_back(id);
        }
    }

    //移动至"就绪"队列
    fn wake_due(&mut self) {
        self.ticks += 1;
        if self.ticks >= IO_POLL_INTERVAL {
            self.ticks = 0;
            self.wait_io(Some(Duration::ZERO));
        }
        if self.suspend.is_empty() {
            return;
        }
        for id in self.suspend.pop_due(timer::now()) {
            trace!(%id, "deadline reached");
            self.blocked.remove(&id);
            self.make_ready(id, Wakeup::TimedOut);
        }
    }

    fn waits_for_io(&self) -> bool {
        self.blocked.values().any(|b| matches!(b, Blocker::Io(_)))
    }

    /// Waits at most `timeout` for the registered descriptors and readies
    /// every coroutine whose descriptor fired.
    fn wait_io(&mut self, timeout: Option<Duration>) {
        let (ids, interests): (Vec<CoroutineId>, Vec<Registration>) = self
            .blocked
            .iter()
            .filter_map(|(id, blocker)| match blocker {
                Blocker::Io(registration) => Some((*id, *registration)),
                Blocker::Park => None,
            })
            .unzip();
        if interests.is_empty() && timeout == Some(Duration::ZERO) {
            return;
        }
        trace!(?timeout, fds = interests.len(), "waiting for I/O");
        let events = match self.waiter.wait(&interests, timeout) {
            Ok(events) => events,
            Err(e) => panic!("waiting for timers and I/O failed: {}", e),
        };
        for event in events {
            let id = ids[event.index];
            self.suspend.cancel(&id);
            self.blocked.remove(&id);
            self.make_ready(id, Wakeup::Io(event.readiness));
        }
    }

    fn ready_next(&mut self) -> Option<CoroutineId> {
        self.wake_due();
        self.ready.pop_front()
    }

    fn coroutine(&mut self, id: CoroutineId) -> &mut Coroutine {
        match self.coroutines.get_mut(&id) {
            Some(coroutine) => coroutine,
            None => panic!("unknown coroutine {}", id),
        }
    }
}

/// Restores the previously active scheduler when `run` returns or unwinds.
struct ActiveGuard {
    previous: *const Scheduler,
}

impl ActiveGuard {
    fn enter(scheduler: &Scheduler) -> Self {
        let previous = ACTIVE.with(|active| active.replace(scheduler));
        ActiveGuard { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        Scheduler::with_waiter(config, Box::new(PollWaiter::new()))
    }

    pub fn with_waiter(config: Config, waiter: Box<dyn Waiter>) -> Self {
        Scheduler {
            id: IdGenerator::next_id("scheduler"),
            root: Box::new(UnsafeCell::new(Context::empty())),
            stack_size: Cell::new(config.stack_size()),
            inner: RefCell::new(Inner {
                coroutines: HashMap::new(),
                ready: VecDeque::new(),
                running: None,
                suspend: TimerList::new(),
                blocked: BTreeMap::new(),
                wakeups: HashMap::new(),
                stacks: StackPool::with_protection(config.stack_count(), config.guard_pages()),
                waiter,
                ticks: 0,
            }),
        }
    }

    /// The default scheduler of the calling thread, created on first use.
    pub fn current() -> &'static Scheduler {
        SCHEDULER.with(|scheduler| *scheduler)
    }

    /// Calls `f` with the scheduler whose `run` loop is executing on this
    /// thread, or with [`Scheduler::current`] outside of any `run`.
    pub fn with_active<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        let active = ACTIVE.with(Cell::get);
        if active.is_null() {
            f(Scheduler::current())
        } else {
            // set by `run`, which outlives every coroutine it resumes
            f(unsafe { &*active })
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Queues `work` as a new coroutine with the default stack size.
    ///
    /// The caller keeps running; the coroutine starts once the caller
    /// suspends or `run` reaches it.
    pub fn spawn<F>(&self, work: F) -> Result<CoroutineId, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_with_stack_size(self.stack_size.get(), work)
    }

    pub fn spawn_with_stack_size<F>(&self, size: usize, work: F) -> Result<CoroutineId, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let stack = inner.stacks.acquire(size)?;
        let coroutine = Coroutine::new(stack, Box::new(work), self.root.get());
        let id = coroutine.id();
        debug!(%id, stack = coroutine.stack_len(), "coroutine spawned");
        inner.coroutines.insert(id, coroutine);
        inner.ready.push_back(id);
        Ok(id)
    }

    /// Fills the stack cache with `stack_count` stacks of `stack_size` bytes
    /// and makes `stack_size` the default for later spawns.
    ///
    /// Returns how many stacks could actually be allocated. A size no stack
    /// can have leaves the default stack size unchanged.
    pub fn preallocate(&self, stack_count: usize, stack_size: usize) -> usize {
        let mut inner = self.inner.borrow_mut();
        let count = inner.stacks.preallocate(stack_count, stack_size);
        if Stack::usable_size(stack_size, inner.stacks.is_protected()).is_ok() {
            self.stack_size.set(stack_size);
        } else {
            warn!(stack_size, kept = self.stack_size.get(), "invalid stack size not adopted");
        }
        count
    }

    /// Runs coroutines until none is ready and nothing is left to wait for.
    ///
    /// When no coroutine is ready but a sleeper or an I/O wait is pending,
    /// the thread blocks in the [`Waiter`] until the earliest deadline or
    /// readiness. Coroutines parked without a deadline and without an I/O
    /// wait cannot be woken by anyone once the loop is idle; they are left
    /// suspended and `run` returns.
    ///
    /// If a coroutine panics, its stack is reclaimed and the panic resumes
    /// here; the remaining coroutines stay queued for the next `run`.
    ///
    /// # Panics
    ///
    /// Panics when called from inside one of this scheduler's coroutines.
    pub fn run(&self) {
        assert!(
            self.inner.borrow().running.is_none(),
            "run called from inside a coroutine"
        );
        let _active = ActiveGuard::enter(self);
        debug!(scheduler = self.id, "run loop started");
        loop {
            let next = self.inner.borrow_mut().ready_next();
            match next {
                Some(id) => {
                    self.switch_from_root(id);
                    if let Some(payload) = self.reclaim() {
                        panic::resume_unwind(payload);
                    }
                }
                None => {
                    if !self.block() {
                        break;
                    }
                }
            }
        }
        let stranded = self.len();
        if stranded > 0 {
            warn!(scheduler = self.id, stranded, "run loop idle with coroutines suspended forever");
        }
        debug!(scheduler = self.id, "run loop finished");
    }

    /// Lets every other ready coroutine run before the caller continues.
    ///
    /// Returns at once when no other coroutine is ready.
    ///
    /// # Panics
    ///
    /// Panics outside of a coroutine.
    pub fn yield_now(&self) {
        let id = self.running_or_panic("yield_now");
        {
            let mut inner = self.inner.borrow_mut();
            inner.wake_due();
            if inner.ready.is_empty() {
                return;
            }
            inner.coroutine(id).set_status(Status::Ready);
            inner.ready.push_back(id);
        }
        self.switch_away();
        self.inner.borrow_mut().wakeups.remove(&id);
    }

    /// Suspends the calling coroutine until `deadline`.
    ///
    /// `NEVER` registers no timer at all: only [`unpark`](Scheduler::unpark)
    /// can resume the coroutine then, so never pass it without someone
    /// holding on to the coroutine's id.
    ///
    /// # Panics
    ///
    /// Panics outside of a coroutine.
    pub fn sleep(&self, deadline: Deadline) {
        self.suspend_current("sleep", Status::Sleeping, deadline, None);
    }

    /// Sleeps for `millis` milliseconds. A negative duration only lets the
    /// other ready coroutines run once.
    pub fn nap(&self, millis: i64) {
        self.sleep(timer::deadline_after(millis))
    }

    /// Blocks the calling coroutine until it is unparked or `deadline` passes.
    pub fn park(&self, deadline: Deadline) -> Wakeup {
        self.suspend_current("park", Status::Blocked, deadline, Some(Blocker::Park))
    }

    /// Blocks the calling coroutine until `fd` is ready for `interest`, it is
    /// unparked, or `deadline` passes.
    pub fn fd_wait(&self, fd: RawFd, interest: Interest, deadline: Deadline) -> Wakeup {
        let registration = Registration { fd, interest };
        self.suspend_current(
            "fd_wait",
            Status::Blocked,
            deadline,
            Some(Blocker::Io(registration)),
        )
    }

    /// Makes a sleeping or blocked coroutine ready again, cancelling its
    /// timer. Returns false, doing nothing, for any other coroutine.
    pub fn unpark(&self, id: CoroutineId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let suspended = matches!(
            inner.coroutines.get(&id).map(|c| c.status()),
            Some(Status::Sleeping) | Some(Status::Blocked)
        );
        if !suspended {
            return false;
        }
        inner.suspend.cancel(&id);
        inner.blocked.remove(&id);
        inner.make_ready(id, Wakeup::Unparked);
        trace!(%id, "unparked");
        true
    }

    /// The coroutine currently executing, `None` in the run loop itself.
    pub fn running(&self) -> Option<CoroutineId> {
        self.inner.borrow().running
    }

    /// Status of a live coroutine; finished coroutines are forgotten.
    pub fn status(&self, id: CoroutineId) -> Option<Status> {
        self.inner.borrow().coroutines.get(&id).map(|c| c.status())
    }

    /// Number of live coroutines.
    pub fn len(&self) -> usize {
        self.inner.borrow().coroutines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default stack size of new coroutines.
    pub fn stack_size(&self) -> usize {
        self.stack_size.get()
    }

    pub fn stack_stats(&self) -> PoolStats {
        self.inner.borrow().stacks.stats()
    }

    /// Logs every live coroutine and returns them ordered by id.
    pub fn dump(&self) -> Vec<CoroutineInfo> {
        let inner = self.inner.borrow();
        let mut live: Vec<CoroutineInfo> = inner
            .coroutines
            .values()
            .map(|c| CoroutineInfo {
                id: c.id(),
                status: c.status(),
                deadline: c.deadline(),
            })
            .collect();
        live.sort_by_key(|info| info.id);
        info!(
            scheduler = self.id,
            live = live.len(),
            ready = inner.ready.len(),
            timers = inner.suspend.len(),
            "coroutine dump"
        );
        for c in &live {
            info!(id = %c.id, status = ?c.status, deadline = c.deadline);
        }
        live
    }

    fn running_or_panic(&self, op: &str) -> CoroutineId {
        match self.inner.borrow().running {
            Some(id) => id,
            None => panic!("{} called outside of a coroutine", op),
        }
    }

    fn suspend_current(
        &self,
        op: &str,
        status: Status,
        deadline: Deadline,
        blocker: Option<Blocker>,
    ) -> Wakeup {
        let id = self.running_or_panic(op);
        {
            let mut inner = self.inner.borrow_mut();
            inner.coroutine(id).set_status(status).set_deadline(deadline);
            inner.suspend.insert(deadline, id);
            if let Some(blocker) = blocker {
                inner.blocked.insert(id, blocker);
            }
            trace!(%id, ?status, deadline, "suspending");
        }
        self.switch_away();
        self.inner
            .borrow_mut()
            .wakeups
            .remove(&id)
            .unwrap_or(Wakeup::TimedOut)
    }

    /// Leaves the running coroutine, which has already queued itself
    /// wherever it waits, for the next ready one or the run loop.
    fn switch_away(&self) {
        let (from, to) = {
            let mut inner = self.inner.borrow_mut();
            let current = match inner.running {
                Some(id) => id,
                None => panic!("switch away from the run loop"),
            };
            inner.wake_due();
            let from = inner.coroutine(current).context_mut();
            match inner.ready.pop_front() {
                Some(next) if next == current => {
                    // its condition resolved before it even left
                    inner.coroutine(current).resume_target();
                    return;
                }
                Some(next) => {
                    trace!(from = %current, to = %next, "switch");
                    inner.running = Some(next);
                    (from, inner.coroutine(next).resume_target())
                }
                None => {
                    inner.running = None;
                    (from, self.root.get() as *const Context)
                }
            }
        };
        unsafe { Context::switch(from, to) };
    }

    fn switch_from_root(&self, id: CoroutineId) {
        let to = {
            let mut inner = self.inner.borrow_mut();
            inner.running = Some(id);
            inner.coroutine(id).resume_target()
        };
        trace!(to = %id, "switch from run loop");
        unsafe { Context::switch(self.root.get(), to) };
    }

    /// Frees the coroutine that just switched back to the run loop by
    /// finishing, returning its panic if it had one.
    fn reclaim(&self) -> Option<Payload> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.running?;
        let done = inner.coroutines.get(&id).map_or(false, |c| c.is_done());
        debug_assert!(done, "run loop resumed by live coroutine {}", id);
        if !done {
            return None;
        }
        inner.running = None;
        inner.wakeups.remove(&id);
        let mut coroutine = inner.coroutines.remove(&id)?;
        if let Some(stack) = coroutine.take_stack() {
            inner.stacks.release(stack);
        }
        debug!(%id, "coroutine finished");
        coroutine.take_panic()
    }

    /// Blocks until a deadline passes or a descriptor becomes ready.
    ///
    /// Returns false when there is nothing to wait for.
    fn block(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.suspend.next_deadline();
        if deadline.is_none() && !inner.waits_for_io() {
            return false;
        }
        inner.ticks = 0;
        inner.wait_io(deadline.and_then(timer::timeout_until));
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(Config::default())
    }
}
