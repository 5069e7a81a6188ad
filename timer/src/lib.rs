//! Millisecond deadlines on a monotonic clock, and the ordered queue of
//! pending wakeups the scheduler drives its sleeps from.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Absolute point in time, in milliseconds.
pub type Deadline = i64;

/// The deadline that never expires.
pub const NEVER: Deadline = -1;

/// Alias of [`NEVER`].
pub const NO_DEADLINE: Deadline = NEVER;

// The clock is monotonic but starts at the wall clock of first use, so a
// valid deadline is always far away from the sentinel.
static ANCHOR: Lazy<(Instant, i64)> = Lazy::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    (Instant::now(), wall.max(1))
});

/// Current time in milliseconds.
#[inline]
pub fn now() -> Deadline {
    let (instant, wall) = *ANCHOR;
    wall.saturating_add(instant.elapsed().as_millis() as i64)
}

/// The deadline `millis` milliseconds from now.
///
/// A negative duration yields a deadline that is already due; it never turns
/// into [`NEVER`].
#[inline]
pub fn deadline_after(millis: i64) -> Deadline {
    now().saturating_add(millis).max(0)
}

/// How long to block until `deadline`, `None` meaning forever.
pub fn timeout_until(deadline: Deadline) -> Option<Duration> {
    if deadline == NEVER {
        return None;
    }
    let left = deadline.saturating_sub(now()).max(0);
    Some(Duration::from_millis(left as u64))
}

/// All items sharing one deadline, in insertion order.
#[derive(Debug)]
struct TimerEntry<T> {
    dequeue: VecDeque<T>,
}

impl<T: PartialEq> TimerEntry<T> {
    fn new() -> Self {
        TimerEntry {
            dequeue: VecDeque::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.dequeue.is_empty()
    }

    fn push_back(&mut self, t: T) {
        self.dequeue.push_back(t)
    }

    fn remove(&mut self, t: &T) -> bool {
        match self.dequeue.iter().position(|x| x == t) {
            Some(i) => self.dequeue.remove(i).is_some(),
            None => false,
        }
    }
}

/// Pending wakeups ordered by deadline.
///
/// Entries are bucketed per deadline in a sorted map, so the earliest
/// deadline is always the first key. Every item is registered at most once;
/// inserting it again moves it.
#[derive(Debug)]
pub struct TimerList<T> {
    buckets: BTreeMap<Deadline, TimerEntry<T>>,
    index: HashMap<T, Deadline>,
}

impl<T: Copy + Eq + Hash> TimerList<T> {
    pub fn new() -> Self {
        TimerList {
            buckets: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Number of registered items.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Registers `t` to fire at `time`.
    ///
    /// Returns false, and leaves `t` unregistered, for [`NEVER`].
    pub fn insert(&mut self, time: Deadline, t: T) -> bool {
        self.cancel(&t);
        if time == NEVER {
            return false;
        }
        self.buckets
            .entry(time)
            .or_insert_with(TimerEntry::new)
            .push_back(t);
        self.index.insert(t, time);
        true
    }

    /// Removes `t` if it is registered. Cancelling twice is a no-op.
    pub fn cancel(&mut self, t: &T) -> bool {
        let time = match self.index.remove(t) {
            Some(time) => time,
            None => return false,
        };
        if let Some(entry) = self.buckets.get_mut(&time) {
            entry.remove(t);
            if entry.is_empty() {
                self.buckets.remove(&time);
            }
        }
        true
    }

    /// Removes and returns every item due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Deadline) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > now {
                break;
            }
            for t in entry.remove().dequeue {
                self.index.remove(&t);
                due.push(t);
            }
        }
        due
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Deadline> {
        self.buckets.keys().next().copied()
    }
}

impl<T: Copy + Eq + Hash> Default for TimerList<T> {
    fn default() -> Self {
        TimerList::new()
    }
}
