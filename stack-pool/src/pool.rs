use std::collections::BTreeMap;

use crossbeam_deque::Worker;
use tracing::{debug, trace, warn};

use crate::stack::{Stack, StackError};

/// Counters describing what a [`StackPool`] has done so far.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    /// Stacks freshly mapped from the OS.
    pub allocations: usize,
    /// Requests served from the cache.
    pub reuses: usize,
    /// Stacks handed back through `release`.
    pub releases: usize,
    /// Stacks unmapped because the cache was full or evicted.
    pub deallocations: usize,
    /// Stacks currently sitting in the cache.
    pub cached: usize,
}

/// A bounded cache of coroutine stacks, bucketed by usable length.
#[derive(Debug)]
pub struct StackPool {
    //最多缓存的栈数量
    capacity: usize,
    protected: bool,
    //可用的栈，按大小分桶
    available: BTreeMap<usize, Worker<Stack>>,
    stats: PoolStats,
}

impl StackPool {
    pub fn new(capacity: usize) -> Self {
        StackPool::with_protection(capacity, true)
    }

    pub fn with_protection(capacity: usize, protected: bool) -> Self {
        StackPool {
            capacity,
            protected,
            available: BTreeMap::new(),
            stats: PoolStats::default(),
        }
    }

    /// Hands out a stack of at least `size` bytes.
    ///
    /// The smallest cached stack that is large enough is reused; otherwise a
    /// new one is mapped.
    pub fn acquire(&mut self, size: usize) -> Result<Stack, StackError> {
        let size = Stack::usable_size(size, self.protected)?;
        let cached = self
            .available
            .range_mut(size..)
            .find_map(|(_, bucket)| bucket.pop());
        if let Some(stack) = cached {
            self.stats.reuses += 1;
            self.stats.cached -= 1;
            trace!(len = stack.len(), "reused pooled stack");
            return Ok(stack);
        }
        //新申请栈
        let stack = Stack::allocate(size, self.protected)?;
        self.stats.allocations += 1;
        trace!(len = stack.len(), "allocated stack");
        Ok(stack)
    }

    /// Returns `stack` to the cache, or unmaps it when the cache is full.
    pub fn release(&mut self, stack: Stack) {
        self.stats.releases += 1;
        if self.stats.cached < self.capacity {
            self.push(stack);
        } else {
            self.stats.deallocations += 1;
            trace!(len = stack.len(), "pool full, unmapping stack");
        }
    }

    /// Fills the cache with `stack_count` stacks of `stack_size` bytes.
    ///
    /// The cache bound becomes `stack_count` and stacks of any other size are
    /// evicted. Allocation failures stop the fill early; the return value is
    /// the number of `stack_size` stacks that ended up cached.
    pub fn preallocate(&mut self, stack_count: usize, stack_size: usize) -> usize {
        self.capacity = stack_count;
        let size = match Stack::usable_size(stack_size, self.protected) {
            Ok(size) => size,
            Err(e) => {
                warn!(stack_size, "cannot preallocate stacks: {}", e);
                self.evict(|_| true);
                return 0;
            }
        };
        self.evict(|len| len != size);
        while self.bucket_len(size) > stack_count {
            if let Some(stack) = self.available.get(&size).and_then(Worker::pop) {
                self.stats.cached -= 1;
                self.stats.deallocations += 1;
                drop(stack);
            }
        }
        while self.bucket_len(size) < stack_count {
            match Stack::allocate(size, self.protected) {
                Ok(stack) => {
                    self.stats.allocations += 1;
                    self.push(stack);
                }
                Err(e) => {
                    warn!(
                        wanted = stack_count,
                        got = self.bucket_len(size),
                        "stack preallocation stopped: {}",
                        e
                    );
                    break;
                }
            }
        }
        let count = self.bucket_len(size);
        debug!(count, size, "preallocated stacks");
        count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    fn push(&mut self, stack: Stack) {
        self.available
            .entry(stack.len())
            .or_insert_with(Worker::new_lifo)
            .push(stack);
        self.stats.cached += 1;
    }

    fn bucket_len(&self, size: usize) -> usize {
        self.available.get(&size).map_or(0, Worker::len)
    }

    fn evict(&mut self, mut predicate: impl FnMut(usize) -> bool) {
        let stats = &mut self.stats;
        self.available.retain(|len, bucket| {
            if !predicate(*len) {
                return true;
            }
            while bucket.pop().is_some() {
                stats.cached -= 1;
                stats.deallocations += 1;
            }
            false
        });
    }
}

impl Default for StackPool {
    fn default() -> Self {
        StackPool::new(64)
    }
}
