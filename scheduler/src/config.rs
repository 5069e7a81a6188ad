use stack_pool::Stack;

/// Knobs of a [`Scheduler`](crate::Scheduler) instance.
///
/// ```
/// use scheduler::Config;
///
/// let config = Config::default().with_stack_size(64 * 1024).with_stack_count(16);
/// assert_eq!(64 * 1024, config.stack_size());
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Config {
    stack_size: usize,
    stack_count: usize,
    guard_pages: bool,
}

impl Config {
    pub fn new() -> Self {
        Config {
            stack_size: Stack::default_size(),
            stack_count: 64,
            guard_pages: true,
        }
    }

    /// Stack size of coroutines spawned without an explicit size.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Most stacks kept cached for reuse after their coroutine finished.
    pub fn with_stack_count(mut self, stack_count: usize) -> Self {
        self.stack_count = stack_count;
        self
    }

    /// Whether every stack gets a guard page below it.
    pub fn with_guard_pages(mut self, guard_pages: bool) -> Self {
        self.guard_pages = guard_pages;
        self
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn stack_count(&self) -> usize {
        self.stack_count
    }

    pub fn guard_pages(&self) -> bool {
        self.guard_pages
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
