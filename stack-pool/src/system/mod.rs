#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use self::unix::{allocate, deallocate, max_size, min_size, page_size, protect};

#[cfg(not(unix))]
compile_error!("stack-pool only supports unix targets");

/// Rounds `size` up to a whole number of pages.
#[inline]
pub fn round_to_pages(size: usize) -> Option<usize> {
    let page_size = page_size();
    size.checked_add(page_size - 1).map(|s| s & !(page_size - 1))
}

pub fn default_size(protected: bool) -> usize {
    let size = 256 * 1024;
    let max_stack_size = max_size(protected);
    size.min(max_stack_size).max(min_size())
}
