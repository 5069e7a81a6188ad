// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io;
use std::os::raw::c_void;

use crate::system;

/// Error type returned by stack allocation methods.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Contains the maximum amount of memory allowed to be allocated as stack space.
    #[error("requested more than max size of {0} bytes for a stack")]
    ExceedsMaximumSize(usize),

    /// Returned if mapping or protecting the memory failed.
    #[error("stack allocation failed: {0}")]
    Io(#[from] io::Error),
}

/// An owned, page aligned memory region used as a coroutine stack.
///
/// The region grows downwards from `top()` to `bottom()`. A protected stack
/// has one extra `PROT_NONE` page right below `bottom()` so an overflow
/// faults instead of scribbling over a neighbouring mapping.
///
/// A `Stack` is never cloned: whoever holds it is its only user, and dropping
/// it unmaps the memory.
#[derive(Eq, PartialEq)]
pub struct Stack {
    top: *mut c_void,
    bottom: *mut c_void,
    protected: bool,
}

impl Stack {
    /// Allocates a new stack of **at least** `size` bytes + one additional guard page.
    ///
    /// `size` is rounded up to a multiple of the size of a memory page and
    /// does not include the size of the guard page itself.
    pub fn new(size: usize) -> Result<Stack, StackError> {
        Stack::allocate(size, true)
    }

    /// Allocates a new stack of at least `size` usable bytes.
    pub fn allocate(size: usize, protected: bool) -> Result<Stack, StackError> {
        let size = Stack::usable_size(size, protected)?;
        let add = if protected { system::page_size() } else { 0 };
        let mut ret = unsafe { system::allocate(size + add) };
        if protected {
            ret = ret.and_then(|stack| unsafe { system::protect(stack) });
        }
        ret.map_err(StackError::Io)
    }

    /// The usable length a request for `size` bytes ends up with.
    pub fn usable_size(size: usize, protected: bool) -> Result<usize, StackError> {
        let add = if protected { system::page_size() } else { 0 };
        let max_stack_size = system::max_size(false);
        let size = size.max(system::min_size());
        match system::round_to_pages(size).and_then(|s| s.checked_add(add)) {
            Some(total) if total <= max_stack_size => Ok(total - add),
            _ => Err(StackError::ExceedsMaximumSize(max_stack_size - add)),
        }
    }

    /// Creates an owning representation of some stack memory.
    ///
    /// `top` and `bottom` must delimit a live mapping made by
    /// `system::allocate`; a protected stack owns the page below `bottom` too.
    #[inline]
    pub(crate) unsafe fn init(top: *mut c_void, bottom: *mut c_void, protected: bool) -> Stack {
        debug_assert!(top >= bottom);
        Stack {
            top,
            bottom,
            protected,
        }
    }

    /// Returns the top of the stack from which on it grows downwards towards bottom().
    #[inline]
    pub fn top(&self) -> *mut c_void {
        self.top
    }

    /// Returns the bottom of the stack and thus it's end.
    #[inline]
    pub fn bottom(&self) -> *mut c_void {
        self.bottom
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Returns the size of the stack between top() and bottom().
    #[inline]
    pub fn len(&self) -> usize {
        self.top as usize - self.bottom as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the minimal stack size allowed by the current platform.
    #[inline]
    pub fn min_size() -> usize {
        system::min_size()
    }

    /// Returns the maximum stack size allowed by the current platform.
    #[inline]
    pub fn max_size(protected: bool) -> usize {
        system::max_size(protected)
    }

    /// Returns a implementation defined default stack size.
    #[inline]
    pub fn default_size() -> usize {
        system::default_size(true)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let mut ptr = self.bottom;
        let mut size = self.len();
        if self.protected {
            let page_size = system::page_size();
            ptr = (self.bottom as usize - page_size) as *mut c_void;
            size += page_size;
        }
        unsafe {
            system::deallocate(ptr, size);
        }
    }
}

impl Debug for Stack {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Stack")
            .field("top", &self.top)
            .field("bottom", &self.bottom)
            .field("len", &self.len())
            .field("protected", &self.protected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::write_bytes;

    use super::*;

    #[test]
    fn stack_size_too_small() {
        let stack = Stack::new(0).unwrap();
        assert_eq!(stack.len(), system::min_size());
        unsafe { write_bytes(stack.bottom() as *mut u8, 0x1d, stack.len()) };

        let stack = Stack::allocate(1, false).unwrap();
        assert_eq!(stack.len(), system::min_size());
        assert!(!stack.is_protected());
        unsafe { write_bytes(stack.bottom() as *mut u8, 0x1d, stack.len()) };
    }

    #[test]
    fn stack_size_rounds_up_to_pages() {
        let page_size = system::page_size();
        let size = system::min_size() + 1;
        let stack = Stack::new(size).unwrap();
        assert_eq!(stack.len(), system::min_size() + page_size);
        assert_eq!(0, stack.len() % page_size);
        assert_eq!(0, stack.top() as usize % page_size);
    }

    #[test]
    fn stack_size_too_large() {
        let stack_size = system::max_size(true);
        assert_eq!(stack_size, Stack::usable_size(stack_size, true).unwrap());
        match Stack::usable_size(stack_size + 1, true) {
            Err(StackError::ExceedsMaximumSize(max)) => assert_eq!(stack_size, max),
            other => panic!("unexpected {:?}", other),
        }

        let stack_size = system::max_size(false);
        assert_eq!(stack_size, Stack::usable_size(stack_size, false).unwrap());
        match Stack::allocate(stack_size + 1, false) {
            Err(StackError::ExceedsMaximumSize(..)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn protected_stack_reports_usable_region() {
        let size = system::min_size();
        let stack = Stack::new(size).unwrap();
        assert!(stack.is_protected());
        assert_eq!(size, stack.len());
        assert!(!stack.is_empty());
        assert!(stack.top() > stack.bottom());
    }

    #[test]
    fn default_size_is_page_aligned() {
        let stack = Stack::new(Stack::default_size()).unwrap();
        assert_eq!(Stack::default_size(), stack.len());
        assert_eq!(0, stack.len() % system::page_size());
    }
}
