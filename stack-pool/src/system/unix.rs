use std::io;
use std::os::raw::c_void;
use std::ptr;

use once_cell::sync::Lazy;

use crate::stack::Stack;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_STACK: libc::c_int = libc::MAP_STACK;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_STACK: libc::c_int = 0;

// Upper bound on a single coroutine stack, guard page included.
const MAX_STACK_SIZE: usize = 1 << 30;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

pub unsafe fn allocate(size: usize) -> io::Result<Stack> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON | MAP_STACK,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let top = (ptr as usize + size) as *mut c_void;
    Ok(Stack::init(top, ptr, false))
}

/// Turns the lowest page of `stack` into a guard page.
pub unsafe fn protect(stack: Stack) -> io::Result<Stack> {
    let page_size = page_size();
    let bottom = stack.bottom();
    if libc::mprotect(bottom, page_size, libc::PROT_NONE) != 0 {
        let err = io::Error::last_os_error();
        drop(stack);
        return Err(err);
    }
    let guarded = Stack::init(stack.top(), (bottom as usize + page_size) as *mut c_void, true);
    std::mem::forget(stack);
    Ok(guarded)
}

pub unsafe fn deallocate(ptr: *mut c_void, size: usize) {
    libc::munmap(ptr, size);
}

#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[inline]
pub fn min_size() -> usize {
    (16 * 1024).max(page_size())
}

pub fn max_size(protected: bool) -> usize {
    if protected {
        MAX_STACK_SIZE - page_size()
    } else {
        MAX_STACK_SIZE
    }
}
