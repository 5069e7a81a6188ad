use core::fmt;
use std::fmt::{Debug, Formatter};
use std::os::raw::c_void;
use std::ptr;

use stack_pool::Stack;

/// A `Context` stores a suspended execution state, for it to be resumed later.
///
/// If we have 2 or more `Context` instances, we can thus easily "freeze" the
/// current state of execution and explicitly switch to another `Context`.
/// This `Context` is then resumed exactly where it left off and
/// can in turn "freeze" and switch to another `Context`.
///
/// Only the stack pointer lives here; the callee-saved registers and the
/// floating-point control words are pushed onto the suspended stack itself.
#[repr(C)]
pub struct Context {
    sp: *mut c_void,
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Context({:p})", self.sp)
    }
}

/// Functions of this signature are used as the entry point for a new `Context`.
pub type ContextFn = extern "C" fn(arg: *mut c_void) -> !;

impl Context {
    /// A context with nothing saved in it yet, to be filled by the first
    /// `switch` away from the running code.
    pub const fn empty() -> Context {
        Context {
            sp: ptr::null_mut(),
        }
    }

    /// Creates a new `Context` prepared to execute `f(arg)` at the top of `stack`.
    ///
    /// `f` is not executed until the first `switch` into the context, and it
    /// must never return.
    ///
    /// # Safety
    ///
    /// `stack` must outlive every use of the returned `Context`, and no other
    /// live context may be using `stack`.
    pub unsafe fn new(stack: &Stack, f: ContextFn, arg: *mut c_void) -> Context {
        let top = (stack.top() as usize) & !15;
        let frame = arch::initial_frame(f, arg);
        let sp = (top - arch::TOP_PADDING - frame.len() * 8) as *mut usize;
        debug_assert!(sp as usize > stack.bottom() as usize);
        ptr::copy_nonoverlapping(frame.as_ptr(), sp, frame.len());
        Context { sp: sp as *mut c_void }
    }

    /// Saves the running state into `from` and resumes `to`.
    ///
    /// This behaves like a regular function call with the difference that it
    /// only returns when someone switches back to `from` in turn. The switch
    /// is a straight-line register save and restore on the current thread, so
    /// a signal handler sees either the old or the new stack, never a mix.
    ///
    /// # Safety
    ///
    /// `from` must be valid for writes and `to` must hold a state produced by
    /// `Context::new` or by an earlier `switch`, whose stack is still alive and
    /// which is not currently running.
    #[inline(always)]
    pub unsafe fn switch(from: *mut Context, to: *const Context) {
        debug_assert!(!(*to).sp.is_null(), "switch into an empty context");
        coroutine_swap_context(from, to);
    }

    pub fn is_empty(&self) -> bool {
        self.sp.is_null()
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use std::os::raw::c_void;

    use super::{coroutine_context_trampoline, ContextFn};

    // Keeps the stack 16 byte aligned once the trampoline calls the entry.
    pub(super) const TOP_PADDING: usize = 16;

    // mxcsr = 0x1f80 and x87 control word = 0x037f, the ABI defaults.
    const FP_CONTROL: usize = 0x0000_037f_0000_1f80;

    pub(super) fn initial_frame(f: ContextFn, arg: *mut c_void) -> [usize; 8] {
        [
            FP_CONTROL,
            0,                                     // r15
            0,                                     // r14
            arg as usize,                          // r13
            f as usize,                            // r12
            0,                                     // rbx
            0,                                     // rbp
            coroutine_context_trampoline as usize, // return address
        ]
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use std::os::raw::c_void;

    use super::{coroutine_context_trampoline, ContextFn};

    pub(super) const TOP_PADDING: usize = 0;

    pub(super) fn initial_frame(f: ContextFn, arg: *mut c_void) -> [usize; 20] {
        let mut frame = [0usize; 20];
        // d8-d15 occupy slots 0..8
        frame[8] = f as usize; // x19
        frame[9] = arg as usize; // x20
        frame[19] = coroutine_context_trampoline as usize; // x30
        frame
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("context switching is only implemented for x86_64 and aarch64");

extern "C" {
    /// Pushes the callee-saved state, stores the stack pointer into `from`,
    /// loads the one saved in `to` and pops its state.
    fn coroutine_swap_context(from: *mut Context, to: *const Context);

    /// First code a fresh context runs: calls the entry with its argument.
    fn coroutine_context_trampoline();
}
