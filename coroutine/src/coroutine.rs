use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::process;

use id_generator::IdGenerator;
use stack_pool::Stack;
use timer::{Deadline, NEVER};

use crate::context::Context;

/// Opaque identity of a coroutine, unique within the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CoroutineId(usize);

impl CoroutineId {
    fn next() -> Self {
        CoroutineId(IdGenerator::next_id("coroutine"))
    }
}

impl Display for CoroutineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "co-{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    ///等待运行
    Ready,
    ///运行中
    Running,
    ///等待定时器
    Sleeping,
    ///等待外部事件(I/O或唤醒)
    Blocked,
    ///已退出
    Done,
}

/// The work a coroutine runs on entry.
pub type Work = Box<dyn FnOnce() + 'static>;

/// What a panicking work item left behind.
pub type Payload = Box<dyn Any + Send + 'static>;

/// Control block of one coroutine.
///
/// A block is always boxed: its context and its own address are handed to
/// the entry function when it is created, so it must never move.
pub struct Coroutine {
    id: CoroutineId,
    status: Status,
    stack: Option<Stack>,
    context: Context,
    //用户函数
    proc: Option<Work>,
    //执行完毕后切换到的上下文
    exit: *const Context,
    //下一次应该执行协程体的时间
    deadline: Deadline,
    panic: Option<Payload>,
}

impl Coroutine {
    extern "C" fn coroutine_function(arg: *mut c_void) -> ! {
        let context = arg as *mut Coroutine;
        unsafe {
            let proc = match (*context).proc.take() {
                Some(proc) => proc,
                None => process::abort(),
            };
            tracing::trace!(id = %(*context).id, "coroutine started");
            //调用用户函数
            let result = panic::catch_unwind(AssertUnwindSafe(proc));
            (*context).status = Status::Done;
            (*context).panic = result.err();
            let exit = (*context).exit;
            Context::switch(&mut (*context).context, exit);
        }
        // a Done coroutine is never resumed
        process::abort()
    }

    /// Builds a coroutine that will run `proc` on `stack` once switched into,
    /// and switch to `exit` when `proc` returns or panics.
    ///
    /// The new coroutine is `Ready`. `exit` must stay valid for as long as
    /// the coroutine may finish.
    pub fn new(stack: Stack, proc: Work, exit: *const Context) -> Box<Coroutine> {
        let mut coroutine = Box::new(Coroutine {
            id: CoroutineId::next(),
            status: Status::Ready,
            stack: None,
            context: Context::empty(),
            proc: Some(proc),
            exit,
            deadline: NEVER,
            panic: None,
        });
        let arg = &mut *coroutine as *mut Coroutine as *mut c_void;
        coroutine.context = unsafe { Context::new(&stack, Coroutine::coroutine_function, arg) };
        coroutine.stack = Some(stack);
        coroutine
    }

    /// Marks the coroutine running and returns the context to switch into.
    ///
    /// # Panics
    ///
    /// Resuming a finished coroutine is a logic error and panics.
    pub fn resume_target(&mut self) -> *const Context {
        assert!(
            self.status != Status::Done,
            "switch into finished coroutine {}",
            self.id
        );
        self.status = Status::Running;
        &self.context
    }

    /// Where the running state is saved when this coroutine switches away.
    pub fn context_mut(&mut self) -> *mut Context {
        &mut self.context
    }

    ///下方开始get/set
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) -> &mut Self {
        self.status = status;
        self
    }

    pub fn is_done(&self) -> bool {
        self.status == Status::Done
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Deadline) -> &mut Self {
        self.deadline = deadline;
        self
    }

    pub fn stack_len(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::len)
    }

    /// Takes the stack back from a finished coroutine.
    ///
    /// Returns `None` unless the coroutine is `Done`, as a live coroutine is
    /// still running on it.
    pub fn take_stack(&mut self) -> Option<Stack> {
        if self.is_done() {
            self.stack.take()
        } else {
            None
        }
    }

    /// The panic payload of a finished coroutine, if its work panicked.
    pub fn take_panic(&mut self) -> Option<Payload> {
        self.panic.take()
    }
}

impl Debug for Coroutine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("stack", &self.stack)
            .field("context", &self.context)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use stack_pool::Stack;

    use crate::context::Context;
    use crate::coroutine::{Coroutine, Status, Work};

    struct Main(*mut Context);

    impl Main {
        fn new() -> Self {
            Main(Box::into_raw(Box::new(Context::empty())))
        }

        fn spawn(&self, work: Work) -> Box<Coroutine> {
            Coroutine::new(Stack::new(Stack::min_size()).unwrap(), work, self.0)
        }

        fn resume(&self, coroutine: &mut Coroutine) {
            let target = coroutine.resume_target();
            unsafe { Context::switch(self.0, target) };
        }
    }

    impl Drop for Main {
        fn drop(&mut self) {
            drop(unsafe { Box::from_raw(self.0) });
        }
    }

    #[test]
    fn test() {
        let main = Main::new();
        let flag = Rc::new(Cell::new(0));
        let inner = flag.clone();
        let mut coroutine = main.spawn(Box::new(move || {
            inner.set(inner.get() + 1);
        }));
        assert_eq!(Status::Ready, coroutine.status());
        assert!(coroutine.take_stack().is_none());

        main.resume(&mut coroutine);
        assert_eq!(1, flag.get());
        assert!(coroutine.is_done());
        assert!(coroutine.take_panic().is_none());
        let stack = coroutine.take_stack().unwrap();
        assert_eq!(Stack::min_size(), stack.len());
        assert_eq!(0, coroutine.stack_len());
    }

    #[test]
    fn panic_is_captured() {
        let main = Main::new();
        let mut coroutine = main.spawn(Box::new(|| panic!("boom")));
        main.resume(&mut coroutine);
        assert!(coroutine.is_done());
        let payload = coroutine.take_panic().unwrap();
        assert_eq!(Some(&"boom"), payload.downcast_ref::<&str>());
    }

    #[test]
    #[should_panic(expected = "switch into finished coroutine")]
    fn resume_finished_coroutine() {
        let main = Main::new();
        let mut coroutine = main.spawn(Box::new(|| {}));
        main.resume(&mut coroutine);
        coroutine.resume_target();
    }

    #[test]
    fn deadline_is_kept() {
        let main = Main::new();
        let mut coroutine = main.spawn(Box::new(|| {}));
        assert_eq!(timer::NEVER, coroutine.deadline());
        coroutine.set_status(Status::Sleeping).set_deadline(42);
        assert_eq!(42, coroutine.deadline());
        assert_eq!(Status::Sleeping, coroutine.status());
    }

    #[test]
    fn ids_are_unique() {
        let a = Coroutine::new(Stack::new(0).unwrap(), Box::new(|| {}), std::ptr::null());
        let b = Coroutine::new(Stack::new(0).unwrap(), Box::new(|| {}), std::ptr::null());
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }
}
