//! Stackful execution contexts with explicit resume and yield.
//!
//! A [Fiber] owns a private stack and a saved CPU context. [Fiber::resume]
//! switches the calling thread into the fiber; [yield_now] switches back to
//! the thread's scheduler fiber, or to its root fiber for fibers driven
//! directly from a native stack.

mod context;
mod stack;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use static_assertions::assert_impl_all;

use self::context::{Context, Entry};
pub use self::stack::StackSize;

static FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<ptr::NonNull<Fiber>>> = Cell::new(None);
    static ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Execution state of a fiber.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Created or yielded, waiting to be resumed.
    Ready,
    /// Currently executing on some thread.
    Running,
    /// Entry function completed; the fiber can only be rebound.
    Term,
}

const READY: u8 = 0;
const RUNNING: u8 = 1;
const TERM: u8 = 2;

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            READY => State::Ready,
            RUNNING => State::Running,
            TERM => State::Term,
            _ => unreachable!("invalid fiber state {}", value),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            State::Ready => READY,
            State::Running => RUNNING,
            State::Term => TERM,
        }
    }
}

/// A stackful fiber.
///
/// Fibers are shared through [Arc]: the runtime keeps a handle while a fiber
/// is queued or running, and event slots and timers keep their own.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    context: UnsafeCell<Box<Context>>,
    entry: UnsafeCell<Option<Box<dyn FnOnce()>>>,
    run_in_scheduler: bool,
    // Serializes competing resume attempts. The lock is taken on resume and
    // released only after the fiber has yielded back, so a party scheduling
    // an already running fiber blocks until its stack is quiescent.
    mutex: Mutex<()>,
}

unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

assert_impl_all!(Fiber: Send, Sync);

impl Fiber {
    /// Constructs a ready fiber running `f` on a default sized stack,
    /// yielding to the thread's scheduler fiber.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_options(f, StackSize::default(), true)
    }

    /// Constructs a ready fiber running `f`.
    ///
    /// A fiber with `run_in_scheduler` yields back to the thread's scheduler
    /// fiber; otherwise it yields back to the thread's root fiber.
    pub fn with_options<F>(f: F, stack_size: StackSize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Arc::new(Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(READY),
            context: UnsafeCell::new(Context::empty()),
            entry: UnsafeCell::new(Some(Box::new(f))),
            run_in_scheduler,
            mutex: Mutex::new(()),
        });
        let entry = Entry { f: Fiber::trampoline, arg: Arc::as_ptr(&fiber) as *mut libc::c_void };
        unsafe { *fiber.context.get() = Context::new(&entry, stack_size) };
        fiber
    }

    fn root() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(RUNNING),
            context: UnsafeCell::new(Context::empty()),
            entry: UnsafeCell::new(None),
            run_in_scheduler: false,
            mutex: Mutex::new(()),
        })
    }

    /// Returns the fiber running on this thread, materializing a root fiber
    /// for the thread's native stack on first call.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT.with(|cell| cell.get()) {
            return unsafe { Fiber::from_ptr(fiber) };
        }
        let root = Fiber::root();
        CURRENT.with(|cell| cell.set(Some(ptr::NonNull::from(root.as_ref()))));
        ROOT.with(|cell| *cell.borrow_mut() = Some(root.clone()));
        // Until a scheduler installs its own, the root fiber doubles as the
        // yield target of scheduler driven fibers.
        SCHEDULER.with(|cell| *cell.borrow_mut() = Some(root.clone()));
        root
    }

    /// Overrides the yield target of scheduler driven fibers on this thread.
    pub fn set_scheduler_fiber(fiber: &Arc<Fiber>) {
        SCHEDULER.with(|cell| *cell.borrow_mut() = Some(fiber.clone()));
    }

    // Safety: ptr must originate from an Arc'ed fiber that is still alive.
    unsafe fn from_ptr(ptr: ptr::NonNull<Fiber>) -> Arc<Fiber> {
        let raw = ptr.as_ptr().cast_const();
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn switch_target(&self) -> ptr::NonNull<Fiber> {
        if self.run_in_scheduler {
            SCHEDULER.with(|cell| {
                let fiber = cell.borrow();
                ptr::NonNull::from(fiber.as_ref().expect("no scheduler fiber on this thread").as_ref())
            })
        } else {
            ROOT.with(|cell| {
                let fiber = cell.borrow();
                ptr::NonNull::from(fiber.as_ref().expect("no root fiber on this thread").as_ref())
            })
        }
    }

    /// Resumes a ready fiber on the calling thread and returns once it yields
    /// or terminates.
    pub fn resume(self: &Arc<Fiber>) {
        Fiber::current();
        let _guard = self.mutex.lock().unwrap();
        assert_eq!(self.state(), State::Ready, "fiber {}: only a ready fiber can be resumed", self.id);
        self.set_state(State::Running);
        let save = self.switch_target();
        CURRENT.with(|cell| cell.set(Some(ptr::NonNull::from(self.as_ref()))));
        unsafe {
            let context = &*self.context.get();
            let save = &mut *(*save.as_ptr()).context.get();
            context.switch(save);
        }
    }

    /// Switches from this running fiber back to its yield target.
    pub(crate) fn suspend(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "fiber {}: only a running fiber can yield",
            self.id
        );
        let target = self.switch_target();
        assert!(target.as_ptr().cast_const() != self as *const Fiber, "fiber {}: cannot yield to itself", self.id);
        if state == State::Running {
            self.set_state(State::Ready);
        }
        CURRENT.with(|cell| cell.set(Some(target)));
        unsafe {
            let context = &*(*target.as_ptr()).context.get();
            let save = &mut *self.context.get();
            context.switch(save);
        }
    }

    /// Rebinds a terminated fiber to a new entry function, reusing its stack.
    pub fn reset<F>(self: &Arc<Fiber>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _guard = self.mutex.lock().unwrap();
        assert_eq!(self.state(), State::Term, "fiber {}: only a terminated fiber can be rebound", self.id);
        let entry = Entry { f: Fiber::trampoline, arg: Arc::as_ptr(self) as *mut libc::c_void };
        unsafe {
            *self.entry.get() = Some(Box::new(f));
            (*self.context.get()).rewind(&entry);
        }
        self.set_state(State::Ready);
    }

    extern "C" fn trampoline(arg: *mut libc::c_void) {
        let fiber = unsafe { Fiber::from_ptr(ptr::NonNull::new_unchecked(arg as *mut Fiber)) };
        let entry = unsafe { (*fiber.entry.get()).take() }.expect("fiber without entry function");
        entry();
        fiber.set_state(State::Term);
        // Release the trampoline's strong handle before the final switch; the
        // resumer still holds one until the switch lands, and fiber storage
        // must not be touched afterwards.
        let raw = Arc::as_ptr(&fiber);
        drop(fiber);
        unsafe { (*raw).suspend() };
        unreachable!("terminated fiber resumed");
    }
}

/// Yields the fiber running on this thread back to its scheduler fiber, or to
/// the thread's root fiber.
///
/// The fiber is not rescheduled; resuming it again is the responsibility of
/// whoever holds a handle. See [crate::scheduler::yield_now] for the
/// requeueing variant.
pub fn yield_now() {
    Fiber::current().suspend();
}

#[cfg(test)]
mod tests {
    use std::hint;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn root_fiber() {
        let root = Fiber::current();
        assert_eq!(root.state(), State::Running);
        let again = Fiber::current();
        assert_eq!(root.id(), again.id());
    }

    #[test]
    fn lifecycle() {
        let step = Arc::new(AtomicUsize::new(0));
        let shared_step = step.clone();
        let fiber = Fiber::with_options(
            move || {
                shared_step.store(1, Ordering::Release);
                yield_now();
                shared_step.store(2, Ordering::Release);
            },
            StackSize::default(),
            false,
        );
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(step.load(Ordering::Acquire), 1);
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(step.load(Ordering::Acquire), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn rebind() {
        let sum = Arc::new(AtomicUsize::new(0));
        let shared_sum = sum.clone();
        let fiber = Fiber::with_options(
            move || {
                shared_sum.fetch_add(1, Ordering::AcqRel);
            },
            StackSize::default(),
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let shared_sum = sum.clone();
        fiber.reset(move || {
            shared_sum.fetch_add(10, Ordering::AcqRel);
        });
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(sum.load(Ordering::Acquire), 11);
    }

    #[test]
    fn small_stack() {
        let sum = Arc::new(AtomicUsize::new(0));
        let shared_sum = sum.clone();
        let fiber = Fiber::with_options(
            move || {
                let mut buf = [0u8; 16 * 1024];
                for index in (0..buf.len()).step_by(512) {
                    unsafe { std::ptr::write_volatile(&mut buf[index], index as u8) };
                }
                let touched = hint::black_box(&buf).iter().step_by(512).count();
                shared_sum.fetch_add(touched, Ordering::AcqRel);
            },
            StackSize::with_size(1),
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(sum.load(Ordering::Acquire), 32);
    }

    #[test]
    #[should_panic(expected = "only a ready fiber can be resumed")]
    fn resume_terminated() {
        let fiber = Fiber::with_options(|| {}, StackSize::default(), false);
        fiber.resume();
        fiber.resume();
    }
}
