//! Multi-threaded cooperative task dispatcher.
//!
//! A [Scheduler] owns a pool of worker threads and a queue of [Task]s. Each
//! worker drives fibers one at a time; a fiber keeps its worker until it
//! yields. Tasks may be pinned to a specific worker thread.

use std::cell::Cell;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use derive_where::derive_where;
use ignore_result::Ignore;
use static_assertions::assert_impl_all;

use crate::fiber::{self, Fiber, StackSize, State};

pub(crate) type Call = Box<dyn FnOnce() + Send>;

/// Returns the OS thread id of the calling thread, usable as a [Task]
/// affinity target.
pub fn thread_id() -> u64 {
    unsafe { libc::gettid() as u64 }
}

thread_local! {
    static SCHEDULER: Cell<Option<ptr::NonNull<Scheduler>>> = Cell::new(None);
}

struct Scope {
    scheduler: ptr::NonNull<Scheduler>,
}

impl Scope {
    fn enter(scheduler: &Scheduler) -> Scope {
        SCHEDULER.with(|cell| {
            assert!(cell.get().is_none(), "worker scheduler existed");
            cell.set(Some(ptr::NonNull::from(scheduler)));
        });
        Scope { scheduler: ptr::NonNull::from(scheduler) }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        SCHEDULER.with(|cell| {
            let scheduler = cell.replace(None).expect("worker scheduler does not exist");
            assert!(scheduler == self.scheduler, "worker scheduler changed");
        });
    }
}

/// A unit of scheduling: an existing fiber or a callable that a worker wraps
/// in a fresh fiber, optionally pinned to one worker thread.
#[derive_where(Debug)]
pub struct Task {
    #[derive_where(skip)]
    entry: Entry,
    thread: Option<u64>,
}

enum Entry {
    Fiber(Arc<Fiber>),
    Call(Call),
}

impl Task {
    /// Constructs a task from a callable.
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task { entry: Entry::Call(Box::new(f)), thread: None }
    }

    /// Constructs a task resuming an existing fiber.
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task { entry: Entry::Fiber(fiber), thread: None }
    }

    /// Restricts the task to the worker with the given OS thread id.
    pub fn pin_to(mut self, thread: u64) -> Task {
        self.thread = Some(thread);
        self
    }
}

/// Customization seam for the worker loop.
///
/// The base behaviors below belong to [Scheduler] itself; the reactor
/// overrides them to sleep in its readiness facility instead of in short
/// naps.
pub(crate) trait Schedule: Send + Sync + Sized + 'static {
    fn scheduler(&self) -> &Scheduler;

    /// Whether workers of this owner enable blocking-call interposition.
    fn hook_enabled(&self) -> bool {
        false
    }

    /// Wakes idle workers after new work arrived.
    fn tickle(&self) {}

    fn stopping(&self) -> bool {
        self.scheduler().stopping()
    }

    /// Body of the per-worker idle fiber. Resumed whenever the queue has
    /// nothing eligible; must yield regularly and terminate once stopping.
    fn idle(&self) {
        while !self.stopping() {
            thread::sleep(Duration::from_millis(1));
            fiber::yield_now();
        }
    }

    /// Thread entry of spawned workers.
    fn worker(self: Arc<Self>) {
        run(self);
    }
}

/// A pool of worker threads dispatching fibers and callables.
pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_ids: Mutex<Vec<u64>>,
    worker_count: usize,
    use_caller: bool,
    root_thread: AtomicU64,
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    notifier: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

assert_impl_all!(Scheduler: Send, Sync);

impl Scheduler {
    /// Constructs a scheduler with `threads` workers. With `use_caller`, the
    /// constructing thread counts as one of them: it participates by
    /// draining remaining work from inside [Scheduler::stop].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads >= 1, "scheduler requires at least one thread");
        Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            worker_count: threads - usize::from(use_caller),
            use_caller,
            root_thread: AtomicU64::new(0),
            caller_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            notifier: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids of all participating workers, the caller included.
    pub fn thread_ids(&self) -> Vec<u64> {
        self.thread_ids.lock().unwrap().clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// True once stop was requested and all queued work has drained.
    pub fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self.tasks.lock().unwrap().is_empty()
    }

    /// Appends a task to the queue, waking an idle worker if the queue was
    /// empty.
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut tasks = self.tasks.lock().unwrap();
            let need_tickle = tasks.is_empty();
            tasks.push_back(task);
            need_tickle
        };
        if need_tickle {
            if let Some(notify) = self.notifier.get() {
                notify();
            }
        }
    }

    /// Schedules a callable; a worker runs it in a fresh fiber.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f));
    }

    /// Installs the wakeup hook fired on push-to-empty-queue.
    pub(crate) fn set_notifier(&self, notify: impl Fn() + Send + Sync + 'static) {
        if self.notifier.set(Box::new(notify)).is_err() {
            panic!("scheduler notifier already set");
        }
    }

    /// Spawns the worker threads.
    pub fn start(self: &Arc<Scheduler>) {
        start(self);
    }

    /// Stops the scheduler: drains queued work and joins all workers.
    ///
    /// A caller-participating scheduler must be stopped from its caller
    /// thread; others from any non-worker thread. Safe to call twice.
    pub fn stop(self: &Arc<Scheduler>) {
        stop(self);
    }

    fn root_thread(&self) -> Option<u64> {
        match self.root_thread.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) unsafe fn current<'a>() -> &'a Scheduler {
        SCHEDULER.with(|cell| cell.get().expect("no worker scheduler").as_ref())
    }

    pub(crate) fn try_current<'a>() -> Option<&'a Scheduler> {
        SCHEDULER.with(|cell| cell.get().map(|scheduler| unsafe { scheduler.as_ref() }))
    }
}

impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

pub(crate) fn start<S: Schedule>(owner: &Arc<S>) {
    let scheduler = owner.scheduler();
    if scheduler.started.swap(true, Ordering::AcqRel) {
        return;
    }
    if Scheduler::try_current().is_none() {
        SCHEDULER.with(|cell| cell.set(Some(ptr::NonNull::from(scheduler))));
    }
    if scheduler.use_caller {
        let caller = thread_id();
        scheduler.root_thread.store(caller, Ordering::Release);
        scheduler.thread_ids.lock().unwrap().push(caller);
        Fiber::current();
        let fiber_owner = owner.clone();
        let fiber = Fiber::with_options(move || run(fiber_owner), StackSize::default(), false);
        Fiber::set_scheduler_fiber(&fiber);
        *scheduler.caller_fiber.lock().unwrap() = Some(fiber);
    }
    let (sender, receiver) = mpsc::channel();
    {
        let mut threads = scheduler.threads.lock().unwrap();
        for i in 0..scheduler.worker_count {
            let worker_owner = owner.clone();
            let sender = sender.clone();
            let handle = thread::Builder::new()
                .name(format!("{}::worker::{}", scheduler.name, i))
                .spawn(move || {
                    sender.send(thread_id()).ignore();
                    drop(sender);
                    worker_owner.worker();
                })
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
    }
    drop(sender);
    let mut thread_ids = scheduler.thread_ids.lock().unwrap();
    while let Ok(id) = receiver.recv() {
        thread_ids.push(id);
    }
}

pub(crate) fn stop<S: Schedule>(owner: &Arc<S>) {
    let scheduler = owner.scheduler();
    if scheduler.stop_requested()
        && scheduler.caller_fiber.lock().unwrap().is_none()
        && scheduler.threads.lock().unwrap().is_empty()
    {
        return;
    }
    if scheduler.use_caller {
        assert_eq!(
            Some(thread_id()),
            scheduler.root_thread(),
            "{}: a caller-participating scheduler stops from its caller thread",
            scheduler.name
        );
    } else {
        assert!(
            !scheduler.thread_ids().contains(&thread_id()),
            "{}: a scheduler cannot be stopped from its own worker",
            scheduler.name
        );
    }
    scheduler.stop_requested.store(true, Ordering::Release);
    for _ in 0..scheduler.worker_count {
        owner.tickle();
    }
    let caller_fiber = scheduler.caller_fiber.lock().unwrap().take();
    if let Some(fiber) = caller_fiber {
        owner.tickle();
        // Participate: the caller thread drains remaining work until the
        // stopping predicate holds.
        fiber.resume();
    }
    let threads: Vec<_> = scheduler.threads.lock().unwrap().drain(..).collect();
    for handle in threads {
        handle.join().ignore();
    }
    SCHEDULER.with(|cell| {
        if cell.get() == Some(ptr::NonNull::from(scheduler)) {
            cell.set(None);
        }
    });
}

pub(crate) fn run<S: Schedule>(owner: Arc<S>) {
    let me = thread_id();
    let scheduler = owner.scheduler();
    let _scope = match Scheduler::try_current() {
        None => Some(Scope::enter(scheduler)),
        Some(_) => None,
    };
    if owner.hook_enabled() {
        crate::hook::set_enabled(true);
    }
    Fiber::current();
    let idle_owner = owner.clone();
    let idle_fiber = Fiber::new(move || idle_owner.idle());
    loop {
        let mut task = None;
        let mut tickle_me = false;
        {
            let mut tasks = scheduler.tasks.lock().unwrap();
            let mut index = 0;
            while index < tasks.len() {
                if tasks[index].thread.map_or(false, |thread| thread != me) {
                    // Pinned to another worker; leave it and wake the others.
                    tickle_me = true;
                    index += 1;
                    continue;
                }
                task = tasks.remove(index);
                scheduler.active.fetch_add(1, Ordering::AcqRel);
                break;
            }
            tickle_me = tickle_me || !tasks.is_empty();
        }
        if tickle_me {
            owner.tickle();
        }
        match task {
            Some(Task { entry: Entry::Fiber(fiber), .. }) => {
                if fiber.state() != State::Term {
                    fiber.resume();
                }
                scheduler.active.fetch_sub(1, Ordering::AcqRel);
            },
            Some(Task { entry: Entry::Call(call), .. }) => {
                let fiber = Fiber::new(call);
                fiber.resume();
                scheduler.active.fetch_sub(1, Ordering::AcqRel);
            },
            None => {
                // The idle fiber terminates only after stopping; its state is
                // the worker's exit condition.
                if idle_fiber.state() == State::Term {
                    break;
                }
                scheduler.idle.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                scheduler.idle.fetch_sub(1, Ordering::AcqRel);
            },
        }
    }
}

/// Schedules a callable onto the scheduler of the calling worker thread.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let scheduler = Scheduler::try_current().expect("no running scheduler");
    scheduler.spawn(f);
}

/// Requeues the running fiber and yields, giving other tasks of its
/// scheduler a chance to run.
pub fn yield_now() {
    let scheduler = Scheduler::try_current().expect("no running scheduler");
    let fiber = Fiber::current();
    scheduler.schedule(Task::fiber(fiber));
    fiber::yield_now();
}
