//! Readiness reactor: an [IoManager] extends the scheduler and timer set
//! with a readiness-notification loop that turns descriptor events into
//! scheduled fiber resumptions.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::mem;
use std::ops;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use std::{fmt, thread};

use log::error;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use static_assertions::assert_impl_all;

use crate::fd::{EventSlots, FdManager, Party};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{self, Call, Schedule, Scheduler, Task};
use crate::timer::{Timer, TimerManager};

const WAKER_TOKEN: Token = Token(usize::MAX);
const MAX_EVENTS: usize = 256;
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(5000);

const INITIAL_FD_CONTEXTS: usize = 64;

/// Readiness directions of a descriptor. Bit values line up with the common
/// readiness-bit convention so sets OR together cheaply.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl ops::BitAnd for Event {
    type Output = Event;

    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl ops::Not for Event {
    type Output = Event;

    fn not(self) -> Event {
        Event(!self.0 & (Event::READ.0 | Event::WRITE.0))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Event::NONE => f.write_str("NONE"),
            Event::READ => f.write_str("READ"),
            Event::WRITE => f.write_str("WRITE"),
            Event(bits) if bits == Event::READ.0 | Event::WRITE.0 => f.write_str("READ|WRITE"),
            Event(bits) => write!(f, "Event({:#x})", bits),
        }
    }
}

fn interest(events: Event) -> Option<Interest> {
    match (events.contains(Event::READ), events.contains(Event::WRITE)) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

thread_local! {
    static REACTOR: RefCell<Option<Weak<Reactor>>> = RefCell::new(None);
}

pub(crate) fn current() -> Option<Arc<Reactor>> {
    REACTOR.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}

fn bind_current(reactor: Weak<Reactor>) {
    REACTOR.with(|cell| {
        let mut current = cell.borrow_mut();
        assert!(current.is_none(), "io manager already bound to this thread");
        *current = Some(reactor);
    });
}

fn clear_current(reactor: &Arc<Reactor>) {
    REACTOR.with(|cell| {
        let mut current = cell.borrow_mut();
        if current.as_ref().map_or(false, |weak| weak.as_ptr() == Arc::as_ptr(reactor)) {
            *current = None;
        }
    });
}

struct Scope {}

impl Scope {
    fn enter(reactor: Weak<Reactor>) -> Scope {
        bind_current(reactor);
        Scope {}
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        REACTOR.with(|cell| {
            let reactor = cell.borrow_mut().take();
            assert!(reactor.is_some(), "io manager binding does not exist");
        });
    }
}

struct Poller {
    poll: Poll,
    events: Events,
}

pub(crate) struct Reactor {
    scheduler: Scheduler,
    timers: TimerManager,
    registry: mio::Registry,
    poller: Mutex<Poller>,
    waker: Waker,
    pending: AtomicUsize,
    weak: OnceLock<Weak<Reactor>>,
}

impl Reactor {
    fn weak(&self) -> Weak<Reactor> {
        self.weak.get().expect("reactor weak handle not set").clone()
    }

    pub(crate) fn schedule(&self, task: Task) {
        self.scheduler.schedule(task);
    }

    pub(crate) fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, f, recurring)
    }

    pub(crate) fn add_conditional_timer<F>(
        &self,
        ms: u64,
        f: F,
        condition: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(ms, f, condition, recurring)
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Arms `event` on `fd`. The party scheduled on readiness is `call` when
    /// given, the calling fiber otherwise.
    pub(crate) fn add_event(&self, fd: RawFd, event: Event, call: Option<Call>) -> io::Result<()> {
        assert!(event == Event::READ || event == Event::WRITE, "cannot arm {:?}", event);
        let context = FdManager::instance()
            .get(fd, true)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut slots = context.slots.lock().unwrap();
        if slots.events.contains(event) {
            error!("{}: fd {} event {:?} armed twice", self.scheduler.name(), fd, event);
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let armed = slots.events | event;
        let source = &mut SourceFd(&fd);
        let token = Token(fd as usize);
        let result = if slots.events.is_empty() {
            self.registry.register(source, token, interest(armed).unwrap())
        } else {
            self.registry.reregister(source, token, interest(armed).unwrap())
        };
        if let Err(err) = result {
            error!("{}: failed to arm fd {} for {:?}: {}", self.scheduler.name(), fd, event, err);
            return Err(err);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        slots.events = armed;
        let slot = slots.slot_mut(event);
        assert!(!slot.is_armed(), "fd {} slot {:?} still occupied", fd, event);
        slot.scheduler = match current() {
            Some(reactor) => Arc::downgrade(&reactor),
            None => self.weak(),
        };
        slot.party = Some(match call {
            Some(call) => Party::Call(call),
            None => {
                let fiber = Fiber::current();
                assert_eq!(fiber.state(), State::Running, "armed fiber is not running");
                Party::Fiber(fiber)
            },
        });
        Ok(())
    }

    /// Disarms `event` on `fd` without scheduling its party. Returns whether
    /// the event was armed.
    pub(crate) fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = FdManager::instance().get(fd, false) else {
            return false;
        };
        let mut slots = context.slots.lock().unwrap();
        if !slots.events.contains(event) {
            return false;
        }
        let left = slots.events & !event;
        self.update_registration(fd, left);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        slots.events = left;
        slots.slot_mut(event).clear();
        true
    }

    /// Disarms `event` on `fd` and fires its party as if the descriptor had
    /// become ready. Returns whether the event was armed.
    pub(crate) fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = FdManager::instance().get(fd, false) else {
            return false;
        };
        let mut slots = context.slots.lock().unwrap();
        if !slots.events.contains(event) {
            return false;
        }
        let left = slots.events & !event;
        self.update_registration(fd, left);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Self::trigger_event(&mut slots, event);
        true
    }

    /// Disarms everything on `fd`, firing armed parties. Returns whether any
    /// event was armed.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(context) = FdManager::instance().get(fd, false) else {
            return false;
        };
        let mut slots = context.slots.lock().unwrap();
        if slots.events.is_empty() {
            return false;
        }
        self.update_registration(fd, Event::NONE);
        if slots.events.contains(Event::READ) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Self::trigger_event(&mut slots, Event::READ);
        }
        if slots.events.contains(Event::WRITE) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Self::trigger_event(&mut slots, Event::WRITE);
        }
        assert!(slots.events.is_empty(), "fd {} still armed after cancel_all", fd);
        true
    }

    /// Narrows or removes the facility registration of `fd` to `left`.
    fn update_registration(&self, fd: RawFd, left: Event) {
        let source = &mut SourceFd(&fd);
        let result = match interest(left) {
            Some(interest) => self.registry.reregister(source, Token(fd as usize), interest),
            None => self.registry.deregister(source),
        };
        if let Err(err) = result {
            error!("{}: failed to update registration of fd {}: {}", self.scheduler.name(), fd, err);
        }
    }

    // Caller holds the context's slot mutex.
    fn trigger_event(slots: &mut EventSlots, event: Event) {
        assert!(slots.events.contains(event), "triggering unarmed event {:?}", event);
        slots.events = slots.events & !event;
        let slot = slots.slot_mut(event);
        let scheduler = mem::replace(&mut slot.scheduler, Weak::new());
        let party = slot.party.take();
        let Some(reactor) = scheduler.upgrade() else {
            return;
        };
        match party {
            Some(Party::Fiber(fiber)) => reactor.schedule(Task::fiber(fiber)),
            Some(Party::Call(call)) => reactor.schedule(Task::call(call)),
            None => {},
        }
    }
}

impl Schedule for Reactor {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn hook_enabled(&self) -> bool {
        true
    }

    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() && !self.scheduler.stop_requested() {
            return;
        }
        if let Err(err) = self.waker.wake() {
            error!("{}: failed to wake pollers: {}", self.scheduler.name(), err);
        }
    }

    fn stopping(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && !self.timers.has_timer() && self.scheduler.stopping()
    }

    fn idle(&self) {
        let mut expired = Vec::new();
        loop {
            if Schedule::stopping(self) {
                break;
            }
            match self.poller.try_lock() {
                Ok(mut poller) => {
                    let timeout = self.timers.next_timeout().map_or(MAX_POLL_TIMEOUT, |t| t.min(MAX_POLL_TIMEOUT));
                    let Poller { poll, events } = &mut *poller;
                    match poll.poll(events, Some(timeout)) {
                        Ok(_) => {},
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => error!("{}: poll failed: {}", self.scheduler.name(), err),
                    }
                    self.timers.drain_expired(&mut expired);
                    for callback in expired.drain(..) {
                        self.scheduler.schedule(Task::call(move || callback()));
                    }
                    for event in events.iter() {
                        if event.token() == WAKER_TOKEN {
                            // The wakeup counter stays edge triggered; there
                            // is nothing to hand out for it.
                            continue;
                        }
                        let fd = event.token().0 as RawFd;
                        let Some(context) = FdManager::instance().get(fd, false) else {
                            continue;
                        };
                        let mut slots = context.slots.lock().unwrap();
                        let mut real = Event::NONE;
                        if event.is_readable() || event.is_read_closed() {
                            real = real | Event::READ;
                        }
                        if event.is_writable() || event.is_write_closed() {
                            real = real | Event::WRITE;
                        }
                        if event.is_error() {
                            // Errors wake every armed party; they observe the
                            // failure from the retried operation.
                            real = real | (slots.events & (Event::READ | Event::WRITE));
                        }
                        real = real & slots.events;
                        if real.is_empty() {
                            continue;
                        }
                        let left = slots.events & !real;
                        self.update_registration(fd, left);
                        if real.contains(Event::READ) {
                            self.pending.fetch_sub(1, Ordering::AcqRel);
                            Self::trigger_event(&mut slots, Event::READ);
                        }
                        if real.contains(Event::WRITE) {
                            self.pending.fetch_sub(1, Ordering::AcqRel);
                            Self::trigger_event(&mut slots, Event::WRITE);
                        }
                    }
                },
                Err(_) => {
                    // Another worker owns the poll; nap like the base idle
                    // fiber and let the run loop look for work again.
                    thread::sleep(Duration::from_millis(1));
                },
            }
            fiber::yield_now();
        }
    }

    fn worker(self: Arc<Self>) {
        let _scope = Scope::enter(self.weak());
        scheduler::run(self);
    }
}

/// A scheduler whose idle workers sleep in a readiness facility, resuming
/// fibers when descriptors become ready or timers expire.
///
/// Dropping the manager stops the scheduler and joins its workers.
pub struct IoManager {
    reactor: Arc<Reactor>,
}

assert_impl_all!(IoManager: Send);

impl IoManager {
    /// Constructs a manager with `threads` workers and starts them. With
    /// `use_caller`, the constructing thread participates as a worker when
    /// the manager stops.
    ///
    /// Failure to create the readiness facility is fatal.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoManager {
        let poll = Poll::new().expect("failed to create readiness poll");
        let registry = poll.registry().try_clone().expect("failed to clone poll registry");
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).expect("failed to create poll waker");
        let reactor = Arc::new(Reactor {
            scheduler: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            registry,
            poller: Mutex::new(Poller { poll, events: Events::with_capacity(MAX_EVENTS) }),
            waker,
            pending: AtomicUsize::new(0),
            weak: OnceLock::new(),
        });
        reactor.weak.set(Arc::downgrade(&reactor)).map_err(|_| ()).expect("reactor weak handle already set");
        {
            let weak = Arc::downgrade(&reactor);
            reactor.timers.set_notifier(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.tickle();
                }
            });
        }
        {
            let weak = Arc::downgrade(&reactor);
            reactor.scheduler.set_notifier(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.tickle();
                }
            });
        }
        FdManager::instance().reserve(INITIAL_FD_CONTEXTS);
        bind_current(Arc::downgrade(&reactor));
        scheduler::start(&reactor);
        IoManager { reactor }
    }

    /// Stops the manager: drains work, joins workers and unbinds the
    /// constructing thread. Safe to call twice; also run on drop.
    pub fn stop(&self) {
        scheduler::stop(&self.reactor);
        clear_current(&self.reactor);
    }

    pub fn name(&self) -> &str {
        self.reactor.scheduler.name()
    }

    /// OS thread ids of all participating workers.
    pub fn thread_ids(&self) -> Vec<u64> {
        self.reactor.scheduler.thread_ids()
    }

    /// Number of armed event slots.
    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    /// Schedules a callable; a worker runs it in a fresh fiber.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor.scheduler.spawn(f);
    }

    pub fn schedule(&self, task: Task) {
        self.reactor.scheduler.schedule(task);
    }

    /// Schedules `f` to fire in `ms` milliseconds, repeatedly if `recurring`.
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.add_timer(ms, f, recurring)
    }

    /// Schedules `f` like [IoManager::add_timer], skipping the callback at
    /// fire time if `condition` no longer refers to a live object.
    pub fn add_conditional_timer<F>(
        &self,
        ms: u64,
        f: F,
        condition: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.add_conditional_timer(ms, f, condition, recurring)
    }

    /// Arms `event` on `fd` with the calling fiber as party.
    pub fn add_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.reactor.add_event(fd, event, None)
    }

    /// Arms `event` on `fd` with `f` as party.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor.add_event(fd, event, Some(Box::new(f)))
    }

    /// Disarms `event` on `fd` without firing it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Disarms `event` on `fd`, firing its party synthetically.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event(fd, event)
    }

    /// Disarms all events on `fd`, firing armed parties synthetically.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Arms `event` on `fd` with the calling fiber as party, on the io manager
/// bound to this thread.
pub fn add_event(fd: RawFd, event: Event) -> io::Result<()> {
    let reactor = current().expect("no io manager bound to this thread");
    reactor.add_event(fd, event, None)
}

/// Arms `event` on `fd` with `f` as party, on the io manager bound to this
/// thread.
pub fn add_event_with<F>(fd: RawFd, event: Event, f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let reactor = current().expect("no io manager bound to this thread");
    reactor.add_event(fd, event, Some(Box::new(f)))
}

/// Disarms `event` on `fd` on the io manager bound to this thread.
pub fn del_event(fd: RawFd, event: Event) -> bool {
    let reactor = current().expect("no io manager bound to this thread");
    reactor.del_event(fd, event)
}

/// Disarms `event` on `fd`, firing its party, on the io manager bound to
/// this thread.
pub fn cancel_event(fd: RawFd, event: Event) -> bool {
    let reactor = current().expect("no io manager bound to this thread");
    reactor.cancel_event(fd, event)
}

/// Disarms all events on `fd`, firing armed parties, on the io manager bound
/// to this thread.
pub fn cancel_all(fd: RawFd) -> bool {
    let reactor = current().expect("no io manager bound to this thread");
    reactor.cancel_all(fd)
}

/// Schedules a timer on the io manager bound to this thread.
pub fn add_timer<F>(ms: u64, f: F, recurring: bool) -> Timer
where
    F: Fn() + Send + Sync + 'static,
{
    let reactor = current().expect("no io manager bound to this thread");
    reactor.add_timer(ms, f, recurring)
}

/// Schedules a conditional timer on the io manager bound to this thread.
pub fn add_conditional_timer<F>(ms: u64, f: F, condition: Weak<dyn Any + Send + Sync>, recurring: bool) -> Timer
where
    F: Fn() + Send + Sync + 'static,
{
    let reactor = current().expect("no io manager bound to this thread");
    reactor.add_conditional_timer(ms, f, condition, recurring)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_pair(a: RawFd, b: RawFd) {
        FdManager::instance().remove(a);
        FdManager::instance().remove(b);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn arm_and_disarm_round_trip() {
        let io_manager = IoManager::new(2, false, "arm");
        let (a, b) = socketpair();
        let (sender, receiver) = mpsc::channel();

        io_manager.add_event_with(a, Event::READ, move || sender.send(()).unwrap()).unwrap();
        let context = FdManager::instance().get(a, false).unwrap();
        assert_eq!(context.events(), Event::READ);
        assert_eq!(io_manager.pending_events(), 1);

        assert!(io_manager.del_event(a, Event::READ));
        assert_eq!(context.events(), Event::NONE);
        assert_eq!(io_manager.pending_events(), 0);
        assert!(!io_manager.del_event(a, Event::READ));
        assert!(receiver.try_recv().is_err());

        io_manager.stop();
        close_pair(a, b);
    }

    #[test]
    fn arming_twice_fails() {
        let io_manager = IoManager::new(2, false, "twice");
        let (a, b) = socketpair();

        io_manager.add_event_with(a, Event::READ, || {}).unwrap();
        let err = io_manager.add_event_with(a, Event::READ, || {}).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        assert!(io_manager.del_event(a, Event::READ));
        io_manager.stop();
        close_pair(a, b);
    }

    #[test]
    fn readiness_schedules_party() {
        let io_manager = IoManager::new(2, false, "ready");
        let (a, b) = socketpair();
        let (sender, receiver) = mpsc::channel();

        io_manager.add_event_with(a, Event::READ, move || sender.send("readable").unwrap()).unwrap();
        assert_eq!(unsafe { libc::write(b, "x".as_ptr() as *const libc::c_void, 1) }, 1);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), "readable");
        assert_eq!(io_manager.pending_events(), 0);

        let context = FdManager::instance().get(a, false).unwrap();
        assert_eq!(context.events(), Event::NONE);

        io_manager.stop();
        close_pair(a, b);
    }

    #[test]
    fn cancel_event_fires_party() {
        let io_manager = IoManager::new(2, false, "cancel");
        let (a, b) = socketpair();
        let (sender, receiver) = mpsc::channel();

        io_manager.add_event_with(a, Event::READ, move || sender.send("fired").unwrap()).unwrap();
        assert!(io_manager.cancel_event(a, Event::READ));
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), "fired");
        assert!(!io_manager.cancel_event(a, Event::READ));
        assert_eq!(io_manager.pending_events(), 0);

        io_manager.stop();
        close_pair(a, b);
    }

    #[test]
    fn cancel_all_fires_both_directions() {
        let io_manager = IoManager::new(2, false, "cancel-all");
        let (a, b) = socketpair();
        let (sender, receiver) = mpsc::channel();

        // Probe first so the fill loop below runs non-blocking, then fill the
        // send buffer so WRITE stays armed.
        FdManager::instance().get(a, true).unwrap();
        let buf = vec![0u8; 1 << 20];
        while unsafe { libc::send(a, buf.as_ptr() as *const libc::c_void, buf.len(), 0) } > 0 {}

        let read_sender = sender.clone();
        io_manager.add_event_with(a, Event::READ, move || read_sender.send("read").unwrap()).unwrap();
        io_manager.add_event_with(a, Event::WRITE, move || sender.send("write").unwrap()).unwrap();
        assert_eq!(io_manager.pending_events(), 2);

        assert!(io_manager.cancel_all(a));
        let mut fired = vec![
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        fired.sort();
        assert_eq!(fired, vec!["read", "write"]);
        assert_eq!(io_manager.pending_events(), 0);
        assert!(!io_manager.cancel_all(a));

        io_manager.stop();
        close_pair(a, b);
    }

    #[test]
    fn timer_fires_through_reactor() {
        let io_manager = IoManager::new(2, false, "timer");
        let (sender, receiver) = mpsc::channel();
        let sender = std::sync::Mutex::new(sender);
        io_manager.add_timer(20, move || sender.lock().unwrap().send(()).unwrap(), false);
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_ok());
        io_manager.stop();
    }
}
