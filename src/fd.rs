//! Per-descriptor runtime state and the process-wide descriptor store.

use std::cmp;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use lazy_static::lazy_static;

use crate::fiber::Fiber;
use crate::reactor::{Event, Reactor};
use crate::scheduler::Call;

/// Timeout sentinel: block without a deadline.
pub(crate) const INFINITE_TIMEOUT: u64 = u64::MAX;

const INITIAL_CONTEXTS: usize = 64;

pub(crate) enum Party {
    Fiber(Arc<Fiber>),
    Call(Call),
}

/// One armed readiness direction: the reactor that registered it and the
/// party to schedule on readiness.
#[derive(Default)]
pub(crate) struct EventSlot {
    pub scheduler: Weak<Reactor>,
    pub party: Option<Party>,
}

impl EventSlot {
    pub fn is_armed(&self) -> bool {
        self.party.is_some()
    }

    pub fn clear(&mut self) {
        self.scheduler = Weak::new();
        self.party = None;
    }
}

/// Armed state of a descriptor. `events` mirrors exactly which slots hold a
/// party; all mutations happen under the owning [FdContext]'s mutex.
#[derive(Default)]
pub(crate) struct EventSlots {
    pub events: Event,
    pub read: EventSlot,
    pub write: EventSlot,
}

impl EventSlots {
    pub fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => panic!("no event slot for {:?}", event),
        }
    }
}

/// Runtime metadata of one file descriptor.
///
/// Sockets are switched to kernel-level non-blocking on first sight; the
/// non-blocking mode the user asked for is tracked separately so fcntl keeps
/// lying consistently.
pub struct FdContext {
    fd: RawFd,
    initialized: bool,
    socket: bool,
    sys_nonblock: bool,
    closed: AtomicBool,
    user_nonblock: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
    pub(crate) slots: Mutex<EventSlots>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        let mut stat = mem::MaybeUninit::<libc::stat>::uninit();
        let (initialized, socket) = if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
            (false, false)
        } else {
            let stat = unsafe { stat.assume_init() };
            (true, stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };
        let mut sys_nonblock = false;
        if socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }
        FdContext {
            fd,
            initialized,
            socket,
            sys_nonblock,
            closed: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(INFINITE_TIMEOUT),
            send_timeout: AtomicU64::new(INFINITE_TIMEOUT),
            slots: Mutex::new(EventSlots::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_socket(&self) -> bool {
        self.socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub(crate) fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Timeout in milliseconds for the given direction, `u64::MAX` meaning
    /// none.
    pub fn timeout(&self, event: Event) -> u64 {
        match event {
            Event::READ => self.recv_timeout.load(Ordering::Acquire),
            _ => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub(crate) fn set_timeout(&self, event: Event, ms: u64) {
        match event {
            Event::READ => self.recv_timeout.store(ms, Ordering::Release),
            _ => self.send_timeout.store(ms, Ordering::Release),
        }
    }

    /// The currently armed readiness directions.
    pub fn events(&self) -> Event {
        self.slots.lock().unwrap().events
    }
}

lazy_static! {
    static ref FD_MANAGER: FdManager = FdManager::new();
}

/// Process-wide store of [FdContext]s, indexed by descriptor value.
///
/// POSIX hands out small dense descriptors, so the store is a grow-on-demand
/// vector: lookups take a read lock and an index, growth serializes writers.
pub struct FdManager {
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager { contexts: RwLock::new(vec![None; INITIAL_CONTEXTS]) }
    }

    pub fn instance() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Looks up the context of `fd`, creating and probing one when
    /// `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let contexts = self.contexts.read().unwrap();
            match contexts.get(index) {
                Some(Some(context)) => return Some(context.clone()),
                _ => {
                    if !auto_create {
                        return None;
                    }
                },
            }
        }
        let mut contexts = self.contexts.write().unwrap();
        if contexts.len() <= index {
            let target = cmp::max(index * 3 / 2, index + 1);
            contexts.resize(target, None);
        }
        if let Some(context) = &contexts[index] {
            return Some(context.clone());
        }
        let context = Arc::new(FdContext::new(fd));
        contexts[index] = Some(context.clone());
        Some(context)
    }

    /// Drops the context of `fd`. The descriptor itself stays open.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut contexts = self.contexts.write().unwrap();
        if let Some(slot) = contexts.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub(crate) fn reserve(&self, len: usize) {
        let mut contexts = self.contexts.write().unwrap();
        if contexts.len() < len {
            contexts.resize(len, None);
        }
    }
}
