//! Blocking-call interposition.
//!
//! Every function here mirrors a libc call. With the thread-local hook flag
//! off they delegate straight to the OS; with it on, calls that would block
//! a worker thread are re-expressed as non-blocking attempts plus fiber
//! suspension on the io manager bound to the thread. Workers of an
//! [crate::reactor::IoManager] run with the flag on.

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use errno::{errno, set_errno, Errno};
use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use log::error;

use crate::fd::{FdManager, INFINITE_TIMEOUT};
use crate::fiber::{self, Fiber};
use crate::reactor::{self, Event};
use crate::scheduler::Task;

thread_local! {
    static ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether blocking-call interposition is on for this thread.
pub fn is_enabled() -> bool {
    ENABLED.with(|cell| cell.get())
}

/// Switches blocking-call interposition for this thread.
pub fn set_enabled(enabled: bool) {
    ENABLED.with(|cell| cell.set(enabled));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(INFINITE_TIMEOUT);

/// Sets the process-wide timeout applied by [connect], in milliseconds.
pub fn set_connect_timeout(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Release);
}

// Per-operation state shared with the timeout timer. It doubles as the
// conditional timer's sentinel: the timer body is skipped once the operation
// frame is gone.
#[derive(Default)]
struct OpToken {
    cancelled: AtomicI32,
}

fn park_timer(reactor: &Arc<reactor::Reactor>, token: &Arc<OpToken>, fd: c_int, event: Event, timeout: u64) -> Option<crate::timer::Timer> {
    if timeout == INFINITE_TIMEOUT {
        return None;
    }
    let sentinel: Arc<dyn Any + Send + Sync> = token.clone();
    let weak_token = Arc::downgrade(token);
    let weak_reactor = Arc::downgrade(reactor);
    let timer = reactor.add_conditional_timer(
        timeout,
        move || {
            let Some(token) = weak_token.upgrade() else {
                return;
            };
            if token.cancelled.swap(libc::ETIMEDOUT, Ordering::AcqRel) != 0 {
                return;
            }
            if let Some(reactor) = weak_reactor.upgrade() {
                reactor.cancel_event(fd, event);
            }
        },
        Arc::downgrade(&sentinel),
        false,
    );
    Some(timer)
}

fn do_io<F>(fd: c_int, event: Event, name: &str, mut raw: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_enabled() {
        return raw();
    }
    let Some(context) = FdManager::instance().get(fd, false) else {
        return raw();
    };
    if context.is_closed() {
        set_errno(Errno(libc::EBADF));
        return -1;
    }
    if !context.is_socket() || context.user_nonblock() {
        return raw();
    }
    let timeout = context.timeout(event);
    let token = Arc::new(OpToken::default());
    loop {
        let mut n = raw();
        while n == -1 && errno().0 == libc::EINTR {
            n = raw();
        }
        if n != -1 || errno().0 != libc::EAGAIN {
            return n;
        }
        let reactor = reactor::current().expect("no io manager bound to this thread");
        let timer = park_timer(&reactor, &token, fd, event, timeout);
        if let Err(err) = reactor.add_event(fd, event, None) {
            error!("{}: failed to arm fd {} for {:?}: {}", name, fd, event, err);
            if let Some(timer) = timer {
                timer.cancel();
            }
            set_errno(Errno(err.raw_os_error().unwrap_or(libc::EINVAL)));
            return -1;
        }
        fiber::yield_now();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = token.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            set_errno(Errno(cancelled));
            return -1;
        }
        // Woken by readiness; retry the raw operation.
    }
}

fn sleep_for(ms: u64) {
    let reactor = reactor::current().expect("no io manager bound to this thread");
    let fiber = Fiber::current();
    let weak = Arc::downgrade(&reactor);
    reactor.add_timer(
        ms,
        move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.schedule(Task::fiber(fiber.clone()));
            }
        },
        false,
    );
    fiber::yield_now();
}

/// Parks the calling fiber for `seconds` seconds.
pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_for(u64::from(seconds) * 1000);
    0
}

/// Parks the calling fiber for `usec` microseconds, at millisecond
/// granularity.
pub fn usleep(usec: c_uint) -> c_int {
    if !is_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_for(u64::from(usec) / 1000);
    0
}

/// Parks the calling fiber for the requested interval, at millisecond
/// granularity. `rem` is left untouched.
///
/// # Safety
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_enabled() {
        return libc::nanosleep(req, rem);
    }
    let req = &*req;
    sleep_for(req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000);
    0
}

/// Creates a socket and registers it with the descriptor store, switching it
/// to kernel-level non-blocking.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_enabled() || fd == -1 {
        return fd;
    }
    FdManager::instance().get(fd, true);
    fd
}

/// [connect] with an explicit timeout in milliseconds, `u64::MAX` meaning
/// none.
///
/// # Safety
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect_with_timeout(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t, timeout_ms: u64) -> c_int {
    if !is_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(context) = FdManager::instance().get(fd, false) else {
        set_errno(Errno(libc::EBADF));
        return -1;
    };
    if context.is_closed() {
        set_errno(Errno(libc::EBADF));
        return -1;
    }
    if !context.is_socket() || context.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    } else if n != -1 || errno().0 != libc::EINPROGRESS {
        return n;
    }

    // In progress: completion surfaces as write readiness.
    let reactor = reactor::current().expect("no io manager bound to this thread");
    let token = Arc::new(OpToken::default());
    let timer = park_timer(&reactor, &token, fd, Event::WRITE, timeout_ms);
    match reactor.add_event(fd, Event::WRITE, None) {
        Ok(_) => {
            fiber::yield_now();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let cancelled = token.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(Errno(cancelled));
                return -1;
            }
        },
        Err(err) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            error!("connect: failed to arm fd {} for WRITE: {}", fd, err);
        },
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut c_int as *mut c_void, &mut len) == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(Errno(err));
        -1
    }
}

/// Connects `fd`, parking the calling fiber until the connection resolves or
/// the process-wide connect timeout expires.
///
/// # Safety
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Acquire))
}

/// Accepts a connection, parking the calling fiber until one arrives. The
/// accepted descriptor is registered with the store so operations on it are
/// interposable.
///
/// # Safety
/// `addr` and `addrlen` follow the accept(2) contract; both may be null.
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let n = do_io(fd, Event::READ, "accept", || libc::accept(fd, addr, addrlen) as ssize_t);
    let accepted = n as c_int;
    if accepted >= 0 {
        FdManager::instance().get(accepted, true);
    }
    accepted
}

/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, Event::READ, "read", || libc::read(fd, buf, count))
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Event::READ, "readv", || libc::readv(fd, iov, iovcnt))
}

/// # Safety
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Event::READ, "recv", || libc::recv(fd, buf, len, flags))
}

/// # Safety
/// Pointer arguments follow the recvfrom(2) contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, Event::READ, "recvfrom", || libc::recvfrom(fd, buf, len, flags, src_addr, addrlen))
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Event::READ, "recvmsg", || libc::recvmsg(fd, msg, flags))
}

/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, Event::WRITE, "write", || libc::write(fd, buf, count))
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Event::WRITE, "writev", || libc::writev(fd, iov, iovcnt))
}

/// # Safety
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Event::WRITE, "send", || libc::send(fd, buf, len, flags))
}

/// # Safety
/// Pointer arguments follow the sendto(2) contract.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, Event::WRITE, "sendto", || libc::sendto(fd, buf, len, flags, dest_addr, addrlen))
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Event::WRITE, "sendmsg", || libc::sendmsg(fd, msg, flags))
}

/// Closes `fd`, waking fibers parked on it so they observe EBADF, and drops
/// its store entry.
pub fn close(fd: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { libc::close(fd) };
    }
    if let Some(context) = FdManager::instance().get(fd, false) {
        if let Some(reactor) = reactor::current() {
            reactor.cancel_all(fd);
        }
        context.set_closed();
        FdManager::instance().remove(fd);
    }
    unsafe { libc::close(fd) }
}

/// fcntl with non-blocking virtualization: F_SETFL records the caller's
/// O_NONBLOCK intent while the kernel flag stays under runtime control, and
/// F_GETFL reports the recorded intent back. Other commands pass through
/// with `arg` forwarded verbatim.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { libc::fcntl(fd, cmd, arg) };
    }
    match cmd {
        libc::F_SETFL => {
            let Some(context) = FdManager::instance().get(fd, false) else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            if context.is_closed() || !context.is_socket() {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            }
            context.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if context.sys_nonblock() { arg | libc::O_NONBLOCK } else { arg & !libc::O_NONBLOCK };
            unsafe { libc::fcntl(fd, cmd, arg) }
        },
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            let Some(context) = FdManager::instance().get(fd, false) else {
                return flags;
            };
            if context.is_closed() || !context.is_socket() {
                return flags;
            }
            if context.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        },
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// ioctl; FIONBIO updates the recorded non-blocking intent before passing
/// through.
///
/// # Safety
/// `arg` follows the ioctl(2) contract for `request`.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if is_enabled() && request == libc::FIONBIO as c_ulong {
        let nonblock = *(arg as *const c_int) != 0;
        if let Some(context) = FdManager::instance().get(fd, false) {
            if !context.is_closed() && context.is_socket() {
                context.set_user_nonblock(nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// setsockopt; SO_RCVTIMEO and SO_SNDTIMEO are recorded in the descriptor
/// store before passing through, a zero duration meaning no timeout.
///
/// # Safety
/// `optval` must be valid for reads of `optlen` bytes.
pub unsafe fn setsockopt(fd: c_int, level: c_int, optname: c_int, optval: *const c_void, optlen: socklen_t) -> c_int {
    if !is_enabled() {
        return libc::setsockopt(fd, level, optname, optval, optlen);
    }
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        if let Some(context) = FdManager::instance().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let ms = if ms == 0 { INFINITE_TIMEOUT } else { ms };
            let event = if optname == libc::SO_RCVTIMEO { Event::READ } else { Event::WRITE };
            context.set_timeout(event, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fd::FdManager;

    fn socketpair() -> (c_int, c_int) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn cleanup(a: c_int, b: c_int) {
        FdManager::instance().remove(a);
        FdManager::instance().remove(b);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn disabled_socket_is_raw() {
        set_enabled(false);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert!(FdManager::instance().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn enabled_socket_is_registered() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let context = FdManager::instance().get(fd, false).unwrap();
        assert!(context.is_socket());
        FdManager::instance().remove(fd);
        unsafe { libc::close(fd) };
        set_enabled(false);
    }

    #[test]
    fn fcntl_virtualizes_nonblock() {
        set_enabled(true);
        let (a, b) = socketpair();
        FdManager::instance().get(a, true).unwrap();

        // The store imposed O_NONBLOCK on the kernel fd, yet the caller has
        // not asked for it.
        let flags = fcntl(a, libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        let raw_flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert!(raw_flags & libc::O_NONBLOCK != 0);

        let rc = fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK);
        assert_eq!(rc, 0);
        assert!(fcntl(a, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);
        assert!(FdManager::instance().get(a, false).unwrap().user_nonblock());

        cleanup(a, b);
        set_enabled(false);
    }

    #[test]
    fn ioctl_records_nonblock_intent() {
        set_enabled(true);
        let (a, b) = socketpair();
        FdManager::instance().get(a, true).unwrap();

        let mut on: c_int = 1;
        let rc = unsafe { ioctl(a, libc::FIONBIO as c_ulong, &mut on as *mut c_int as *mut c_void) };
        assert_eq!(rc, 0);
        assert!(FdManager::instance().get(a, false).unwrap().user_nonblock());

        cleanup(a, b);
        set_enabled(false);
    }

    #[test]
    fn setsockopt_records_timeouts() {
        set_enabled(true);
        let (a, b) = socketpair();
        FdManager::instance().get(a, true).unwrap();

        let tv = libc::timeval { tv_sec: 0, tv_usec: 50_000 };
        let rc = unsafe {
            setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);
        let context = FdManager::instance().get(a, false).unwrap();
        assert_eq!(context.timeout(Event::READ), 50);
        assert_eq!(context.timeout(Event::WRITE), INFINITE_TIMEOUT);

        cleanup(a, b);
        set_enabled(false);
    }
}
