#![allow(clippy::needless_doctest_main)]

//! # Cooperative stackful fiber runtime for Linux
//! `strand` lets straight-line, apparently-blocking code run as lightweight
//! fibers multiplexed over a small pool of worker threads. A readiness
//! reactor resumes fibers when descriptors become ready or timers expire,
//! and a blocking-call interposition layer turns would-block syscalls into
//! fiber suspensions.
//!
//! ## Usage
//! Construct an [reactor::IoManager] (or tag `main` with [macro@main]) and
//! submit work with [spawn].
//!
//! * Use [spawn] to schedule a callable as a fiber of the running scheduler.
//! * Use [hook] functions in place of blocking syscalls; workers run with
//!   interposition enabled, so sleeps and socket io suspend the calling
//!   fiber instead of the thread.
//! * Use [reactor::add_event_with] and [reactor::add_timer] to bind
//!   callables to descriptor readiness and deadlines directly.
//!
//! ## Example
//! ```rust
//! use std::sync::mpsc;
//!
//! #[strand::main(threads = 2)]
//! fn main() {
//!     let (sender, receiver) = mpsc::channel();
//!     strand::spawn(move || {
//!         strand::hook::usleep(10_000);
//!         sender.send(5).unwrap();
//!     });
//!     let five = loop {
//!         match receiver.try_recv() {
//!             Ok(value) => break value,
//!             // Park instead of busy-yielding so the reactor gets to run.
//!             Err(_) => {
//!                 strand::hook::usleep(1_000);
//!             },
//!         }
//!     };
//!     assert_eq!(five, 5);
//! }
//! ```

pub mod fd;
pub mod fiber;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use fiber::{Fiber, StackSize};
pub use reactor::{Event, IoManager};
pub use scheduler::{spawn, Scheduler, Task};
pub use timer::Timer;

#[cfg(not(test))]
pub use strand_macros::main;
pub use strand_macros::test;
