//! Ordered timer set with one-shot, recurring and conditional timers.

use std::any::Any;
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, SystemTime};

use static_assertions::assert_impl_all;

static TIMER_ID: AtomicU64 = AtomicU64::new(1);

// A wall clock jump this far backwards is a clock adjustment, not elapsed
// time; pending deadlines would otherwise be pushed out of reach.
const ROLLOVER_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Callables fired by timers. Recurring timers invoke theirs repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[cfg(not(test))]
fn now() -> SystemTime {
    SystemTime::now()
}

#[cfg(test)]
fn now() -> SystemTime {
    tests::skewed_now()
}

struct TimerState {
    deadline: SystemTime,
    period: Duration,
    recurring: bool,
    callback: Option<TimerCallback>,
}

struct TimerShared {
    id: u64,
    manager: Weak<TimerInner>,
    state: Mutex<TimerState>,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

assert_impl_all!(Timer: Send, Sync);

impl Timer {
    /// Removes the timer from its manager and clears the callback.
    ///
    /// Returns false if the timer already fired, was already cancelled or
    /// outlived its manager.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.shared.manager.upgrade() else {
            return false;
        };
        let mut core = inner.core.write().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        if state.callback.is_none() {
            return false;
        }
        state.callback = None;
        core.timers.remove(&(state.deadline, self.shared.id));
        true
    }

    /// Pushes the deadline out to now plus the timer's period.
    pub fn refresh(&self) -> bool {
        let Some(inner) = self.shared.manager.upgrade() else {
            return false;
        };
        let mut core = inner.core.write().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        if state.callback.is_none() {
            return false;
        }
        if core.timers.remove(&(state.deadline, self.shared.id)).is_none() {
            return false;
        }
        state.deadline = now() + state.period;
        core.timers.insert((state.deadline, self.shared.id), self.shared.clone());
        true
    }

    /// Rebases the timer onto a new period.
    ///
    /// The new deadline counts from now when `from_now`, otherwise from the
    /// start of the current period.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let period = Duration::from_millis(ms);
        let Some(inner) = self.shared.manager.upgrade() else {
            return false;
        };
        let deadline = {
            let mut core = inner.core.write().unwrap();
            let mut state = self.shared.state.lock().unwrap();
            if state.period == period && !from_now {
                return true;
            }
            if state.callback.is_none() {
                return false;
            }
            if core.timers.remove(&(state.deadline, self.shared.id)).is_none() {
                return false;
            }
            let base = if from_now { now() } else { state.deadline - state.period };
            state.period = period;
            state.deadline = base + period;
            state.deadline
        };
        TimerInner::insert(&inner, self.shared.clone(), deadline);
        true
    }
}

struct TimerCore {
    timers: BTreeMap<(SystemTime, u64), Arc<TimerShared>>,
    previous: SystemTime,
}

struct TimerInner {
    core: RwLock<TimerCore>,
    tickled: AtomicBool,
    notifier: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerInner {
    fn insert(inner: &Arc<TimerInner>, shared: Arc<TimerShared>, deadline: SystemTime) {
        let key = (deadline, shared.id);
        let at_front = {
            let mut core = inner.core.write().unwrap();
            core.timers.insert(key, shared);
            let front = core.timers.keys().next() == Some(&key);
            // Coalesce repeated head insertions into one notification until
            // next_timeout is queried again.
            front && !inner.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(notify) = inner.notifier.get() {
                notify();
            }
        }
    }
}

/// Ordered collection of timers with efficient next-deadline and expired-now
/// queries.
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

assert_impl_all!(TimerManager: Send, Sync);

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Arc::new(TimerInner {
                core: RwLock::new(TimerCore { timers: BTreeMap::new(), previous: now() }),
                tickled: AtomicBool::new(false),
                notifier: OnceLock::new(),
            }),
        }
    }

    /// Installs the hook invoked when a timer lands at the head of the set.
    pub(crate) fn set_notifier(&self, notify: impl Fn() + Send + Sync + 'static) {
        if self.inner.notifier.set(Box::new(notify)).is_err() {
            panic!("timer notifier already set");
        }
    }

    /// Schedules `f` to fire in `ms` milliseconds, repeatedly if `recurring`.
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add(ms, Arc::new(f), recurring)
    }

    /// Schedules `f` like [TimerManager::add_timer], but skips the callback
    /// at fire time if `condition` no longer refers to a live object.
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
        self.add(
            ms,
            Arc::new(move || {
                if condition.upgrade().is_some() {
                    f();
                }
            }),
            recurring,
        )
    }

    fn add(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Timer {
        let period = Duration::from_millis(ms);
        let deadline = now() + period;
        let shared = Arc::new(TimerShared {
            id: TIMER_ID.fetch_add(1, Ordering::Relaxed),
            manager: Arc::downgrade(&self.inner),
            state: Mutex::new(TimerState { deadline, period, recurring, callback: Some(callback) }),
        });
        TimerInner::insert(&self.inner, shared.clone(), deadline);
        Timer { shared }
    }

    /// Returns the duration until the earliest deadline, zero if one is
    /// already due and None if the set is empty.
    pub fn next_timeout(&self) -> Option<Duration> {
        let core = self.inner.core.read().unwrap();
        self.inner.tickled.store(false, Ordering::Release);
        let (&(deadline, _), _) = core.timers.iter().next()?;
        Some(deadline.duration_since(now()).unwrap_or(Duration::ZERO))
    }

    /// Appends the callbacks of all due timers to `expired`. Recurring timers
    /// are reinserted at now plus their period; one-shot timers are removed
    /// and their callbacks cleared.
    pub fn drain_expired(&self, expired: &mut Vec<TimerCallback>) {
        let now = now();
        let mut core = self.inner.core.write().unwrap();
        let rollover = detect_clock_rollover(&mut core.previous, now);
        // Snapshot the due set up front; timers reinserted below must not be
        // drained again in the same pass.
        let due = if rollover {
            mem::take(&mut core.timers)
        } else {
            let rest = core.timers.split_off(&(now, u64::MAX));
            mem::replace(&mut core.timers, rest)
        };
        for (_, shared) in due {
            let mut state = shared.state.lock().unwrap();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            expired.push(callback);
            if state.recurring {
                state.deadline = now + state.period;
                let key = (state.deadline, shared.id);
                drop(state);
                core.timers.insert(key, shared);
            } else {
                state.callback = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        let core = self.inner.core.read().unwrap();
        !core.timers.is_empty()
    }
}

fn detect_clock_rollover(previous: &mut SystemTime, now: SystemTime) -> bool {
    let rollover = match previous.duration_since(now) {
        Ok(backwards) => backwards > ROLLOVER_THRESHOLD,
        Err(_) => false,
    };
    *previous = now;
    rollover
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, SystemTime};

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    thread_local! {
        static CLOCK_SKEW_MS: std::cell::Cell<i64> = std::cell::Cell::new(0);
    }

    pub(super) fn skewed_now() -> SystemTime {
        let now = SystemTime::now();
        let skew = CLOCK_SKEW_MS.with(|cell| cell.get());
        if skew >= 0 {
            now + Duration::from_millis(skew as u64)
        } else {
            now - Duration::from_millis(-skew as u64)
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Clone + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared_count = count.clone();
        (count, move || {
            shared_count.fetch_add(1, Ordering::AcqRel);
        })
    }

    #[test]
    fn next_timeout() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timeout(), None);
        assert!(!manager.has_timer());

        let (_count, f) = counter();
        manager.add_timer(50, f, false);
        assert!(manager.has_timer());
        let next = manager.next_timeout().unwrap();
        assert!(next <= Duration::from_millis(50));

        thread::sleep(Duration::from_millis(60));
        assert_eq!(manager.next_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn drain_in_deadline_order() {
        let manager = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            manager.add_timer(ms, move || order.lock().unwrap().push(ms), false);
        }
        thread::sleep(Duration::from_millis(50));
        let mut expired = Vec::new();
        manager.drain_expired(&mut expired);
        assert_eq!(expired.len(), 3);
        for callback in expired.iter() {
            callback();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert!(!manager.has_timer());
    }

    #[test]
    fn cancel_before_fire() {
        let manager = TimerManager::new();
        let (count, f) = counter();
        let timer = manager.add_timer(50, f, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());

        thread::sleep(Duration::from_millis(100));
        let mut expired = Vec::new();
        manager.drain_expired(&mut expired);
        assert!(expired.is_empty());
        assert_eq!(count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn cancel_after_fire() {
        let manager = TimerManager::new();
        let (_count, f) = counter();
        let timer = manager.add_timer(0, f, false);
        thread::sleep(Duration::from_millis(10));
        let mut expired = Vec::new();
        manager.drain_expired(&mut expired);
        assert_eq!(expired.len(), 1);
        assert!(!timer.cancel());
    }

    #[test]
    fn recurring_reinserts() {
        let manager = TimerManager::new();
        let (_count, f) = counter();
        manager.add_timer(0, f, true);
        let mut expired = Vec::new();
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(5));
            manager.drain_expired(&mut expired);
        }
        assert_eq!(expired.len(), 3);
        assert!(manager.has_timer());
    }

    #[test]
    fn refresh_is_idempotent() {
        let manager = TimerManager::new();
        let (_count, f) = counter();
        let timer = manager.add_timer(50, f, false);
        thread::sleep(Duration::from_millis(30));
        assert!(timer.refresh());
        assert!(timer.refresh());
        // Both refreshes rebased the deadline to roughly now + period.
        let next = manager.next_timeout().unwrap();
        assert!(next > Duration::from_millis(30));
        assert!(next <= Duration::from_millis(50));
    }

    #[test_case(true; "from now")]
    #[test_case(false; "from period start")]
    fn reset_rebases(from_now: bool) {
        let manager = TimerManager::new();
        let (_count, f) = counter();
        let timer = manager.add_timer(20, f, false);
        assert!(timer.reset(200, from_now));
        let next = manager.next_timeout().unwrap();
        assert!(next > Duration::from_millis(100));
        assert!(next <= Duration::from_millis(200));
    }

    #[test]
    fn reset_same_period_is_noop() {
        let manager = TimerManager::new();
        let (_count, f) = counter();
        let timer = manager.add_timer(50, f, false);
        assert!(timer.reset(50, false));
        assert!(timer.cancel());
    }

    #[test]
    fn conditional_timer_with_dead_sentinel() {
        let manager = TimerManager::new();
        let (count, f) = counter();
        let sentinel: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        manager.add_conditional_timer(0, f, Arc::downgrade(&sentinel), false);
        drop(sentinel);

        thread::sleep(Duration::from_millis(10));
        let mut expired = Vec::new();
        manager.drain_expired(&mut expired);
        assert_eq!(expired.len(), 1);
        expired[0]();
        assert_eq!(count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn conditional_timer_with_live_sentinel() {
        let manager = TimerManager::new();
        let (count, f) = counter();
        let sentinel: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        manager.add_conditional_timer(0, f, Arc::downgrade(&sentinel), false);

        thread::sleep(Duration::from_millis(10));
        let mut expired = Vec::new();
        manager.drain_expired(&mut expired);
        assert_eq!(expired.len(), 1);
        expired[0]();
        assert_eq!(count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn head_insertion_notifies_once() {
        let manager = TimerManager::new();
        let (notifications, notify) = counter();
        manager.set_notifier(notify);

        let (_count, f) = counter();
        manager.add_timer(1000, f.clone(), false);
        assert_eq!(notifications.load(Ordering::Acquire), 1);

        // Repeated head insertions coalesce until next_timeout runs.
        manager.add_timer(500, f.clone(), false);
        manager.add_timer(100, f.clone(), false);
        assert_eq!(notifications.load(Ordering::Acquire), 1);

        manager.next_timeout();
        manager.add_timer(50, f, false);
        assert_eq!(notifications.load(Ordering::Acquire), 2);
    }

    #[test]
    fn clock_rollover_expires_all() {
        let manager = TimerManager::new();
        let (_count, f) = counter();
        manager.add_timer(100, f.clone(), false);
        let recurring = manager.add_timer(1000, f, true);

        // Prime the rollover reference, then jump the clock backwards by two
        // hours.
        let mut expired = Vec::new();
        manager.drain_expired(&mut expired);
        assert!(expired.is_empty());

        CLOCK_SKEW_MS.with(|cell| cell.set(-2 * 60 * 60 * 1000));
        manager.drain_expired(&mut expired);
        CLOCK_SKEW_MS.with(|cell| cell.set(0));

        assert_eq!(expired.len(), 2);
        // The recurring timer was rescheduled from the post-jump clock.
        assert!(manager.has_timer());
        assert!(recurring.cancel());
    }
}
