//! Timer wheel: an ordered set of deadlines with cancel, refresh and
//! recurring semantics.
//!
//! Timers are ordered by `(deadline, id)` — a total order, so drains are
//! deterministic under deadline ties. The wheel does not run callbacks
//! itself: the owner calls [`TimerWheel::drain_expired`] and schedules the
//! returned callbacks, which is how the reactor fuses timer wakeups with its
//! poll loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};
use std::time::Instant;

/// Sentinel deadline meaning "no timer armed".
pub const NO_DEADLINE: u64 = u64::MAX;

/// Clock jumps backwards by more than this are treated as a rollover.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds since the process monotonic epoch.
pub fn elapsed_ms() -> u64 { EPOCH.elapsed().as_millis() as u64 }

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerShared {
    id: u64,
    deadline: AtomicU64,
    period_ms: AtomicU64,
    recurring: AtomicBool,
    // None once cancelled or after a one-shot expiry.
    callback: Mutex<Option<TimerCallback>>,
}

/// Handle to a timer registered in a [`TimerWheel`]. Dropping the handle
/// does not cancel the timer.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
    wheel: Weak<WheelInner>,
}

struct WheelInner {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerShared>>>,
    // Suppresses repeated front-insert notifications between two reads of
    // the next deadline.
    ticked: AtomicBool,
    previous_now: AtomicU64,
    next_id: AtomicU64,
    notify: Box<dyn Fn() + Send + Sync>,
}

/// The ordered deadline set.
pub struct TimerWheel {
    inner: Arc<WheelInner>,
}

impl TimerWheel {
    /// Creates a wheel. `notify` is invoked whenever an insertion lands at
    /// the front of the set, so the owner can shorten its current wait.
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> TimerWheel {
        TimerWheel {
            inner: Arc::new(WheelInner {
                timers: RwLock::new(BTreeMap::new()),
                ticked: AtomicBool::new(false),
                previous_now: AtomicU64::new(elapsed_ms()),
                next_id: AtomicU64::new(1),
                notify: Box::new(notify),
            }),
        }
    }

    fn new_shared(&self, period_ms: u64, cb: TimerCallback, recurring: bool) -> Arc<TimerShared> {
        Arc::new(TimerShared {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            deadline: AtomicU64::new(elapsed_ms().saturating_add(period_ms)),
            period_ms: AtomicU64::new(period_ms),
            recurring: AtomicBool::new(recurring),
            callback: Mutex::new(Some(cb)),
        })
    }

    /// Registers `callback` to run `delay_ms` from now; recurring timers
    /// re-arm themselves with the same period on every expiry.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let shared = self.new_shared(delay_ms, Arc::new(callback), recurring);
        self.inner.insert(shared.clone());
        Timer { shared, wheel: Arc::downgrade(&self.inner) }
    }

    /// Like [`Self::add_timer`], but the callback only runs if `witness` can
    /// still be upgraded at fire time.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            delay_ms,
            move || {
                if witness.upgrade().is_some() {
                    callback()
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the soonest timer: 0 when one is already due,
    /// [`NO_DEADLINE`] when the set is empty.
    pub fn next_deadline_ms(&self) -> u64 {
        let timers = self.inner.timers.read().expect("timer wheel lock");
        self.inner.ticked.store(false, Ordering::Release);
        match timers.keys().next() {
            None => NO_DEADLINE,
            Some(&(deadline, _)) => deadline.saturating_sub(elapsed_ms()),
        }
    }

    pub fn has_timers(&self) -> bool {
        !self.inner.timers.read().expect("timer wheel lock").is_empty()
    }

    /// Removes every expired timer, collecting its callback into `out`;
    /// recurring timers are re-inserted with deadline `now + period`. The
    /// caller must schedule the collected callbacks.
    pub(crate) fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = elapsed_ms();
        {
            let timers = self.inner.timers.read().expect("timer wheel lock");
            if timers.is_empty() {
                return;
            }
        }

        let mut timers = self.inner.timers.write().expect("timer wheel lock");
        if timers.is_empty() {
            return;
        }

        let rollover = self.inner.detect_rollover(now);
        if !rollover
            && timers.keys().next().map(|&(deadline, _)| deadline > now).unwrap_or(true)
        {
            return;
        }

        let split = if rollover { (NO_DEADLINE, u64::MAX) } else { (now, u64::MAX) };
        let live = timers.split_off(&(split.0, split.1));
        let expired = std::mem::replace(&mut *timers, live);

        out.reserve(expired.len());
        for shared in expired.into_values() {
            let mut cb = shared.callback.lock().expect("timer callback lock");
            let Some(callback) = cb.clone() else { continue };
            out.push(callback);
            if shared.recurring.load(Ordering::Acquire) {
                let deadline =
                    now.saturating_add(shared.period_ms.load(Ordering::Acquire));
                shared.deadline.store(deadline, Ordering::Release);
                drop(cb);
                timers.insert((deadline, shared.id), shared);
            } else {
                *cb = None;
            }
        }
    }
}

impl WheelInner {
    fn insert(&self, shared: Arc<TimerShared>) {
        let at_front = {
            let mut timers = self.timers.write().expect("timer wheel lock");
            let key = (shared.deadline.load(Ordering::Acquire), shared.id);
            timers.insert(key, shared);
            timers.keys().next() == Some(&key) && !self.ticked.swap(true, Ordering::AcqRel)
        };
        if at_front {
            (self.notify)();
        }
    }

    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.previous_now.swap(now, Ordering::AcqRel);
        now < previous && now < previous.saturating_sub(ROLLOVER_WINDOW_MS)
    }
}

impl Timer {
    /// Removes the timer from its wheel without firing. Returns false if it
    /// already expired, was cancelled, or the wheel is gone.
    pub fn cancel(&self) -> bool {
        let Some(wheel) = self.wheel.upgrade() else { return false };
        let mut timers = wheel.timers.write().expect("timer wheel lock");
        let mut cb = self.shared.callback.lock().expect("timer callback lock");
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&(self.shared.deadline.load(Ordering::Acquire), self.shared.id));
        true
    }

    /// Re-baselines the deadline to `now + period` without changing the
    /// period.
    pub fn refresh(&self) -> bool {
        let Some(wheel) = self.wheel.upgrade() else { return false };
        let mut timers = wheel.timers.write().expect("timer wheel lock");
        if self.shared.callback.lock().expect("timer callback lock").is_none() {
            return false;
        }
        let old_key = (self.shared.deadline.load(Ordering::Acquire), self.shared.id);
        if timers.remove(&old_key).is_none() {
            return false;
        }
        let deadline =
            elapsed_ms().saturating_add(self.shared.period_ms.load(Ordering::Acquire));
        self.shared.deadline.store(deadline, Ordering::Release);
        timers.insert((deadline, self.shared.id), self.shared.clone());
        true
    }

    /// Changes the period; `from_now` re-baselines the deadline to
    /// `now + period`, otherwise the original start point is kept.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.shared.period_ms.load(Ordering::Acquire) && !from_now {
            return true;
        }
        let Some(wheel) = self.wheel.upgrade() else { return false };
        let removed = {
            let mut timers = wheel.timers.write().expect("timer wheel lock");
            if self.shared.callback.lock().expect("timer callback lock").is_none() {
                return false;
            }
            let old_key = (self.shared.deadline.load(Ordering::Acquire), self.shared.id);
            timers.remove(&old_key).is_some()
        };
        if !removed {
            return false;
        }
        let old_period = self.shared.period_ms.swap(period_ms, Ordering::AcqRel);
        let start = if from_now {
            elapsed_ms()
        } else {
            self.shared.deadline.load(Ordering::Acquire).saturating_sub(old_period)
        };
        self.shared.deadline.store(start.saturating_add(period_ms), Ordering::Release);
        wheel.insert(self.shared.clone());
        true
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn wheel() -> TimerWheel { TimerWheel::new(|| {}) }

    #[test]
    fn deadlines_drain_in_order() {
        let wheel = wheel();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(2u64, "b"), (1, "a"), (3, "c")] {
            let order = order.clone();
            wheel.add_timer(delay, move || order.lock().unwrap().push(tag), false);
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut cbs = Vec::new();
        wheel.drain_expired(&mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(wheel.next_deadline_ms(), NO_DEADLINE);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let wheel = wheel();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = wheel.add_timer(1, move || { f.fetch_add(1, Ordering::SeqCst); }, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut cbs = Vec::new();
        wheel.drain_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_rearms() {
        let wheel = wheel();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        wheel.add_timer(1, move || { f.fetch_add(1, Ordering::SeqCst); }, true);
        for _ in 0..2 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            let mut cbs = Vec::new();
            wheel.drain_expired(&mut cbs);
            for cb in cbs {
                cb();
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(wheel.has_timers());
    }

    #[test]
    fn condition_timer_requires_live_witness() {
        let wheel = wheel();
        let fired = Arc::new(AtomicUsize::new(0));
        let witness = Arc::new(());
        let f = fired.clone();
        wheel.add_condition_timer(
            1,
            move || { f.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&witness),
            false,
        );
        drop(witness);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut cbs = Vec::new();
        wheel.drain_expired(&mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn front_insert_notifies() {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let wheel = TimerWheel::new(move || { n.fetch_add(1, Ordering::SeqCst); });
        wheel.add_timer(1000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        // A later deadline does not land at the front.
        wheel.add_timer(5000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        // Reading the next deadline re-arms the notification.
        wheel.next_deadline_ms();
        wheel.add_timer(1, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
