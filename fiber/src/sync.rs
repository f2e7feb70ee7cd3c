//! Fiber-aware synchronization primitives.
//!
//! Contention never blocks a kernel thread: a contended fiber parks itself
//! on a waiter queue and yields; releasing the primitive hands one (or all)
//! parked fibers back to the scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::fiber::Fiber;
use crate::reactor::Reactor;
use crate::scheduler::Scheduler;
use crate::timer::Timer;

fn wake(fiber: Arc<Fiber>) {
    Scheduler::current().expect("fiber primitive used outside a scheduler").schedule_fiber(fiber);
}

/// A fiber-aware mutual exclusion lock, reentrant by fiber id.
///
/// The lock carries no data: it is a token guarding state the owner keeps
/// elsewhere. A reentrant acquisition returns a guard which does not release
/// the lock on drop.
pub struct Mutex {
    locked: AtomicBool,
    holder: AtomicU64,
    waiters: StdMutex<VecDeque<Arc<Fiber>>>,
}

impl Default for Mutex {
    fn default() -> Self { Self::new() }
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            locked: AtomicBool::new(false),
            holder: AtomicU64::new(0),
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    /// Acquires the lock, parking the current fiber while contended.
    pub fn lock(&self) -> MutexGuard<'_> {
        let id = Fiber::current_id();
        if id != 0 && self.holder.load(Ordering::Acquire) == id {
            return MutexGuard { mutex: self, owns: false };
        }
        'acquire: loop {
            if self.try_acquire() {
                break;
            }
            {
                let mut waiters = self.waiters.lock().expect("mutex waiter lock");
                // Parking is expensive; retry under the waiter lock so an
                // unlock cannot slip between the check and the park.
                if self.try_acquire() {
                    break 'acquire;
                }
                waiters.push_back(Fiber::current());
            }
            Fiber::yield_now();
        }
        self.holder.store(id, Ordering::Release);
        MutexGuard { mutex: self, owns: true }
    }

    /// Acquires the lock without parking; `None` when contended.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        if self.try_acquire() {
            self.holder.store(Fiber::current_id(), Ordering::Release);
            Some(MutexGuard { mutex: self, owns: true })
        } else {
            None
        }
    }

    fn unlock(&self) {
        self.holder.store(0, Ordering::Release);
        let waiter = self.waiters.lock().expect("mutex waiter lock").pop_front();
        self.locked.store(false, Ordering::Release);
        if let Some(fiber) = waiter {
            wake(fiber);
        }
    }
}

/// Lock token returned by [`Mutex::lock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    owns: bool,
}

impl<'a> MutexGuard<'a> {
    pub(crate) fn mutex(&self) -> &'a Mutex { self.mutex }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if self.owns {
            self.mutex.unlock();
        }
    }
}

/// A fiber-aware condition variable.
///
/// While the waiter queue is non-empty the condvar holds a no-op keep-alive
/// timer on the current reactor, so the reactor cannot declare itself
/// drained with fibers still parked here.
pub struct Condvar {
    waiters: StdMutex<VecDeque<Arc<Fiber>>>,
    keepalive: StdMutex<Option<Timer>>,
}

impl Default for Condvar {
    fn default() -> Self { Self::new() }
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar { waiters: StdMutex::new(VecDeque::new()), keepalive: StdMutex::new(None) }
    }

    fn park(&self, guard: Option<MutexGuard<'_>>) {
        {
            let mut waiters = self.waiters.lock().expect("condvar waiter lock");
            waiters.push_back(Fiber::current());
            let mut keepalive = self.keepalive.lock().expect("condvar keepalive lock");
            if keepalive.is_none() {
                if let Some(reactor) = Reactor::try_current() {
                    *keepalive = Some(reactor.add_timer(u64::MAX, || {}, true));
                }
            }
            // The mutex must be released under the waiter lock, so a
            // notifier cannot miss this fiber.
            drop(guard);
        }
        Fiber::yield_now();
    }

    /// Parks the current fiber until notified.
    pub fn wait(&self) { self.park(None) }

    /// Releases `guard`, parks until notified, then re-acquires the mutex.
    pub fn wait_with<'a>(&self, guard: MutexGuard<'a>) -> MutexGuard<'a> {
        let mutex = guard.mutex();
        self.park(Some(guard));
        mutex.lock()
    }

    /// Wakes one parked fiber.
    pub fn notify_one(&self) {
        let fiber = {
            let mut waiters = self.waiters.lock().expect("condvar waiter lock");
            let fiber = waiters.pop_front();
            if waiters.is_empty() {
                self.drop_keepalive();
            }
            fiber
        };
        if let Some(fiber) = fiber {
            wake(fiber);
        }
    }

    /// Wakes every parked fiber.
    pub fn notify_all(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().expect("condvar waiter lock");
            let drained = waiters.drain(..).collect();
            self.drop_keepalive();
            drained
        };
        for fiber in drained {
            wake(fiber);
        }
    }

    fn drop_keepalive(&self) {
        if let Some(timer) = self.keepalive.lock().expect("condvar keepalive lock").take() {
            timer.cancel();
        }
    }
}

/// A fiber-aware counting semaphore.
pub struct Semaphore {
    permits: u32,
    used: AtomicU32,
    mutex: Mutex,
    cond: Condvar,
}

impl Semaphore {
    pub const fn new(permits: u32) -> Semaphore {
        Semaphore { permits, used: AtomicU32::new(0), mutex: Mutex::new(), cond: Condvar::new() }
    }

    /// Takes one permit, parking while none is available.
    pub fn acquire(&self) {
        let mut guard = self.mutex.lock();
        while self.used.load(Ordering::Acquire) >= self.permits {
            guard = self.cond.wait_with(guard);
        }
        self.used.fetch_add(1, Ordering::AcqRel);
        drop(guard);
    }

    /// Returns one permit and wakes a parked acquirer.
    pub fn release(&self) {
        let guard = self.mutex.lock();
        if self.used.load(Ordering::Acquire) > 0 {
            self.used.fetch_sub(1, Ordering::AcqRel);
        }
        self.cond.notify_one();
        drop(guard);
    }
}

/// A fiber-aware countdown latch.
pub struct CountdownLatch {
    count: AtomicU32,
    mutex: Mutex,
    cond: Condvar,
}

impl CountdownLatch {
    pub const fn new(count: u32) -> CountdownLatch {
        CountdownLatch { count: AtomicU32::new(count), mutex: Mutex::new(), cond: Condvar::new() }
    }

    /// Parks the current fiber until the count reaches zero.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while self.count.load(Ordering::Acquire) > 0 {
            guard = self.cond.wait_with(guard);
        }
        drop(guard);
    }

    /// Decrements the count, broadcasting once it reaches zero. Returns
    /// false when the count was already zero.
    pub fn count_down(&self) -> bool {
        let guard = self.mutex.lock();
        if self.count.load(Ordering::Acquire) == 0 {
            return false;
        }
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cond.notify_all();
        }
        drop(guard);
        true
    }

    pub fn count(&self) -> u32 { self.count.load(Ordering::Acquire) }
}

struct ChannelState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct ChannelInner<T> {
    capacity: usize,
    mutex: Mutex,
    push_cond: Condvar,
    pop_cond: Condvar,
    state: std::cell::UnsafeCell<ChannelState<T>>,
}

// `state` is only accessed while `mutex` is held.
unsafe impl<T: Send> Send for ChannelInner<T> {}
unsafe impl<T: Send> Sync for ChannelInner<T> {}

/// A bounded MPMC channel between fibers. Handles are cheap clones sharing
/// one buffer; `send` parks while full, `recv` parks while empty, and
/// closing wakes every parked fiber.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self { Channel { inner: self.inner.clone() } }
}

impl<T: Send> Channel<T> {
    pub fn new(capacity: usize) -> Channel<T> {
        assert!(capacity >= 1, "channel capacity must be positive");
        Channel {
            inner: Arc::new(ChannelInner {
                capacity,
                mutex: Mutex::new(),
                push_cond: Condvar::new(),
                pop_cond: Condvar::new(),
                state: std::cell::UnsafeCell::new(ChannelState {
                    queue: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Delivers `value`, parking while the buffer is full. Returns false
    /// once the channel is closed (the value is dropped).
    pub fn send(&self, value: T) -> bool {
        let mut guard = self.inner.mutex.lock();
        let mut value = Some(value);
        loop {
            let state = unsafe { &mut *self.inner.state.get() };
            if state.closed {
                return false;
            }
            if state.queue.len() < self.inner.capacity {
                state.queue.push_back(value.take().expect("value not yet delivered"));
                break;
            }
            guard = self.inner.push_cond.wait_with(guard);
        }
        drop(guard);
        self.inner.pop_cond.notify_one();
        true
    }

    /// Takes the next value, parking while the buffer is empty. Returns
    /// `None` once the channel is closed.
    pub fn recv(&self) -> Option<T> {
        let mut guard = self.inner.mutex.lock();
        let value = loop {
            let state = unsafe { &mut *self.inner.state.get() };
            if state.closed {
                return None;
            }
            if let Some(value) = state.queue.pop_front() {
                break value;
            }
            guard = self.inner.pop_cond.wait_with(guard);
        };
        drop(guard);
        self.inner.push_cond.notify_one();
        Some(value)
    }

    /// Closes the channel: every parked sender and receiver wakes exactly
    /// once, buffered values are dropped, and subsequent operations fail
    /// immediately.
    pub fn close(&self) {
        {
            let _guard = self.inner.mutex.lock();
            let state = unsafe { &mut *self.inner.state.get() };
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
        }
        self.inner.push_cond.notify_all();
        self.inner.pop_cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        let _guard = self.inner.mutex.lock();
        unsafe { &*self.inner.state.get() }.closed
    }

    pub fn len(&self) -> usize {
        let _guard = self.inner.mutex.lock();
        unsafe { &*self.inner.state.get() }.queue.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn capacity(&self) -> usize { self.inner.capacity }
}
