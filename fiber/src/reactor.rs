//! Readiness-driven I/O reactor.
//!
//! The reactor fuses an epoll instance, the timer wheel and the scheduler:
//! worker idle fibers block in `epoll_wait` for at most the time until the
//! next timer deadline, then schedule expired timer callbacks and fire
//! descriptor events. Events are registered edge-triggered and are one-shot
//! at the descriptor-context level: firing clears the event's bit and hands
//! its fiber or callback back to the scheduler.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::fiber::{Fiber, State};
use crate::scheduler::{Scheduler, SchedulerHooks};
use crate::timer::{Timer, TimerWheel};

/// Cap on a single poll so a far-away timer cannot pin a worker in the
/// kernel for long.
const MAX_POLL_MS: u64 = 5000;
/// Events handled per poll pass; the rest surface on the next pass.
const MAX_EVENTS: usize = 256;

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

/// Readiness event selector.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(lowercase)]
#[repr(u32)]
pub enum Event {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
}

impl Event {
    fn bit(self) -> u32 { self as u32 }
}

enum EventHandler {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct EventCtx {
    sched: Option<Arc<Scheduler>>,
    handler: Option<EventHandler>,
}

impl EventCtx {
    fn is_empty(&self) -> bool { self.sched.is_none() && self.handler.is_none() }

    fn reset(&mut self) {
        self.sched = None;
        self.handler = None;
    }
}

#[derive(Default)]
struct FdInner {
    events: u32,
    read: EventCtx,
    write: EventCtx,
}

impl FdInner {
    fn ctx_mut(&mut self, event: Event) -> &mut EventCtx {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Consumes the event: clears its bit and hands the stored fiber or
    /// callback to its recorded scheduler.
    fn trigger(&mut self, event: Event) {
        debug_assert!(self.events & event.bit() != 0, "triggering unregistered event");
        self.events &= !event.bit();
        let ctx = self.ctx_mut(event);
        let sched = ctx.sched.take().expect("event context has a scheduler");
        match ctx.handler.take().expect("event context has a handler") {
            EventHandler::Fiber(fiber) => sched.schedule_fiber(fiber),
            EventHandler::Call(call) => sched.schedule(call),
        }
        ctx.reset();
    }
}

struct FdContext {
    inner: Mutex<FdInner>,
}

/// Scheduler + timer wheel + epoll event loop.
pub struct Reactor {
    weak_self: Weak<Reactor>,
    sched: Arc<Scheduler>,
    wheel: TimerWheel,
    epoll_fd: RawFd,
    tick_fds: [RawFd; 2],
    pending: AtomicUsize,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl Reactor {
    /// Creates the reactor and starts its scheduler threads.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<Arc<Reactor>> {
        let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let mut tick_fds = [0 as RawFd; 2];
        if let Err(err) =
            cvt(unsafe { libc::pipe2(tick_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })
        {
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let sched = Scheduler::new(threads, use_caller, name);
        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let wake = weak.clone();
            Reactor {
                weak_self: weak.clone(),
                sched,
                wheel: TimerWheel::new(move || {
                    if let Some(reactor) = wake.upgrade() {
                        reactor.tickle()
                    }
                }),
                epoll_fd,
                tick_fds,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(Vec::new()),
            }
        });

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tick_fds[0] as u64,
        };
        cvt(unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tick_fds[0], &mut ev) })?;

        reactor.sched.bind_hooks(reactor.weak_self.clone() as Weak<dyn SchedulerHooks>);
        reactor.sched.start();
        Ok(reactor)
    }

    /// The reactor driving the current thread; a programming error outside
    /// of reactor threads.
    pub fn current() -> Arc<Reactor> {
        Self::try_current().expect("not running on a reactor thread")
    }

    pub fn try_current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|r| r.borrow().clone())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> { &self.sched }

    /// Enqueues a closure on the underlying scheduler.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) { self.sched.schedule(f) }

    /// Enqueues a fiber on the underlying scheduler.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) { self.sched.schedule_fiber(fiber) }

    /// See [`TimerWheel::add_timer`].
    pub fn add_timer(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.wheel.add_timer(delay_ms, callback, recurring)
    }

    /// See [`TimerWheel::add_condition_timer`].
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.wheel.add_condition_timer(delay_ms, callback, witness, recurring)
    }

    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        let index = fd as usize;
        {
            let contexts = self.contexts.read().expect("reactor lock");
            if let Some(Some(ctx)) = contexts.get(index) {
                return ctx.clone();
            }
        }
        let mut contexts = self.contexts.write().expect("reactor lock");
        if contexts.len() <= index {
            let grown = (index + index / 2).max(32);
            contexts.resize_with(grown, || None);
        }
        contexts[index]
            .get_or_insert_with(|| Arc::new(FdContext { inner: Mutex::new(FdInner::default()) }))
            .clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.contexts.read().expect("reactor lock").get(fd as usize).cloned().flatten()
    }

    fn epoll_update(&self, fd: RawFd, op: libc::c_int, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        if let Err(err) = cvt(unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) }) {
            log::error!(
                target: "fiber::reactor",
                "epoll_ctl(op={op}, fd={fd}, events={events:#x}) failed: {err}"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Registers the current fiber as the handler of `(fd, event)`; it will
    /// be rescheduled once the event fires. Re-adding a registered event is
    /// a programming error.
    pub fn add_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Registers a callback as the handler of `(fd, event)`.
    pub fn add_event_callback(
        &self,
        fd: RawFd,
        event: Event,
        callback: impl FnOnce() + Send + 'static,
    ) -> io::Result<()> {
        self.add_event_inner(fd, event, Some(Box::new(callback)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> io::Result<()> {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().expect("fd context lock");
        assert!(
            inner.events & event.bit() == 0,
            "event {event} already registered for fd {fd}"
        );
        let op = if inner.events != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        self.epoll_update(fd, op, libc::EPOLLET as u32 | inner.events | event.bit())?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        inner.events |= event.bit();
        let event_ctx = inner.ctx_mut(event);
        debug_assert!(event_ctx.is_empty(), "stale event context");
        event_ctx.sched = Some(Scheduler::current().expect("add_event outside scheduler thread"));
        event_ctx.handler = Some(match callback {
            Some(call) => EventHandler::Call(call),
            None => {
                let fiber = Fiber::current();
                debug_assert!(fiber.state() == State::Running);
                EventHandler::Fiber(fiber)
            }
        });
        Ok(())
    }

    /// Removes `(fd, event)` without firing it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().expect("fd context lock");
        if inner.events & event.bit() == 0 {
            return false;
        }
        let left = inner.events & !event.bit();
        let op = if left != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
        if self.epoll_update(fd, op, libc::EPOLLET as u32 | left).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        inner.events = left;
        inner.ctx_mut(event).reset();
        true
    }

    /// Removes `(fd, event)` and fires it once; used to abort pending I/O.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().expect("fd context lock");
        if inner.events & event.bit() == 0 {
            return false;
        }
        let left = inner.events & !event.bit();
        let op = if left != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
        if self.epoll_update(fd, op, libc::EPOLLET as u32 | left).is_err() {
            return false;
        }
        inner.trigger(event);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Fires every registered event of `fd` once and deregisters it.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().expect("fd context lock");
        if inner.events == 0 {
            return false;
        }
        if self.epoll_update(fd, libc::EPOLL_CTL_DEL, 0).is_err() {
            return false;
        }
        if inner.events & Event::Read.bit() != 0 {
            inner.trigger(Event::Read);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if inner.events & Event::Write.bit() != 0 {
            inner.trigger(Event::Write);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        debug_assert!(inner.events == 0);
        true
    }

    /// Stops the scheduler once timers and pending events have drained.
    pub fn stop(&self) { self.sched.stop() }

    fn poll_pass(&self, events: &mut [libc::epoll_event]) {
        let next_deadline = self.wheel.next_deadline_ms();
        let timeout = next_deadline.min(MAX_POLL_MS);
        let count = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout as libc::c_int,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!(target: "fiber::reactor", "epoll_wait failed: {err}");
                break 0;
            }
            break ret as usize;
        };

        let mut expired = Vec::new();
        self.wheel.drain_expired(&mut expired);
        for callback in expired {
            self.sched.schedule(move || callback());
        }

        for ev in &events[..count] {
            let fd = ev.u64 as RawFd;
            if fd == self.tick_fds[0] {
                let mut buf = [0u8; 256];
                while unsafe {
                    libc::read(self.tick_fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                } > 0
                {}
                continue;
            }

            let Some(ctx) = self.lookup(fd) else { continue };
            let mut inner = ctx.inner.lock().expect("fd context lock");
            let mut bits = ev.events;
            // An error or hangup must wake both directions, otherwise a
            // registered event may never fire.
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events;
            }
            let real = bits & (Event::Read.bit() | Event::Write.bit()) & inner.events;
            if real == 0 {
                continue;
            }

            let left = inner.events & !real;
            let op = if left != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
            if self.epoll_update(fd, op, libc::EPOLLET as u32 | left).is_err() {
                continue;
            }
            if real & Event::Read.bit() != 0 {
                inner.trigger(Event::Read);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
            if real & Event::Write.bit() != 0 {
                inner.trigger(Event::Write);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl SchedulerHooks for Reactor {
    fn tickle(&self) {
        if !self.sched.has_idle() {
            return;
        }
        let ret = unsafe { libc::write(self.tick_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert!(ret == 1 || io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock);
    }

    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if self.sched.stopping() {
                log::debug!(target: "fiber::reactor", "reactor {} idle exiting", self.sched.name());
                break;
            }
            self.poll_pass(&mut events);
            Fiber::yield_now();
        }
    }

    fn worker_started(&self) {
        CURRENT_REACTOR.with(|r| *r.borrow_mut() = self.weak_self.upgrade());
    }

    fn drained(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && !self.wheel.has_timers()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tick_fds[0]);
            libc::close(self.tick_fds[1]);
        }
    }
}
