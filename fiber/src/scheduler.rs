//! M:N fiber scheduler.
//!
//! A pool of worker threads pulls scheduling tasks — fibers or closures —
//! from a shared FIFO list. Tasks may be pinned to one worker; unpinned
//! tasks run wherever a worker is free. Each worker owns a *scheduling
//! fiber* (its thread main fiber, or the caller's root fiber when the
//! scheduler reserves the calling thread) which is the yield partner of
//! every scheduler-participating fiber it resumes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use crate::fiber::{Fiber, State};

/// Task affinity meaning "any worker".
pub const ANY_WORKER: isize = -1;

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Scheduling fiber of the current worker thread, if any.
pub(crate) fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|f| f.borrow().clone())
}

enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct Task {
    payload: TaskPayload,
    worker: isize,
}

/// Integration points the reactor plugs into the scheduler, replacing the
/// default busy idle loop with a blocking poll.
pub trait SchedulerHooks: Send + Sync {
    /// Wakes one worker blocked in its idle routine.
    fn tickle(&self);

    /// Body of the per-worker idle fiber. Must return only when the
    /// scheduler may shut down.
    fn idle(&self);

    /// Runs on every scheduler thread right before its dispatch loop.
    fn worker_started(&self) {}

    /// Extra condition fused into [`Scheduler::stopping`]: the hook owner
    /// has no outstanding work of its own.
    fn drained(&self) -> bool { true }
}

/// M:N worker pool over a shared task queue.
pub struct Scheduler {
    name: String,
    worker_count: usize,
    use_caller: bool,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

impl Scheduler {
    /// Creates a scheduler with `threads >= 1` scheduling threads. With
    /// `use_caller` the calling thread is reserved as one of them: a root
    /// scheduling fiber is created on it, entered later by [`Self::stop`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let sched = Arc::new(Scheduler {
            name: name.to_owned(),
            worker_count: threads - use_caller as usize,
            use_caller,
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            hooks: RwLock::new(None),
        });
        if use_caller {
            Fiber::current();
            let caller_worker = sched.worker_count as isize;
            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.dispatch(caller_worker)
                    }
                },
                0,
                false,
            )
            .expect("root scheduling fiber");
            CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(sched.clone()));
            SCHED_FIBER.with(|f| *f.borrow_mut() = Some(root.clone()));
            *sched.root_fiber.lock().expect("scheduler lock") = Some(root);
        }
        sched
    }

    pub fn name(&self) -> &str { &self.name }

    /// Number of spawned worker threads (excluding a participating caller).
    pub fn worker_count(&self) -> usize { self.worker_count }

    /// The scheduler driving the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> { CURRENT_SCHED.with(|s| s.borrow().clone()) }

    /// Attaches hooks; must happen before [`Self::start`].
    pub fn bind_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write().expect("scheduler lock") = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().expect("scheduler lock").as_ref().and_then(Weak::upgrade)
    }

    /// Spins up the worker threads.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.stopping.load(Ordering::Acquire) {
            log::error!(target: "fiber", "scheduler {} started after stop", self.name);
            return;
        }
        log::debug!(target: "fiber", "scheduler {} starting {} workers", self.name, self.worker_count);
        let mut threads = self.threads.lock().expect("scheduler lock");
        for worker in 0..self.worker_count {
            let sched = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, worker))
                .spawn(move || sched.dispatch(worker as isize))
                .expect("spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Enqueues a closure for any worker.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.push(TaskPayload::Call(Box::new(f)), ANY_WORKER);
    }

    /// Enqueues a closure pinned to one worker.
    pub fn schedule_on(&self, worker: isize, f: impl FnOnce() + Send + 'static) {
        self.push(TaskPayload::Call(Box::new(f)), worker);
    }

    /// Enqueues a fiber for any worker. At most one in-flight task may
    /// reference a given fiber.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.push(TaskPayload::Fiber(fiber), ANY_WORKER);
    }

    /// Enqueues a fiber pinned to one worker.
    pub fn schedule_fiber_on(&self, worker: isize, fiber: Arc<Fiber>) {
        self.push(TaskPayload::Fiber(fiber), worker);
    }

    fn push(&self, payload: TaskPayload, worker: isize) {
        let was_empty = {
            let mut tasks = self.tasks.lock().expect("scheduler lock");
            let was_empty = tasks.is_empty();
            tasks.push_back(Task { payload, worker });
            was_empty
        };
        if was_empty && worker == ANY_WORKER {
            self.tickle();
        }
    }

    fn tickle(&self) {
        match self.hooks() {
            Some(hooks) => hooks.tickle(),
            None => log::trace!(target: "fiber", "scheduler {} tickle", self.name),
        }
    }

    pub(crate) fn has_idle(&self) -> bool { self.idle.load(Ordering::Acquire) > 0 }

    /// True once [`Self::stop`] was requested and all work has drained.
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self.tasks.lock().expect("scheduler lock").is_empty()
            && self.hooks().map_or(true, |hooks| hooks.drained())
    }

    /// Requests shutdown, drains the queue and joins the workers. With
    /// `use_caller` the calling thread re-enters its root scheduling fiber
    /// to finish pinned tasks before the join.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) && self.threads.lock().expect("scheduler lock").is_empty() {
            return;
        }
        log::debug!(target: "fiber", "scheduler {} stopping", self.name);
        for _ in 0..self.worker_count {
            self.tickle();
        }
        let root = self.root_fiber.lock().expect("scheduler lock").take();
        if let Some(root) = root {
            self.tickle();
            root.resume();
            log::debug!(target: "fiber", "scheduler {} root fiber finished", self.name);
        }
        let threads = std::mem::take(&mut *self.threads.lock().expect("scheduler lock"));
        for handle in threads {
            handle.join().expect("scheduler worker panicked");
        }
    }

    /// The dispatch loop; runs on every worker thread, and inside the root
    /// fiber of a participating caller.
    fn dispatch(self: &Arc<Self>, worker: isize) {
        log::debug!(target: "fiber", "scheduler {} worker {} dispatching", self.name, worker);
        CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(self.clone()));
        if worker < self.worker_count as isize {
            // Spawned workers schedule out of their thread main fiber; the
            // caller's scheduling fiber was set up in `new`.
            SCHED_FIBER.with(|f| *f.borrow_mut() = Some(Fiber::current()));
        }
        if let Some(hooks) = self.hooks() {
            hooks.worker_started();
        }

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || sched.idle_task(), 0, true).expect("idle fiber")
        };
        let mut callback_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let task = {
                let mut tasks = self.tasks.lock().expect("scheduler lock");
                let mut picked = None;
                let mut index = 0;
                while index < tasks.len() {
                    let task = &tasks[index];
                    if task.worker != ANY_WORKER && task.worker != worker {
                        // Pinned to another worker; it must pick it up.
                        tickle_me = true;
                        index += 1;
                        continue;
                    }
                    if let TaskPayload::Fiber(fiber) = &task.payload {
                        // Transient race with the I/O add-then-suspend path:
                        // the completion re-enqueued a fiber which has not
                        // reached its yield yet.
                        if fiber.state() == State::Running {
                            index += 1;
                            continue;
                        }
                    }
                    picked = tasks.remove(index);
                    break;
                }
                if picked.is_some() {
                    self.active.fetch_add(1, Ordering::AcqRel);
                    tickle_me |= !tasks.is_empty();
                }
                picked
            };
            if tickle_me {
                self.tickle();
            }

            match task.map(|task| task.payload) {
                Some(TaskPayload::Fiber(fiber)) => {
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                Some(TaskPayload::Call(call)) => {
                    let fiber = match callback_fiber.take() {
                        Some(fiber) => {
                            fiber.reset(move || call());
                            fiber
                        }
                        None => Fiber::new(move || call(), 0, true).expect("callback fiber"),
                    };
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    // Reusable only once the closure ran to completion; a
                    // parked callback fiber is owned by whoever parked it.
                    if fiber.state() == State::Term {
                        callback_fiber = Some(fiber);
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!(target: "fiber", "scheduler {} worker {} idle fiber terminated", self.name, worker);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        log::debug!(target: "fiber", "scheduler {} worker {} exiting", self.name, worker);
    }

    fn idle_task(&self) {
        match self.hooks() {
            Some(hooks) => hooks.idle(),
            None => {
                while !self.stopping() {
                    Fiber::yield_now();
                }
            }
        }
    }
}
