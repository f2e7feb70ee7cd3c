//! Stackful cooperative fibers.
//!
//! Every thread that touches fibers owns a *main fiber* — a stackless record
//! of the thread's native execution context, created lazily on first use.
//! Worker fibers own a mapped stack and an entry closure; [`Fiber::resume`]
//! switches into them and [`Fiber::yield_now`] switches back to whichever
//! context is their yield partner: the per-worker scheduling fiber for fibers
//! participating in a scheduler, the thread's main fiber otherwise.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};

use crate::config::{self, ConfigVar};
use crate::context::{self, MachineContext};
use crate::scheduler;
use crate::stack::{Stack, StackError};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: LazyLock<Arc<ConfigVar<u32>>> =
    LazyLock::new(|| config::lookup("fiber.stack_size", 128 * 1024, "fiber stack size (bytes)"));

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Execution state of a fiber.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(lowercase)]
#[repr(u8)]
pub enum State {
    /// Runnable: freshly created, reset, or yielded mid-execution.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// The entry closure has returned; only [`Fiber::reset`] revives it.
    Term = 2,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Term,
        }
    }
}

/// Errors of fiber construction.
#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum FiberError {
    #[from]
    Stack(StackError),
}

/// A stackful cooperative coroutine.
///
/// Handles are shared as `Arc<Fiber>`; the scheduler guarantees that at most
/// one thread resumes a given fiber at a time, which is what makes the
/// interior mutability below sound.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    run_in_scheduler: bool,
    stack: Option<Stack>,
    ctx: UnsafeCell<MachineContext>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
}

// A READY fiber may migrate between worker threads; its context and entry
// cells are only touched by the single thread currently resuming it.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a READY fiber running `entry` on a fresh stack.
    ///
    /// A `stack_size` of zero selects the `fiber.stack_size` configured
    /// default. `run_in_scheduler` selects the yield partner: the current
    /// worker's scheduling fiber when set, the thread main fiber otherwise.
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Result<Arc<Fiber>, FiberError> {
        let size = if stack_size == 0 { STACK_SIZE.get() as usize } else { stack_size };
        let stack = Stack::alloc(size)?;
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(State::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(MachineContext::new()),
            entry: UnsafeCell::new(Some(Box::new(entry))),
        });
        unsafe {
            context::init(
                fiber.ctx.get(),
                fiber.stack.as_ref().expect("worker fiber owns a stack").top(),
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "fiber", "created fiber {}", fiber.id);
        Ok(fiber)
    }

    fn new_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(State::Running as u8),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(MachineContext::new()),
            entry: UnsafeCell::new(None),
        })
    }

    /// The fiber currently executing on this thread. Bootstraps the thread
    /// main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
            return cur;
        }
        let main = Fiber::new_main();
        MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// Id of the currently running fiber, or 0 when the thread has not
    /// entered fiber context yet.
    pub fn current_id() -> u64 { CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id)) }

    /// Number of live fibers in the process.
    pub fn count() -> u64 { FIBER_COUNT.load(Ordering::Relaxed) }

    pub fn id(&self) -> u64 { self.id }

    pub fn state(&self) -> State { State::from_u8(self.state.load(Ordering::Acquire)) }

    fn main_fiber() -> Arc<Fiber> {
        Fiber::current();
        MAIN.with(|m| m.borrow().clone()).expect("thread main fiber exists after bootstrap")
    }

    /// Switches execution to this fiber. The caller must be the thread main
    /// fiber or the worker's scheduling fiber; resuming a RUNNING or TERM
    /// fiber is a programming error.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(state == State::Ready, "resume on a {state} fiber");
        let partner = if self.run_in_scheduler {
            scheduler::scheduling_fiber().expect("no scheduling fiber on this thread")
        } else {
            Fiber::main_fiber()
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        self.state.store(State::Running as u8, Ordering::Release);
        unsafe { context::switch(partner.ctx.get(), self.ctx.get()) };
    }

    /// Suspends the currently running fiber, switching back to its yield
    /// partner. The fiber stays READY and may be resumed again, unless its
    /// entry closure has already returned (TERM).
    pub fn yield_now() {
        let cur = CURRENT.with(|c| c.borrow().clone()).expect("yield outside of fiber context");
        cur.do_yield();
    }

    fn do_yield(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield on a {state} fiber"
        );
        if state != State::Term {
            self.state.store(State::Ready as u8, Ordering::Release);
        }
        let partner = if self.run_in_scheduler {
            scheduler::scheduling_fiber().expect("no scheduling fiber on this thread")
        } else {
            Fiber::main_fiber()
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(partner.clone()));
        unsafe { context::switch(self.ctx.get(), partner.ctx.get()) };
    }

    /// Rebinds a TERM fiber to a new entry closure, reusing its stack, and
    /// returns it to READY. Only fibers owning a stack may be reset.
    pub fn reset(self: &Arc<Self>, entry: impl FnOnce() + Send + 'static) {
        assert!(self.stack.is_some(), "reset on a stackless fiber");
        assert!(self.state() == State::Term, "reset on a {} fiber", self.state());
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            context::init(
                self.ctx.get(),
                self.stack.as_ref().expect("worker fiber owns a stack").top(),
                fiber_main as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.state.store(State::Ready as u8, Ordering::Release);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            // A worker fiber dropped mid-execution would leave a dangling
            // stack frame behind.
            assert!(
                self.state() != State::Running,
                "worker fiber {} dropped while running",
                self.id
            );
        }
        log::trace!(target: "fiber", "dropped fiber {}", self.id);
    }
}

/// Entry of every worker fiber: runs the closure, releases it, transitions to
/// TERM and yields for the last time. Never returns.
extern "C" fn fiber_main(fiber: usize) {
    let fiber = unsafe { &*(fiber as *const Fiber) };
    let entry = unsafe { (*fiber.entry.get()).take() }.expect("fiber resumed without an entry");
    entry();
    fiber.state.store(State::Term as u8, Ordering::Release);
    fiber.do_yield();
    unreachable!("terminated fiber {} was resumed", fiber.id);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle() {
        let trace = Arc::new(std::sync::Mutex::new(Vec::new()));
        let t = trace.clone();
        let fiber = Fiber::new(
            move || {
                t.lock().unwrap().push("enter");
                Fiber::yield_now();
                t.lock().unwrap().push("again");
            },
            16 * 1024,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);
        trace.lock().unwrap().push("yielded");
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*trace.lock().unwrap(), vec!["enter", "yielded", "again"]);
    }

    #[test]
    fn reset_reuses_stack() {
        let fiber = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = flag.clone();
        fiber.reset(move || f.store(true, Ordering::SeqCst));
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn ids_are_unique() {
        let a = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        let b = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        assert_ne!(a.id(), b.id());
        a.resume();
        b.resume();
    }
}
