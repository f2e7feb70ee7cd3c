//! Stackful coroutine runtime.
//!
//! The crate stacks four layers, each usable on its own:
//!
//! - [`Fiber`]: stackful coroutines with save/restore of machine context;
//! - [`Scheduler`]: an M:N worker pool pulling fibers and closures from a
//!   shared queue, with optional per-task thread affinity;
//! - [`Reactor`]: an epoll-driven event loop fusing the scheduler with a
//!   [`TimerWheel`], plus the [`net`] module whose blocking-style TCP calls
//!   suspend fibers instead of threads;
//! - [`sync`]: fiber-aware mutex, condition variable, semaphore, countdown
//!   latch and bounded channel.

#[macro_use]
extern crate amplify;

pub mod config;
mod context;
mod fiber;
pub mod net;
mod reactor;
mod scheduler;
mod stack;
pub mod sync;
mod timer;

pub use fiber::{Fiber, FiberError, State};
pub use reactor::{Event, Reactor};
pub use scheduler::{Scheduler, SchedulerHooks, ANY_WORKER};
pub use stack::StackError;
pub use timer::{elapsed_ms, Timer, TimerWheel, NO_DEADLINE};
