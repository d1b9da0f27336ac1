//! Where code runs.
//!
//! A [`Scheduler`] hands out [`Worker`]s. A worker is a serial queue: tasks
//! scheduled on one worker never run concurrently and tasks with equal due
//! time run in submission order. Disposing a worker drops whatever is still
//! pending on it.
//!
//! Three families are provided:
//!
//! - [`ImmediateScheduler`] runs tasks on the calling thread,
//! - [`ThreadPoolScheduler`] runs them on dedicated threads, either the
//!   process-wide pools of [`Schedulers::single`] and
//!   [`Schedulers::parallel`] or owned pools,
//! - [`VirtualTimeScheduler`] runs them when a test advances its logical
//!   clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::config;

mod immediate;
mod queue;
mod thread;
mod virtual_time;

pub use self::immediate::ImmediateScheduler;
pub use self::thread::ThreadPoolScheduler;
pub use self::virtual_time::VirtualTimeScheduler;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
    static ref SINGLE: ThreadPoolScheduler = ThreadPoolScheduler::new("single", 1);
    static ref PARALLEL: ThreadPoolScheduler =
        ThreadPoolScheduler::new("parallel", config::global().parallelism);
}

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// A source of workers and the clock they run on.
pub trait Scheduler: Send + Sync + 'static {
    /// Create a new serial worker.
    fn create_worker(&self) -> Arc<dyn Worker>;

    /// Current time of this scheduler's clock, relative to an arbitrary
    /// fixed origin.
    fn now(&self) -> Duration;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn create_worker(&self) -> Arc<dyn Worker> {
        (**self).create_worker()
    }

    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// A serial execution queue.
pub trait Worker: Send + Sync {
    /// Run `task` once `delay` has elapsed on the scheduler's clock.
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle;

    /// Drop all pending tasks and refuse new ones.
    fn dispose(&self);

    /// Whether `dispose` was called.
    fn is_disposed(&self) -> bool;
}

/// Cancellation handle of a scheduled task.
#[derive(Clone, Debug, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// A handle for a freshly queued task, for use by custom workers.
    pub fn new() -> TaskHandle {
        TaskHandle::default()
    }

    /// A handle for a task that was never queued.
    pub(crate) fn rejected() -> TaskHandle {
        let handle = TaskHandle::new();
        handle.cancel();
        handle
    }

    /// Prevent the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Factory functions for the stock schedulers.
pub struct Schedulers;

impl Schedulers {
    /// Runs every task on the thread that schedules it.
    pub fn immediate() -> ImmediateScheduler {
        ImmediateScheduler
    }

    /// The process-wide single-threaded scheduler.
    pub fn single() -> ThreadPoolScheduler {
        SINGLE.clone()
    }

    /// The process-wide pool sized by `Config::parallelism`.
    pub fn parallel() -> ThreadPoolScheduler {
        PARALLEL.clone()
    }

    /// A fresh single-threaded scheduler. Its thread stops once the
    /// scheduler and all its workers are dropped.
    pub fn new_single(name: &str) -> ThreadPoolScheduler {
        ThreadPoolScheduler::new(name, 1)
    }

    /// A fresh pool of `threads` threads.
    pub fn new_parallel(name: &str, threads: usize) -> ThreadPoolScheduler {
        ThreadPoolScheduler::new(name, threads)
    }
}

/// Monotonic wall-clock time since the first call.
pub(crate) fn wall_clock() -> Duration {
    EPOCH.elapsed()
}
