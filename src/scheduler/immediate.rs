use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{wall_clock, Scheduler, Task, TaskHandle, Worker};

/// Runs tasks on the calling thread.
///
/// A delayed task blocks the caller for the delay, so this scheduler is
/// only meant for zero-delay hand-offs such as `limit_rate`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        Arc::new(ImmediateWorker {
            disposed: AtomicBool::new(false),
        })
    }

    fn now(&self) -> Duration {
        wall_clock()
    }
}

struct ImmediateWorker {
    disposed: AtomicBool,
}

impl Worker for ImmediateWorker {
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle {
        if self.is_disposed() {
            return TaskHandle::rejected();
        }
        if delay > Duration::ZERO {
            thread::sleep(delay);
        }
        task();
        TaskHandle::new()
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
