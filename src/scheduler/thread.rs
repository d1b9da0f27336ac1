//! Schedulers backed by dedicated threads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::queue::{Queued, TaskQueue};
use super::{wall_clock, Scheduler, Task, TaskHandle, Worker};
use crate::config;

/// A fixed pool of threads, each draining its own timed queue.
///
/// Every worker is pinned to one thread, chosen round robin, which makes it
/// serial. Threads stop once the scheduler handle and all workers created
/// from it are dropped, or right away on [`dispose`](Self::dispose).
///
/// ```
/// use std::sync::mpsc::channel;
/// use std::time::Duration;
/// use rivulet::{Scheduler, Schedulers};
///
/// let scheduler = Schedulers::new_single("demo");
/// let worker = scheduler.create_worker();
/// let (tx, rx) = channel();
/// worker.schedule(Box::new(move || tx.send(42).unwrap()), Duration::from_millis(5));
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct ThreadPoolScheduler {
    pool: Arc<Pool>,
}

struct Pool {
    name: String,
    executors: Vec<Arc<Executor>>,
    next: AtomicUsize,
}

struct Executor {
    state: Mutex<Queue>,
    ready: Condvar,
}

struct Queue {
    tasks: TaskQueue<Instant>,
    shutdown: bool,
}

impl ThreadPoolScheduler {
    pub(crate) fn new(name: &str, threads: usize) -> ThreadPoolScheduler {
        let threads = threads.max(1);
        let prefix = &config::global().thread_name_prefix;
        let executors = (0..threads)
            .map(|i| {
                let executor = Arc::new(Executor {
                    state: Mutex::new(Queue {
                        tasks: TaskQueue::new(),
                        shutdown: false,
                    }),
                    ready: Condvar::new(),
                });
                let runner = executor.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}-{}", prefix, name, i))
                    .spawn(move || runner.run());
                if let Err(err) = spawned {
                    tracing::error!(scheduler = name, error = %err, "failed to spawn scheduler thread");
                }
                executor
            })
            .collect();
        tracing::debug!(scheduler = name, threads, "scheduler started");
        ThreadPoolScheduler {
            pool: Arc::new(Pool {
                name: name.to_string(),
                executors,
                next: AtomicUsize::new(0),
            }),
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.pool.name
    }

    /// Stop all threads now. Pending tasks are dropped.
    pub fn dispose(&self) {
        self.pool.shutdown();
    }

    /// Number of tasks waiting to run on any thread of the pool. Cancelled
    /// tasks and those of disposed workers are not counted.
    pub fn pending(&self) -> usize {
        self.pool
            .executors
            .iter()
            .map(|executor| {
                let mut queue = executor.state.lock();
                let swept = queue.tasks.sweep();
                let live = queue.tasks.len();
                drop(queue);
                drop(swept);
                live
            })
            .sum()
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        let index = self.pool.next.fetch_add(1, Ordering::Relaxed) % self.pool.executors.len();
        Arc::new(ThreadWorker {
            pool: self.pool.clone(),
            index,
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn now(&self) -> Duration {
        wall_clock()
    }
}

impl Pool {
    fn shutdown(&self) {
        for executor in &self.executors {
            let dropped = {
                let mut queue = executor.state.lock();
                if queue.shutdown {
                    continue;
                }
                queue.shutdown = true;
                executor.ready.notify_all();
                queue.tasks.take_all()
            };
            drop(dropped);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        tracing::debug!(scheduler = %self.name, "scheduler stopped");
        self.shutdown();
    }
}

impl Executor {
    fn run(&self) {
        while let Some(entry) = self.next_due() {
            if !entry.is_live() {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                tracing::error!("scheduled task panicked");
            }
        }
    }

    /// Block until the earliest task is due. `None` after shutdown.
    fn next_due(&self) -> Option<Queued> {
        let mut queue = self.state.lock();
        loop {
            if queue.shutdown {
                return None;
            }
            match queue.tasks.first_due() {
                Some(at) if at <= Instant::now() => {
                    return queue.tasks.pop_first();
                }
                Some(at) => {
                    self.ready.wait_until(&mut queue, at);
                }
                None => self.ready.wait(&mut queue),
            }
        }
    }

    fn push(&self, entry: Queued, delay: Duration) -> bool {
        let swept = {
            let mut queue = self.state.lock();
            if queue.shutdown {
                return false;
            }
            let swept = queue.tasks.push(Instant::now() + delay, entry);
            self.ready.notify_one();
            swept
        };
        drop(swept);
        true
    }

    fn remove_worker(&self, disposed: &Arc<AtomicBool>) {
        let removed = self.state.lock().tasks.remove_worker(disposed);
        drop(removed);
    }
}

struct ThreadWorker {
    pool: Arc<Pool>,
    index: usize,
    disposed: Arc<AtomicBool>,
}

impl Worker for ThreadWorker {
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle {
        if self.is_disposed() {
            return TaskHandle::rejected();
        }
        let handle = TaskHandle::new();
        let entry = Queued {
            task,
            handle: handle.clone(),
            disposed: self.disposed.clone(),
        };
        if self.pool.executors[self.index].push(entry, delay) {
            handle
        } else {
            TaskHandle::rejected()
        }
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.pool.executors[self.index].remove_worker(&self.disposed);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
