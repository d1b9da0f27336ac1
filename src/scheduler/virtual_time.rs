//! A scheduler driven by a logical clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::queue::{Queued, TaskQueue};
use super::{Scheduler, Task, TaskHandle, Worker};
use crate::demand::Wip;

/// Scheduler whose clock only moves when told to.
///
/// Tasks due at the current virtual instant run as soon as they are
/// scheduled; delayed tasks run, in due order, while
/// [`advance_time_by`](Self::advance_time_by) or
/// [`advance_time_to`](Self::advance_time_to) sweeps over their due time.
/// The clock reads the due time of a task while it runs.
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
/// use rivulet::{Scheduler, VirtualTimeScheduler};
///
/// let vts = VirtualTimeScheduler::new();
/// let seen = Arc::new(Mutex::new(None));
/// let slot = seen.clone();
/// let clock = vts.clone();
/// vts.create_worker().schedule(
///     Box::new(move || *slot.lock().unwrap() = Some(clock.now())),
///     Duration::from_secs(3),
/// );
/// vts.advance_time_by(Duration::from_secs(2));
/// assert_eq!(*seen.lock().unwrap(), None);
/// vts.advance_time_by(Duration::from_secs(2));
/// assert_eq!(*seen.lock().unwrap(), Some(Duration::from_secs(3)));
/// assert_eq!(vts.now(), Duration::from_secs(4));
/// ```
#[derive(Clone, Default)]
pub struct VirtualTimeScheduler {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<Clock>,
    wip: Wip,
}

struct Clock {
    now: Duration,
    horizon: Duration,
    queue: TaskQueue<Duration>,
}

impl Default for Clock {
    fn default() -> Clock {
        Clock {
            now: Duration::ZERO,
            horizon: Duration::ZERO,
            queue: TaskQueue::new(),
        }
    }
}

impl VirtualTimeScheduler {
    /// A scheduler at virtual time zero.
    pub fn new() -> VirtualTimeScheduler {
        VirtualTimeScheduler::default()
    }

    /// Move the clock forward by `delta`, running every task that falls due.
    pub fn advance_time_by(&self, delta: Duration) {
        let target = self.inner.state.lock().horizon + delta;
        self.advance_time_to(target);
    }

    /// Move the clock to `instant`. Moving backwards is a no-op.
    pub fn advance_time_to(&self, instant: Duration) {
        {
            let mut clock = self.inner.state.lock();
            if instant > clock.horizon {
                clock.horizon = instant;
            }
        }
        self.inner.drain();
    }

    /// Number of tasks still waiting for the clock. Cancelled tasks and
    /// those of disposed workers are not counted.
    pub fn pending(&self) -> usize {
        let mut clock = self.inner.state.lock();
        let swept = clock.queue.sweep();
        let live = clock.queue.len();
        drop(clock);
        drop(swept);
        live
    }
}

impl Inner {
    fn schedule(&self, entry: Queued, delay: Duration) {
        let swept = {
            let mut clock = self.state.lock();
            let due = clock.now + delay;
            clock.queue.push(due, entry)
        };
        drop(swept);
        self.drain();
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            while let Some(entry) = self.next_due() {
                if entry.is_live() {
                    (entry.task)();
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn next_due(&self) -> Option<Queued> {
        let mut clock = self.state.lock();
        match clock.queue.first_due() {
            Some(at) if at <= clock.horizon => {
                if at > clock.now {
                    clock.now = at;
                }
                clock.queue.pop_first()
            }
            _ => {
                clock.now = clock.horizon;
                None
            }
        }
    }
}

impl Scheduler for VirtualTimeScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        Arc::new(VirtualWorker {
            inner: self.inner.clone(),
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn now(&self) -> Duration {
        self.inner.state.lock().now
    }
}

struct VirtualWorker {
    inner: Arc<Inner>,
    disposed: Arc<AtomicBool>,
}

impl Worker for VirtualWorker {
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle {
        if self.is_disposed() {
            return TaskHandle::rejected();
        }
        let handle = TaskHandle::new();
        self.inner.schedule(
            Queued {
                task,
                handle: handle.clone(),
                disposed: self.disposed.clone(),
            },
            delay,
        );
        handle
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.inner.state.lock().queue.remove_worker(&self.disposed);
        drop(removed);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
