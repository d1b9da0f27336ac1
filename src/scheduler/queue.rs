//! Timed task queue shared by the thread-pool and virtual-time schedulers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Task, TaskHandle};

/// Below this size the queue is never swept on insert.
const SWEEP_FLOOR: usize = 64;

/// A task waiting for its due time.
pub(super) struct Queued {
    pub task: Task,
    pub handle: TaskHandle,
    /// The disposal flag of the worker that scheduled the task.
    pub disposed: Arc<AtomicBool>,
}

impl Queued {
    /// Neither cancelled nor owned by a disposed worker.
    pub fn is_live(&self) -> bool {
        !self.handle.is_cancelled() && !self.disposed.load(Ordering::Acquire)
    }
}

/// Tasks ordered by due instant, then by submission.
///
/// Removal hands the tasks back to the caller, which drops them after
/// releasing its lock: a task's captures may own a scheduler whose drop
/// locks a queue again.
pub(super) struct TaskQueue<I> {
    tasks: BTreeMap<(I, u64), Queued>,
    seq: u64,
    /// Length right after the last sweep.
    swept: usize,
}

impl<I: Ord + Copy> TaskQueue<I> {
    pub fn new() -> TaskQueue<I> {
        TaskQueue {
            tasks: BTreeMap::new(),
            seq: 0,
            swept: 0,
        }
    }

    /// Insert a task due at `at`. Every time the queue doubled since the
    /// last sweep, cancelled tasks are removed and returned.
    pub fn push(&mut self, at: I, entry: Queued) -> Vec<Queued> {
        let seq = self.seq;
        self.seq += 1;
        self.tasks.insert((at, seq), entry);
        if self.tasks.len() >= 2 * self.swept.max(SWEEP_FLOOR) {
            self.sweep()
        } else {
            Vec::new()
        }
    }

    /// Due instant of the earliest task.
    pub fn first_due(&self) -> Option<I> {
        self.tasks.keys().next().map(|&(at, _)| at)
    }

    pub fn pop_first(&mut self) -> Option<Queued> {
        self.tasks.pop_first().map(|(_, entry)| entry)
    }

    /// Remove every task that can no longer run.
    pub fn sweep(&mut self) -> Vec<Queued> {
        let removed = self.remove_where(|entry| !entry.is_live());
        self.swept = self.tasks.len();
        removed
    }

    /// Remove the tasks of the worker owning `disposed`.
    pub fn remove_worker(&mut self, disposed: &Arc<AtomicBool>) -> Vec<Queued> {
        self.remove_where(|entry| Arc::ptr_eq(&entry.disposed, disposed))
    }

    pub fn take_all(&mut self) -> Vec<Queued> {
        self.swept = 0;
        std::mem::take(&mut self.tasks).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    fn remove_where<P: Fn(&Queued) -> bool>(&mut self, dead: P) -> Vec<Queued> {
        let keys: Vec<(I, u64)> = self
            .tasks
            .iter()
            .filter(|(_, entry)| dead(entry))
            .map(|(key, _)| *key)
            .collect();
        keys.iter().filter_map(|key| self.tasks.remove(key)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn queued(disposed: &Arc<AtomicBool>) -> (Queued, TaskHandle) {
        let handle = TaskHandle::new();
        let entry = Queued {
            task: Box::new(|| ()),
            handle: handle.clone(),
            disposed: disposed.clone(),
        };
        (entry, handle)
    }

    #[test]
    fn pops_in_due_then_submission_order() {
        let disposed = Arc::new(AtomicBool::new(false));
        let mut queue = TaskQueue::new();
        let (a, a_handle) = queued(&disposed);
        let (b, _) = queued(&disposed);
        let (c, _) = queued(&disposed);
        queue.push(2, a);
        queue.push(1, b);
        queue.push(1, c);
        assert_eq!(queue.first_due(), Some(1));
        a_handle.cancel();
        assert_eq!(queue.sweep().len(), 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.pop_first().is_some());
        assert!(queue.pop_first().is_some());
        assert!(queue.pop_first().is_none());
    }

    #[test]
    fn cancelled_tasks_are_swept_as_the_queue_grows() {
        let disposed = Arc::new(AtomicBool::new(false));
        let mut queue = TaskQueue::new();
        let mut removed = 0;
        for i in 0..10_000u64 {
            let (entry, handle) = queued(&disposed);
            handle.cancel();
            removed += queue.push(i, entry).len();
        }
        assert!(queue.len() < 2 * SWEEP_FLOOR);
        assert_eq!(removed + queue.len(), 10_000);
    }

    #[test]
    fn removes_one_workers_tasks() {
        let mine = Arc::new(AtomicBool::new(false));
        let other = Arc::new(AtomicBool::new(false));
        let mut queue = TaskQueue::new();
        queue.push(1, queued(&mine).0);
        queue.push(2, queued(&other).0);
        queue.push(3, queued(&mine).0);
        assert_eq!(queue.remove_worker(&mine).len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_all().len(), 1);
        assert_eq!(queue.len(), 0);
    }
}
