//! Serialized hand-off point between producers and one downstream subscriber.
//!
//! Every stage that receives signals from more than one place (several
//! inner sources, a timer and an upstream, a foreign thread pushing into a
//! sink) funnels them through an [`Outlet`]. Producers enqueue; a single
//! drain owner, elected through [`Wip`], delivers to the subscriber while
//! respecting its demand. The subscriber mutex is only ever locked by the
//! drain owner, so it is never contended and never held by anybody else
//! while user code runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::demand::{check_request, Demand, Wip};
use crate::error::FluxError;
use crate::flux::Publisher;
use crate::scheduler::Worker;
use crate::subscriber::{fail_now, BoxSubscriber, Subscription, SubscriptionRef};

type RequestHook = Arc<dyn Fn(i64) + Send + Sync>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// Decision of an overflow policy about an offered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admit {
    /// Enqueue the item.
    Push,
    /// Refuse the item.
    Reject,
    /// Drop the oldest queued item, then enqueue.
    EvictOldest,
    /// Replace the newest queued item.
    ReplaceNewest,
}

/// Outcome of [`Outlet::offer_with`].
pub(crate) enum Offer<T> {
    Queued,
    Rejected(T),
    Evicted(T),
    Closed,
}

struct Entry<T> {
    item: T,
    replenish: Option<SubscriptionRef>,
    generation: u64,
}

struct Queue<T> {
    items: VecDeque<Entry<T>>,
    /// Entries of an older generation are refused.
    live_generation: u64,
    done: bool,
    error: Option<FluxError>,
    illegal: Option<FluxError>,
}

enum Step<T> {
    Next(Entry<T>),
    Error(FluxError),
    Complete,
    Idle,
}

pub(crate) struct Outlet<T> {
    this: Weak<Outlet<T>>,
    queue: Mutex<Queue<T>>,
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    attached: AtomicBool,
    delay_error: bool,
    worker: Option<Arc<dyn Worker>>,
    on_request: Mutex<Option<RequestHook>>,
    on_cancel: Mutex<Option<CancelHook>>,
}

impl<T: Send + 'static> Outlet<T> {
    /// An outlet draining on whichever thread produces or requests.
    ///
    /// With `delay_error` an error waits until queued items are delivered;
    /// otherwise it overtakes them.
    pub fn new(delay_error: bool) -> Arc<Outlet<T>> {
        Outlet::build(delay_error, None)
    }

    /// An outlet whose drain loop always runs on `worker`.
    pub fn on_worker(delay_error: bool, worker: Arc<dyn Worker>) -> Arc<Outlet<T>> {
        Outlet::build(delay_error, Some(worker))
    }

    fn build(delay_error: bool, worker: Option<Arc<dyn Worker>>) -> Arc<Outlet<T>> {
        Arc::new_cyclic(|this| Outlet {
            this: this.clone(),
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                live_generation: 0,
                done: false,
                error: None,
                illegal: None,
            }),
            downstream: Mutex::new(None),
            demand: Demand::new(),
            wip: Wip::new(),
            cancelled: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            delay_error,
            worker,
            on_request: Mutex::new(None),
            on_cancel: Mutex::new(None),
        })
    }

    /// Called with every valid downstream request, before draining.
    pub fn set_on_request<F: Fn(i64) + Send + Sync + 'static>(&self, hook: F) {
        *self.on_request.lock() = Some(Arc::new(hook));
    }

    /// Called once when downstream cancels or sends an illegal request.
    pub fn set_on_cancel<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.on_cancel.lock() = Some(Box::new(hook));
    }

    /// Hand the outlet its subscriber. Only the first caller succeeds; any
    /// later subscriber receives an `IllegalState` error.
    pub fn attach(&self, mut subscriber: BoxSubscriber<T>) {
        if self.attached.swap(true, Ordering::AcqRel) {
            fail_now(
                subscriber,
                FluxError::IllegalState("this stream allows only one subscriber"),
            );
            return;
        }
        let this: SubscriptionRef = match self.this.upgrade() {
            Some(this) => this,
            None => return,
        };
        subscriber.on_subscribe(this);
        *self.downstream.lock() = Some(subscriber);
        self.drain();
    }

    pub fn push(&self, item: T) {
        self.enqueue(Entry {
            item,
            replenish: None,
            generation: 0,
        });
    }

    /// Enqueue an item and request one more from `upstream` once it has
    /// been delivered.
    pub fn push_replenishing(&self, item: T, upstream: &SubscriptionRef) {
        self.push_in_generation(item, 0, upstream);
    }

    /// Like [`push_replenishing`](Outlet::push_replenishing), but the item
    /// is discarded if `generation` was retired before it is delivered.
    pub fn push_in_generation(&self, item: T, generation: u64, upstream: &SubscriptionRef) {
        self.enqueue(Entry {
            item,
            replenish: Some(upstream.clone()),
            generation,
        });
    }

    /// Drop every queued item older than `generation` and refuse any that
    /// arrive later.
    pub fn retire_before(&self, generation: u64) {
        let mut queue = self.queue.lock();
        queue.live_generation = queue.live_generation.max(generation);
        let live = queue.live_generation;
        queue.items.retain(|entry| entry.generation >= live);
    }

    fn enqueue(&self, entry: Entry<T>) {
        {
            let mut queue = self.queue.lock();
            if queue.done
                || self.cancelled.load(Ordering::Acquire)
                || entry.generation < queue.live_generation
            {
                return;
            }
            queue.items.push_back(entry);
        }
        self.drain();
    }

    /// Enqueue subject to an overflow decision taken atomically from the
    /// number of queued items and the outstanding demand.
    pub fn offer_with<F>(&self, item: T, decide: F) -> Offer<T>
    where
        F: FnOnce(usize, i64) -> Admit,
    {
        let offer = {
            let mut queue = self.queue.lock();
            if queue.done || self.cancelled.load(Ordering::Acquire) {
                return Offer::Closed;
            }
            let entry = Entry {
                item,
                replenish: None,
                generation: 0,
            };
            match decide(queue.items.len(), self.demand.get()) {
                Admit::Push => {
                    queue.items.push_back(entry);
                    Offer::Queued
                }
                Admit::Reject => Offer::Rejected(entry.item),
                Admit::EvictOldest => {
                    let oldest = queue.items.pop_front();
                    queue.items.push_back(entry);
                    oldest.map_or(Offer::Queued, |old| Offer::Evicted(old.item))
                }
                Admit::ReplaceNewest => {
                    let newest = queue.items.pop_back();
                    queue.items.push_back(entry);
                    newest.map_or(Offer::Queued, |old| Offer::Evicted(old.item))
                }
            }
        };
        self.drain();
        offer
    }

    pub fn complete(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.done {
                return;
            }
            queue.done = true;
        }
        self.drain();
    }

    pub fn error(&self, error: FluxError) {
        {
            let mut queue = self.queue.lock();
            if queue.done {
                tracing::debug!(error = %error, "error after termination dropped");
                return;
            }
            queue.done = true;
            queue.error = Some(error);
        }
        self.drain();
    }

    /// Whether downstream cancelled or a terminal signal was delivered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether `complete` or `error` was called.
    pub fn is_done(&self) -> bool {
        self.queue.lock().done
    }

    pub fn requested(&self) -> i64 {
        self.demand.get()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().items.len()
    }

    fn run_cancel_hook(&self) {
        let hook = self.on_cancel.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn dispose_worker(&self) {
        if let Some(worker) = &self.worker {
            worker.dispose();
        }
    }

    /// After a terminal signal the hooks would only keep the producing
    /// stage alive.
    fn release_hooks(&self) {
        self.on_request.lock().take();
        self.on_cancel.lock().take();
        self.dispose_worker();
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        match &self.worker {
            Some(worker) => {
                if let Some(this) = self.this.upgrade() {
                    worker.schedule(Box::new(move || this.drain_loop()), Duration::ZERO);
                }
            }
            None => self.drain_loop(),
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(&self) {
        let mut guard = self.downstream.lock();
        let release = match guard.as_mut() {
            Some(subscriber) => self.deliver(subscriber),
            None => {
                if self.cancelled.load(Ordering::Acquire) {
                    self.queue.lock().items.clear();
                }
                false
            }
        };
        if release {
            *guard = None;
        }
    }

    /// Deliver as much as demand allows. Returns `true` once the subscriber
    /// will never be called again.
    fn deliver(&self, subscriber: &mut BoxSubscriber<T>) -> bool {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.lock().items.clear();
                return true;
            }
            let step = self.next_step();
            match step {
                Step::Next(entry) => {
                    self.demand.produced(1);
                    subscriber.on_next(entry.item);
                    if let Some(upstream) = entry.replenish {
                        upstream.request(1);
                    }
                }
                Step::Error(error) => {
                    self.cancelled.store(true, Ordering::Release);
                    subscriber.on_error(error);
                    self.release_hooks();
                    return true;
                }
                Step::Complete => {
                    self.cancelled.store(true, Ordering::Release);
                    subscriber.on_complete();
                    self.release_hooks();
                    return true;
                }
                Step::Idle => return false,
            }
        }
    }

    fn next_step(&self) -> Step<T> {
        let mut queue = self.queue.lock();
        if let Some(error) = queue.illegal.take() {
            queue.items.clear();
            return Step::Error(error);
        }
        if !self.delay_error || queue.items.is_empty() {
            if let Some(error) = queue.error.take() {
                queue.items.clear();
                return Step::Error(error);
            }
        }
        if queue.items.is_empty() {
            return if queue.done { Step::Complete } else { Step::Idle };
        }
        if self.demand.get() == 0 {
            return Step::Idle;
        }
        match queue.items.pop_front() {
            Some(entry) => Step::Next(entry),
            None => Step::Idle,
        }
    }
}

impl<T: Send + 'static> Subscription for Outlet<T> {
    fn request(&self, n: i64) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        match check_request(n) {
            Err(error) => {
                {
                    let mut queue = self.queue.lock();
                    queue.done = true;
                    queue.illegal = Some(error);
                }
                self.run_cancel_hook();
                self.drain();
            }
            Ok(None) => {}
            Ok(Some(n)) => {
                self.demand.add(n);
                let hook = self.on_request.lock().clone();
                if let Some(hook) = hook {
                    hook(n);
                }
                self.drain();
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.run_cancel_hook();
        self.drain();
        self.dispose_worker();
    }
}

impl<T: Send + 'static> Publisher<T> for Outlet<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        self.attach(subscriber);
    }
}
