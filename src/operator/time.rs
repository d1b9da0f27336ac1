//! Time-based stages. All of them take their scheduler explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::operator::recover::Arbiter;
use crate::outlet::Outlet;
use crate::scheduler::{Scheduler, TaskHandle, Worker};
use crate::subscriber::{BoxSubscriber, Subscriber, Subscription, SubscriptionRef};

/// Index value once the stage stopped listening to its upstream.
const FINISHED: u64 = u64::MAX;

struct Watch<T> {
    outlet: Arc<Outlet<T>>,
    arbiter: Arc<Arbiter>,
    worker: Arc<dyn Worker>,
    /// Number of items seen so far; every item re-arms the timer.
    index: AtomicU64,
    timer: Mutex<Option<TaskHandle>>,
    timeout: Duration,
    fallback: Option<Flux<T>>,
}

impl<T: Send + 'static> Watch<T> {
    fn arm(self: &Arc<Self>, index: u64) {
        let watch = self.clone();
        let handle = self
            .worker
            .schedule(Box::new(move || watch.fire(index)), self.timeout);
        let previous = self.timer.lock().replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn disarm(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    fn fire(self: &Arc<Self>, index: u64) {
        if self
            .index
            .compare_exchange(index, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.arbiter.switch_off();
        match &self.fallback {
            Some(fallback) => {
                tracing::debug!(timeout = ?self.timeout, "timed out, switching to fallback");
                fallback.subscribe(FallbackSubscriber {
                    watch: self.clone(),
                });
            }
            None => {
                tracing::debug!(timeout = ?self.timeout, "timed out");
                self.outlet.error(FluxError::Timeout(self.timeout));
                self.worker.dispose();
            }
        }
    }

    /// Claim the terminal signal of the upstream. Fails after a timeout.
    fn finish(&self) -> bool {
        let mut current = self.index.load(Ordering::Acquire);
        loop {
            if current == FINISHED {
                return false;
            }
            match self.index.compare_exchange_weak(
                current,
                FINISHED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.disarm();
                    self.worker.dispose();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

struct WatchedSubscriber<T> {
    watch: Arc<Watch<T>>,
}

impl<T: Send + 'static> Subscriber<T> for WatchedSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        // the timer may already have fired before upstream got here
        let index = &self.watch.index;
        self.watch
            .arbiter
            .set_unless(subscription, || index.load(Ordering::Acquire) == FINISHED);
    }

    fn on_next(&mut self, item: T) {
        let index = self.watch.index.load(Ordering::Acquire);
        if index == FINISHED
            || self
                .watch
                .index
                .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        self.watch.arbiter.produced(1);
        self.watch.outlet.push(item);
        self.watch.arm(index + 1);
    }

    fn on_error(&mut self, error: FluxError) {
        if self.watch.finish() {
            self.watch.outlet.error(error);
        }
    }

    fn on_complete(&mut self) {
        if self.watch.finish() {
            self.watch.outlet.complete();
        }
    }
}

struct FallbackSubscriber<T> {
    watch: Arc<Watch<T>>,
}

impl<T: Send + 'static> Subscriber<T> for FallbackSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.watch.arbiter.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.watch.arbiter.produced(1);
        self.watch.outlet.push(item);
    }

    fn on_error(&mut self, error: FluxError) {
        self.watch.worker.dispose();
        self.watch.outlet.error(error);
    }

    fn on_complete(&mut self) {
        self.watch.worker.dispose();
        self.watch.outlet.complete();
    }
}

struct Timeout<T> {
    upstream: Flux<T>,
    timeout: Duration,
    fallback: Option<Flux<T>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> Publisher<T> for Timeout<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let watch = Arc::new(Watch {
            outlet: Outlet::new(true),
            arbiter: Arbiter::new(),
            worker: self.scheduler.create_worker(),
            index: AtomicU64::new(0),
            timer: Mutex::new(None),
            timeout: self.timeout,
            fallback: self.fallback.clone(),
        });
        let arbiter = watch.arbiter.clone();
        watch.outlet.set_on_request(move |n| arbiter.request(n));
        let on_cancel = watch.clone();
        watch.outlet.set_on_cancel(move || {
            on_cancel.index.store(FINISHED, Ordering::Release);
            on_cancel.disarm();
            on_cancel.arbiter.cancel();
            on_cancel.worker.dispose();
        });
        watch.outlet.attach(subscriber);
        watch.arm(0);
        self.upstream.subscribe(WatchedSubscriber { watch });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Fail with [`FluxError::Timeout`] if the first item, or any item after
    /// the previous one, takes longer than `timeout` to arrive. The timer
    /// starts at subscription and the late upstream is cancelled.
    ///
    /// ```
    /// use std::time::Duration;
    /// use rivulet::{ErrorKind, Flux, Schedulers};
    ///
    /// let late = Flux::<i32>::never().timeout(Duration::from_millis(10), Schedulers::parallel());
    /// assert_eq!(late.block_last().unwrap_err().kind(), ErrorKind::Timeout);
    /// ```
    pub fn timeout<S: Scheduler>(&self, timeout: Duration, scheduler: S) -> Flux<T> {
        Flux::from_publisher(Timeout {
            upstream: self.clone(),
            timeout,
            fallback: None,
            scheduler: Arc::new(scheduler),
        })
    }

    /// Like [`timeout`](Flux::timeout), but continue with `fallback`
    /// instead of failing.
    pub fn timeout_or<S: Scheduler>(&self, timeout: Duration, fallback: Flux<T>, scheduler: S) -> Flux<T> {
        Flux::from_publisher(Timeout {
            upstream: self.clone(),
            timeout,
            fallback: Some(fallback),
            scheduler: Arc::new(scheduler),
        })
    }

    /// Delay every item by `delay`, measured from when the previous item
    /// was delivered. Order is preserved.
    pub fn delay_elements<S: Scheduler>(&self, delay: Duration, scheduler: S) -> Flux<T> {
        let scheduler: Arc<dyn Scheduler> = Arc::new(scheduler);
        self.concat_map(move |item| Flux::delayed(item, delay, scheduler.clone()))
    }
}
