//! Moving work between execution contexts.

use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::scheduler::{ImmediateScheduler, Scheduler, Worker};
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef};

/// Runs every request on the worker that runs the source.
struct WorkerSubscription {
    upstream: SubscriptionRef,
    worker: Arc<dyn Worker>,
}

impl Subscription for WorkerSubscription {
    fn request(&self, n: i64) {
        let upstream = self.upstream.clone();
        self.worker
            .schedule(Box::new(move || upstream.request(n)), Duration::ZERO);
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.worker.dispose();
    }
}

struct SubscribeOnSubscriber<T> {
    downstream: BoxSubscriber<T>,
    worker: Arc<dyn Worker>,
}

impl<T: Send + 'static> Subscriber<T> for SubscribeOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.downstream.on_subscribe(Arc::new(WorkerSubscription {
            upstream: subscription,
            worker: self.worker.clone(),
        }));
    }

    fn on_next(&mut self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        self.downstream.on_error(error);
        self.worker.dispose();
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
        self.worker.dispose();
    }
}

struct SubscribeOn<T> {
    upstream: Flux<T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> Publisher<T> for SubscribeOn<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let worker = self.scheduler.create_worker();
        let upstream = self.upstream.clone();
        let subscriber = SubscribeOnSubscriber {
            downstream: subscriber,
            worker: worker.clone(),
        };
        let handle = worker.schedule(
            Box::new(move || upstream.subscribe(subscriber)),
            Duration::ZERO,
        );
        if handle.is_cancelled() {
            tracing::warn!("subscribe_on worker rejected the subscription");
        }
    }
}

struct PublishOnSubscriber<T> {
    outlet: Arc<Outlet<T>>,
    slot: Arc<Deferred>,
    upstream: Option<SubscriptionRef>,
    prefetch: i64,
}

impl<T: Send + 'static> Subscriber<T> for PublishOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.slot.set(subscription.clone());
        self.upstream = Some(subscription.clone());
        subscription.request(self.prefetch);
    }

    fn on_next(&mut self, item: T) {
        if let Some(upstream) = &self.upstream {
            self.outlet.push_replenishing(item, upstream);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.outlet.error(error);
    }

    fn on_complete(&mut self) {
        self.outlet.complete();
    }
}

struct PublishOn<T> {
    upstream: Flux<T>,
    scheduler: Arc<dyn Scheduler>,
    prefetch: usize,
}

impl<T: Send + 'static> Publisher<T> for PublishOn<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::on_worker(true, self.scheduler.create_worker());
        let slot = Deferred::new();
        let on_cancel = slot.clone();
        outlet.set_on_cancel(move || on_cancel.cancel());
        outlet.attach(subscriber);
        self.upstream.subscribe(PublishOnSubscriber {
            outlet,
            slot,
            upstream: None,
            prefetch: i64::try_from(self.prefetch.max(1)).unwrap_or(i64::MAX),
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Subscribe to this stream, and run every request to it, on a worker
    /// of `scheduler`. The source therefore produces on that worker.
    ///
    /// Only the `subscribe_on` closest to the source matters for where the
    /// source runs.
    ///
    /// ```
    /// use rivulet::{Flux, Schedulers};
    ///
    /// let name = Flux::defer(|| Flux::just(std::thread::current().name().map(String::from)))
    ///     .subscribe_on(Schedulers::new_single("io"))
    ///     .block_last()
    ///     .unwrap()
    ///     .flatten()
    ///     .unwrap();
    /// assert!(name.contains("io"));
    /// ```
    pub fn subscribe_on<S: Scheduler>(&self, scheduler: S) -> Flux<T> {
        Flux::from_publisher(SubscribeOn {
            upstream: self.clone(),
            scheduler: Arc::new(scheduler),
        })
    }

    /// Deliver signals downstream of this point on a worker of
    /// `scheduler`, prefetching up to `Config::buffer_size` items.
    pub fn publish_on<S: Scheduler>(&self, scheduler: S) -> Flux<T> {
        self.publish_on_with(scheduler, config::global().buffer_size)
    }

    /// `publish_on` with an explicit prefetch.
    pub fn publish_on_with<S: Scheduler>(&self, scheduler: S, prefetch: usize) -> Flux<T> {
        Flux::from_publisher(PublishOn {
            upstream: self.clone(),
            scheduler: Arc::new(scheduler),
            prefetch,
        })
    }

    /// Never have more than `n` items requested from upstream at a time,
    /// whatever downstream requests.
    pub fn limit_rate(&self, n: usize) -> Flux<T> {
        self.publish_on_with(ImmediateScheduler, n)
    }
}
