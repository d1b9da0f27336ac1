//! Merging inner streams: `flat_map` and `concat_map`.
//!
//! Every inner stream gets its own subscription with a bounded prefetch,
//! replenished one item at a time as its items reach downstream. All items
//! meet in one outlet, which serializes them and applies downstream demand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config;
use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef, Upstreams};

struct Shared<U> {
    outlet: Arc<Outlet<U>>,
    outer: Arc<Deferred>,
    inners: Upstreams,
    /// Live sources, the outer one included.
    active: AtomicUsize,
    bounded: bool,
    prefetch: i64,
}

impl<U: Send + 'static> Shared<U> {
    fn is_stopped(&self) -> bool {
        self.outlet.is_cancelled() || self.inners.is_cancelled()
    }

    fn finish_one(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.outlet.complete();
        }
    }

    fn fail(&self, error: FluxError) {
        self.outer.cancel();
        self.inners.cancel_all();
        self.outlet.error(error);
    }
}

struct OuterSubscriber<U, F> {
    shared: Arc<Shared<U>>,
    mapper: Arc<F>,
    concurrency: i64,
}

impl<T, U, F> Subscriber<T> for OuterSubscriber<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Flux<U> + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.shared.outer.set(subscription);
        self.shared.outer.request(self.concurrency);
    }

    fn on_next(&mut self, item: T) {
        if self.shared.is_stopped() {
            return;
        }
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        let inner = (self.mapper)(item);
        inner.subscribe(InnerSubscriber {
            shared: self.shared.clone(),
            id: None,
            subscription: None,
        });
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        self.shared.finish_one();
    }
}

struct InnerSubscriber<U> {
    shared: Arc<Shared<U>>,
    id: Option<usize>,
    subscription: Option<SubscriptionRef>,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.id = self.shared.inners.add(&subscription);
        if self.id.is_some() {
            self.subscription = Some(subscription.clone());
            subscription.request(self.shared.prefetch);
        }
    }

    fn on_next(&mut self, item: U) {
        if let Some(subscription) = &self.subscription {
            self.shared.outlet.push_replenishing(item, subscription);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        if let Some(id) = self.id.take() {
            self.shared.inners.remove(id);
        }
        self.subscription = None;
        if self.shared.bounded {
            self.shared.outer.request(1);
        }
        self.shared.finish_one();
    }
}

struct FlatMap<T, F> {
    upstream: Flux<T>,
    mapper: Arc<F>,
    concurrency: usize,
}

impl<T, U, F> Publisher<U> for FlatMap<T, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Flux<U> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<U>) {
        let bounded = self.concurrency != usize::MAX;
        let shared = Arc::new(Shared {
            // One inner at a time keeps source order, errors included.
            outlet: Outlet::new(self.concurrency == 1),
            outer: Deferred::new(),
            inners: Upstreams::new(),
            active: AtomicUsize::new(1),
            bounded,
            prefetch: config::global().prefetch as i64,
        });
        let on_cancel = shared.clone();
        shared.outlet.set_on_cancel(move || {
            on_cancel.outer.cancel();
            on_cancel.inners.cancel_all();
        });
        shared.outlet.attach(subscriber);
        let concurrency = if bounded {
            i64::try_from(self.concurrency.max(1)).unwrap_or(UNBOUNDED)
        } else {
            UNBOUNDED
        };
        self.upstream.subscribe(OuterSubscriber {
            shared,
            mapper: self.mapper.clone(),
            concurrency,
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Map every item to an inner stream and merge all inner streams as
    /// their items arrive. Inner streams are subscribed eagerly, without a
    /// concurrency limit.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let pairs = Flux::range(1, 3).flat_map(|x| Flux::from_iter(vec![x; 2]));
    /// let mut all = pairs.collect_list().block_last().unwrap().unwrap();
    /// all.sort();
    /// assert_eq!(all, vec![1, 1, 2, 2, 3, 3]);
    /// ```
    pub fn flat_map<U, F>(&self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        self.flat_map_with(mapper, usize::MAX)
    }

    /// `flat_map` with at most `concurrency` inner streams subscribed at a
    /// time. `usize::MAX` means no limit.
    pub fn flat_map_with<U, F>(&self, mapper: F, concurrency: usize) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        Flux::from_publisher(FlatMap {
            upstream: self.clone(),
            mapper: Arc::new(mapper),
            concurrency,
        })
    }

    /// Map every item to an inner stream and relay the inner streams one
    /// after another, in the order of the items that produced them. The
    /// next inner stream is subscribed only after the previous completed,
    /// and an error is delivered after the items that preceded it.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let expanded = Flux::range(1, 3).concat_map(|x| Flux::range(x * 10, 2));
    /// assert_eq!(
    ///     expanded.collect_list().block_last().unwrap(),
    ///     Some(vec![10, 11, 20, 21, 30, 31])
    /// );
    /// ```
    pub fn concat_map<U, F>(&self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        self.flat_map_with(mapper, 1)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicI64;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::scheduler::{Schedulers, VirtualTimeScheduler};
    use crate::testing::TestSubscriber;

    #[test]
    fn flat_map_completes_after_all_inners() {
        let probe = TestSubscriber::new();
        Flux::range(1, 4)
            .flat_map(|x| Flux::range(0, x as usize))
            .subscribe(probe.clone());
        assert_eq!(probe.values().len(), 1 + 2 + 3 + 4);
        assert!(probe.is_complete());
    }

    #[test]
    fn flat_map_respects_downstream_demand() {
        let probe = TestSubscriber::with_request(3);
        Flux::range(1, 10)
            .flat_map(|x| Flux::range(x * 100, 100))
            .subscribe(probe.clone());
        assert_eq!(probe.values().len(), 3);
        probe.request(5);
        assert_eq!(probe.values().len(), 8);
        assert!(!probe.over_delivered());
        probe.cancel();
    }

    #[test]
    fn flat_map_limits_concurrency() {
        let live = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));
        let vts = VirtualTimeScheduler::new();
        let (l, p, s) = (live.clone(), peak.clone(), vts.clone());
        let probe = TestSubscriber::new();
        Flux::range(0, 10)
            .flat_map_with(
                move |x| {
                    let now = l.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    let l = l.clone();
                    Flux::timer(Duration::from_secs(1), s.clone())
                        .map(move |_| x)
                        .do_on_complete(move || {
                            l.fetch_sub(1, Ordering::SeqCst);
                        })
                },
                3,
            )
            .subscribe(probe.clone());
        vts.advance_time_by(Duration::from_secs(10));
        assert_eq!(probe.values().len(), 10);
        assert!(probe.is_complete());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn inner_error_cancels_everything() {
        let cancelled = Arc::new(Mutex::new(0));
        let c = cancelled.clone();
        let probe = TestSubscriber::new();
        Flux::range(1, 3)
            .flat_map(move |x| {
                if x == 2 {
                    Flux::<i32>::error(FluxError::msg("inner"))
                } else {
                    let c = c.clone();
                    Flux::never().do_finally(move |_| *c.lock().unwrap() += 1)
                }
            })
            .subscribe(probe.clone());
        assert_eq!(probe.error().map(|e| e.kind()), Some(ErrorKind::Upstream));
        assert_eq!(*cancelled.lock().unwrap(), 1);
        assert!(probe.values().is_empty());
    }

    #[test]
    fn concat_map_keeps_order_across_threads() {
        let items = Flux::range(0, 20)
            .concat_map(|x| Flux::range(x * 10, 3).subscribe_on(Schedulers::parallel()))
            .collect_list()
            .block_last()
            .unwrap()
            .unwrap();
        let expected: Vec<i32> = (0..20).flat_map(|x| vec![x * 10, x * 10 + 1, x * 10 + 2]).collect();
        assert_eq!(items, expected);
    }
}
