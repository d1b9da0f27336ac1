//! `flat_map_sequential`: eager subscription, ordered emission.
//!
//! All inner streams are subscribed as soon as they are created and
//! prefetch into their own queue. Only the oldest unfinished inner stream is
//! drained into the outlet; the others wait with at most a prefetch worth
//! of items.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config;
use crate::demand::{Wip, UNBOUNDED};
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef, Upstreams};

struct Inner<U> {
    items: VecDeque<U>,
    done: bool,
    subscription: Option<SubscriptionRef>,
}

type InnerRef<U> = Arc<Mutex<Inner<U>>>;

struct Order<U> {
    inners: VecDeque<InnerRef<U>>,
    outer_done: bool,
}

struct Shared<U> {
    outlet: Arc<Outlet<U>>,
    outer: Arc<Deferred>,
    upstreams: Upstreams,
    order: Mutex<Order<U>>,
    wip: Wip,
    prefetch: i64,
}

impl<U: Send + 'static> Shared<U> {
    fn fail(&self, error: FluxError) {
        self.outer.cancel();
        self.upstreams.cancel_all();
        self.outlet.error(error);
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
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
        loop {
            if self.outlet.is_cancelled() {
                self.order.lock().inners.clear();
                return;
            }
            let head = {
                let order = self.order.lock();
                match order.inners.front() {
                    Some(head) => head.clone(),
                    None => {
                        if order.outer_done {
                            drop(order);
                            self.outlet.complete();
                        }
                        return;
                    }
                }
            };
            let (batch, done, subscription) = {
                let mut inner = head.lock();
                let batch: Vec<U> = inner.items.drain(..).collect();
                (batch, inner.done, inner.subscription.clone())
            };
            for item in batch {
                match &subscription {
                    Some(subscription) => self.outlet.push_replenishing(item, subscription),
                    None => self.outlet.push(item),
                }
            }
            if !done {
                return;
            }
            self.order.lock().inners.pop_front();
        }
    }
}

struct OuterSubscriber<U, F> {
    shared: Arc<Shared<U>>,
    mapper: Arc<F>,
}

impl<T, U, F> Subscriber<T> for OuterSubscriber<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Flux<U> + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.shared.outer.set(subscription);
        self.shared.outer.request(UNBOUNDED);
    }

    fn on_next(&mut self, item: T) {
        if self.shared.outlet.is_cancelled() || self.shared.upstreams.is_cancelled() {
            return;
        }
        let inner = Arc::new(Mutex::new(Inner {
            items: VecDeque::new(),
            done: false,
            subscription: None,
        }));
        self.shared.order.lock().inners.push_back(inner.clone());
        (self.mapper)(item).subscribe(InnerSubscriber {
            shared: self.shared.clone(),
            inner,
            id: None,
        });
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        self.shared.order.lock().outer_done = true;
        self.shared.drain();
    }
}

struct InnerSubscriber<U> {
    shared: Arc<Shared<U>>,
    inner: InnerRef<U>,
    id: Option<usize>,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.id = self.shared.upstreams.add(&subscription);
        if self.id.is_some() {
            self.inner.lock().subscription = Some(subscription.clone());
            subscription.request(self.shared.prefetch);
        }
    }

    fn on_next(&mut self, item: U) {
        self.inner.lock().items.push_back(item);
        self.shared.drain();
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        if let Some(id) = self.id.take() {
            self.shared.upstreams.remove(id);
        }
        self.inner.lock().done = true;
        self.shared.drain();
    }
}

struct FlatMapSequential<T, F> {
    upstream: Flux<T>,
    mapper: Arc<F>,
}

impl<T, U, F> Publisher<U> for FlatMapSequential<T, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Flux<U> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<U>) {
        let shared = Arc::new(Shared {
            outlet: Outlet::new(false),
            outer: Deferred::new(),
            upstreams: Upstreams::new(),
            order: Mutex::new(Order {
                inners: VecDeque::new(),
                outer_done: false,
            }),
            wip: Wip::new(),
            prefetch: config::global().prefetch as i64,
        });
        let on_cancel = shared.clone();
        shared.outlet.set_on_cancel(move || {
            on_cancel.outer.cancel();
            on_cancel.upstreams.cancel_all();
        });
        shared.outlet.attach(subscriber);
        self.upstream.subscribe(OuterSubscriber {
            shared,
            mapper: self.mapper.clone(),
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Like [`flat_map`](Flux::flat_map), inner streams run concurrently,
    /// but their items are emitted in the order of the items that produced
    /// them, like [`concat_map`](Flux::concat_map).
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let ordered = Flux::range(1, 3).flat_map_sequential(|x| Flux::from_iter(vec![x; 2]));
    /// assert_eq!(
    ///     ordered.collect_list().block_last().unwrap(),
    ///     Some(vec![1, 1, 2, 2, 3, 3])
    /// );
    /// ```
    pub fn flat_map_sequential<U, F>(&self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        Flux::from_publisher(FlatMapSequential {
            upstream: self.clone(),
            mapper: Arc::new(mapper),
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::scheduler::VirtualTimeScheduler;
    use crate::testing::TestSubscriber;

    #[test]
    fn later_inner_finishing_first_waits_its_turn() {
        let vts = VirtualTimeScheduler::new();
        let s = vts.clone();
        let probe = TestSubscriber::new();
        Flux::from_iter(vec![3u64, 1, 2])
            .flat_map_sequential(move |secs| {
                Flux::timer(Duration::from_secs(secs), s.clone()).map(move |_| secs)
            })
            .subscribe(probe.clone());
        vts.advance_time_by(Duration::from_secs(2));
        assert!(probe.values().is_empty());
        vts.advance_time_by(Duration::from_secs(1));
        assert_eq!(probe.values(), vec![3, 1, 2]);
        assert!(probe.is_complete());
    }

    #[test]
    fn bounded_downstream_demand() {
        let probe = TestSubscriber::with_request(4);
        Flux::range(0, 3)
            .flat_map_sequential(|x| Flux::range(x * 10, 3))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0, 1, 2, 10]);
        probe.request(10);
        assert_eq!(probe.values(), vec![0, 1, 2, 10, 11, 12, 20, 21, 22]);
        assert!(probe.is_complete());
    }

    #[test]
    fn error_in_queued_inner_fails_fast() {
        let vts = VirtualTimeScheduler::new();
        let s = vts.clone();
        let probe = TestSubscriber::new();
        Flux::range(0, 2)
            .flat_map_sequential(move |x| {
                if x == 0 {
                    Flux::timer(Duration::from_secs(5), s.clone()).map(|_| 0)
                } else {
                    Flux::error(FluxError::msg("second"))
                }
            })
            .subscribe(probe.clone());
        assert!(probe.error().is_some());
        assert!(probe.values().is_empty());
        vts.advance_time_by(Duration::from_secs(5));
        assert!(probe.values().is_empty());
    }
}
