//! Collecting items into vectors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef};

/// Turns a request for `k` chunks into a request for `k * size` items.
struct ScaledSubscription {
    upstream: SubscriptionRef,
    size: i64,
}

impl Subscription for ScaledSubscription {
    fn request(&self, n: i64) {
        if n <= 0 || n == UNBOUNDED {
            self.upstream.request(n);
        } else {
            self.upstream.request(n.saturating_mul(self.size));
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

struct BufferSubscriber<T> {
    downstream: BoxSubscriber<Vec<T>>,
    size: usize,
    chunk: Vec<T>,
}

impl<T: Send + 'static> Subscriber<T> for BufferSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.downstream.on_subscribe(Arc::new(ScaledSubscription {
            upstream: subscription,
            size: i64::try_from(self.size).unwrap_or(UNBOUNDED),
        }));
    }

    fn on_next(&mut self, item: T) {
        self.chunk.push(item);
        if self.chunk.len() == self.size {
            let full = std::mem::replace(&mut self.chunk, Vec::with_capacity(self.size));
            self.downstream.on_next(full);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.chunk.clear();
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        if !self.chunk.is_empty() {
            let rest = std::mem::take(&mut self.chunk);
            self.downstream.on_next(rest);
        }
        self.downstream.on_complete();
    }
}

struct CollectSubscriber<T> {
    outlet: Arc<Outlet<Vec<T>>>,
    slot: Arc<Deferred>,
    items: Vec<T>,
}

impl<T: Send + 'static> Subscriber<T> for CollectSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.slot.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.items.push(item);
    }

    fn on_error(&mut self, error: FluxError) {
        self.items.clear();
        self.outlet.error(error);
    }

    fn on_complete(&mut self) {
        self.outlet.push(std::mem::take(&mut self.items));
        self.outlet.complete();
    }
}

/// Subscribes upstream through a [`Deferred`] slot and asks for everything
/// on the first downstream request.
struct CollectList<T> {
    upstream: Flux<T>,
}

impl<T: Send + 'static> Publisher<Vec<T>> for CollectList<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<Vec<T>>) {
        let outlet = Outlet::new(false);
        let slot = Deferred::new();
        let requested = AtomicBool::new(false);
        let on_request = slot.clone();
        outlet.set_on_request(move |_| {
            if !requested.swap(true, Ordering::AcqRel) {
                on_request.request(UNBOUNDED);
            }
        });
        let on_cancel = slot.clone();
        outlet.set_on_cancel(move || on_cancel.cancel());
        outlet.attach(subscriber);
        self.upstream.subscribe(CollectSubscriber {
            outlet,
            slot,
            items: Vec::new(),
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Group consecutive items into vectors of `size`. The last vector may
    /// be shorter; an empty stream emits no vector at all.
    ///
    /// A request for `k` vectors is passed upstream as a request for
    /// `k * size` items.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let chunks = Flux::range(1, 5).buffer(2);
    /// assert_eq!(
    ///     chunks.collect_list().block_last().unwrap(),
    ///     Some(vec![vec![1, 2], vec![3, 4], vec![5]])
    /// );
    /// ```
    ///
    /// # Panics
    ///
    /// If `size` is zero.
    pub fn buffer(&self, size: usize) -> Flux<Vec<T>> {
        assert!(size > 0, "buffer size must be positive");
        self.stage(false, move |upstream, _| {
            upstream.lift(move |downstream| {
                Box::new(BufferSubscriber {
                    downstream,
                    size,
                    chunk: Vec::with_capacity(size),
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Collect every item into one vector, emitted on completion.
    pub fn collect_list(&self) -> Flux<Vec<T>> {
        Flux::from_publisher(CollectList {
            upstream: self.clone(),
        })
    }
}
