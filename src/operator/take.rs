//! Stages that stop after a fixed number of items.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::FluxError;
use crate::flux::Flux;
use crate::subscriber::{BoxSubscriber, NoopSubscription, Subscriber, Subscription, SubscriptionRef};

/// Forwards requests upstream until `limit` units were granted in total.
struct Capped {
    upstream: SubscriptionRef,
    limit: i64,
    granted: AtomicI64,
}

impl Subscription for Capped {
    fn request(&self, n: i64) {
        if n <= 0 {
            self.upstream.request(n);
            return;
        }
        let mut granted = self.granted.load(Ordering::Acquire);
        loop {
            if granted >= self.limit {
                return;
            }
            let grant = n.min(self.limit - granted);
            match self.granted.compare_exchange_weak(
                granted,
                granted + grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.upstream.request(grant);
                    return;
                }
                Err(actual) => granted = actual,
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

struct TakeSubscriber<T> {
    downstream: BoxSubscriber<T>,
    limit: u64,
    seen: u64,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.limit == 0 {
            subscription.cancel();
            self.done = true;
            self.downstream.on_subscribe(Arc::new(NoopSubscription));
            self.downstream.on_complete();
            return;
        }
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(Arc::new(Capped {
            upstream: subscription,
            limit: i64::try_from(self.limit).unwrap_or(i64::MAX),
            granted: AtomicI64::new(0),
        }));
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        self.seen += 1;
        self.downstream.on_next(item);
        if self.seen == self.limit {
            self.done = true;
            if let Some(upstream) = self.upstream.take() {
                upstream.cancel();
            }
            self.downstream.on_complete();
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Emit at most `n` items, then cancel upstream and complete.
    ///
    /// Upstream is never asked for more than `n` items in total.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let first = Flux::range(1, 1000).take(3);
    /// assert_eq!(first.collect_list().block_last().unwrap(), Some(vec![1, 2, 3]));
    /// ```
    pub fn take(&self, n: u64) -> Flux<T> {
        self.stage(false, move |upstream, _| {
            upstream.lift(move |downstream| {
                Box::new(TakeSubscriber {
                    downstream,
                    limit: n,
                    seen: 0,
                    upstream: None,
                    done: false,
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Same as [`take`](Flux::take).
    pub fn limit_request(&self, n: u64) -> Flux<T> {
        self.take(n)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::demand::UNBOUNDED;
    use crate::testing::TestSubscriber;

    #[test]
    fn caps_upstream_demand() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        let probe = TestSubscriber::new();
        Flux::range(1, 3)
            .lift(move |downstream: BoxSubscriber<i32>| {
                Box::new(RequestSpy {
                    downstream,
                    log: log.clone(),
                }) as BoxSubscriber<i32>
            })
            .take(2)
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.is_complete());
        assert_eq!(*requests.lock().unwrap(), vec![2]);
    }

    #[test]
    fn limit_request_over_partial_requests() {
        let probe = TestSubscriber::with_request(1);
        Flux::range(1, 10).limit_request(3).subscribe(probe.clone());
        probe.request(1);
        probe.request(UNBOUNDED);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn take_zero_completes_at_once() {
        let probe = TestSubscriber::<i32>::with_request(0);
        Flux::never().take(0).subscribe(probe.clone());
        assert!(probe.is_complete());
    }

    struct RequestSpy {
        downstream: BoxSubscriber<i32>,
        log: Arc<Mutex<Vec<i64>>>,
    }

    struct SpySubscription {
        upstream: SubscriptionRef,
        log: Arc<Mutex<Vec<i64>>>,
    }

    impl Subscription for SpySubscription {
        fn request(&self, n: i64) {
            self.log.lock().unwrap().push(n);
            self.upstream.request(n);
        }
        fn cancel(&self) {
            self.upstream.cancel();
        }
    }

    impl Subscriber<i32> for RequestSpy {
        fn on_subscribe(&mut self, subscription: SubscriptionRef) {
            self.downstream.on_subscribe(Arc::new(SpySubscription {
                upstream: subscription,
                log: self.log.clone(),
            }));
        }
        fn on_next(&mut self, item: i32) {
            self.downstream.on_next(item)
        }
        fn on_error(&mut self, error: FluxError) {
            self.downstream.on_error(error)
        }
        fn on_complete(&mut self) {
            self.downstream.on_complete()
        }
    }
}
