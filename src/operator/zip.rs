//! Pairing the k-th items of several streams.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config;
use crate::demand::Wip;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef};

/// Asks every source for the same amount.
struct AllSources(Vec<Arc<Deferred>>);

impl Subscription for AllSources {
    fn request(&self, n: i64) {
        for source in &self.0 {
            source.request(n);
        }
    }

    fn cancel(&self) {
        for source in &self.0 {
            source.cancel();
        }
    }
}

struct Lanes<T> {
    queues: Vec<VecDeque<T>>,
    done: Vec<bool>,
    finished: bool,
}

struct Shared<T> {
    outlet: Arc<Outlet<Vec<T>>>,
    sources: Arc<AllSources>,
    lanes: Mutex<Lanes<T>>,
    wip: Wip,
}

impl<T: Send + 'static> Shared<T> {
    fn fail(&self, error: FluxError) {
        self.lanes.lock().finished = true;
        self.sources.cancel();
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
        let (ready, finish) = {
            let mut lanes = self.lanes.lock();
            if lanes.finished {
                return;
            }
            let mut ready = Vec::new();
            while lanes.queues.iter().all(|queue| !queue.is_empty()) {
                let tuple: Vec<T> = lanes
                    .queues
                    .iter_mut()
                    .filter_map(VecDeque::pop_front)
                    .collect();
                ready.push(tuple);
            }
            let finish = lanes
                .queues
                .iter()
                .zip(&lanes.done)
                .any(|(queue, done)| *done && queue.is_empty());
            lanes.finished = finish;
            (ready, finish)
        };
        let replenish: SubscriptionRef = self.sources.clone();
        for tuple in ready {
            self.outlet.push_replenishing(tuple, &replenish);
        }
        if finish {
            self.sources.cancel();
            self.outlet.complete();
        }
    }
}

struct LaneSubscriber<T> {
    shared: Arc<Shared<T>>,
    index: usize,
    prefetch: i64,
}

impl<T: Send + 'static> Subscriber<T> for LaneSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let source = &self.shared.sources.0[self.index];
        source.set(subscription);
        source.request(self.prefetch);
    }

    fn on_next(&mut self, item: T) {
        self.shared.lanes.lock().queues[self.index].push_back(item);
        self.shared.drain();
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        self.shared.lanes.lock().done[self.index] = true;
        self.shared.drain();
    }
}

struct Zip<T> {
    sources: Vec<Flux<T>>,
}

impl<T: Send + 'static> Publisher<Vec<T>> for Zip<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<Vec<T>>) {
        let count = self.sources.len();
        let shared = Arc::new(Shared {
            outlet: Outlet::new(false),
            sources: Arc::new(AllSources((0..count).map(|_| Deferred::new()).collect())),
            lanes: Mutex::new(Lanes {
                queues: (0..count).map(|_| VecDeque::new()).collect(),
                done: vec![false; count],
                finished: false,
            }),
            wip: Wip::new(),
        });
        let on_cancel = shared.sources.clone();
        shared.outlet.set_on_cancel(move || on_cancel.cancel());
        shared.outlet.attach(subscriber);
        if count == 0 {
            shared.outlet.complete();
            return;
        }
        let prefetch = config::global().prefetch as i64;
        for (index, source) in self.sources.iter().enumerate() {
            source.subscribe(LaneSubscriber {
                shared: shared.clone(),
                index,
                prefetch,
            });
        }
    }
}

enum Pair<T, U> {
    Left(T),
    Right(U),
}

impl<T: Send + 'static> Flux<T> {
    /// Combine the k-th items of all `sources` into one vector, in source
    /// order. Completes as soon as one source completed and every item it
    /// produced was paired, so the result is as long as the shortest
    /// source.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let zipped = Flux::zip(vec![Flux::range(0, 3), Flux::range(10, 5)]);
    /// assert_eq!(
    ///     zipped.collect_list().block_last().unwrap(),
    ///     Some(vec![vec![0, 10], vec![1, 11], vec![2, 12]])
    /// );
    /// ```
    pub fn zip(sources: Vec<Flux<T>>) -> Flux<Vec<T>> {
        Flux::from_publisher(Zip { sources })
    }

    /// Pair items with those of `other`.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let pairs = Flux::from_iter(vec!["a", "b"]).zip_with(Flux::range(1, 5));
    /// assert_eq!(
    ///     pairs.collect_list().block_last().unwrap(),
    ///     Some(vec![("a", 1), ("b", 2)])
    /// );
    /// ```
    pub fn zip_with<U: Send + 'static>(&self, other: Flux<U>) -> Flux<(T, U)> {
        let left = self.map(Pair::Left);
        let right = other.map(Pair::Right);
        Flux::zip(vec![left, right]).filter_map(|pair| {
            let (mut left, mut right) = (None, None);
            for side in pair {
                match side {
                    Pair::Left(t) => left = Some(t),
                    Pair::Right(u) => right = Some(u),
                }
            }
            left.zip(right)
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
    fn shortest_source_decides_length() {
        let probe = TestSubscriber::new();
        Flux::range(0, 3).zip_with(Flux::range(0, 5)).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![(0, 0), (1, 1), (2, 2)]);
        assert!(probe.is_complete());
    }

    #[test]
    fn waits_for_the_slower_source() {
        let vts = VirtualTimeScheduler::new();
        let probe = TestSubscriber::new();
        let slow = Flux::interval(Duration::from_secs(1), vts.clone()).take(3);
        Flux::range(0, 10)
            .zip_with(slow)
            .subscribe(probe.clone());
        assert!(probe.values().is_empty());
        vts.advance_time_by(Duration::from_secs(2));
        assert_eq!(probe.values(), vec![(0, 0), (1, 1)]);
        vts.advance_time_by(Duration::from_secs(1));
        assert_eq!(probe.values().len(), 3);
        assert!(probe.is_complete());
    }

    #[test]
    fn respects_downstream_demand() {
        let probe = TestSubscriber::with_request(2);
        Flux::zip(vec![Flux::range(0, 100), Flux::range(100, 100)]).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![vec![0, 100], vec![1, 101]]);
        assert!(!probe.over_delivered());
        probe.cancel();
    }

    #[test]
    fn error_from_any_source_fails() {
        let probe = TestSubscriber::new();
        Flux::range(0, 3)
            .zip_with(Flux::<i32>::error(FluxError::msg("right")))
            .subscribe(probe.clone());
        assert!(probe.values().is_empty());
        assert!(probe.error().is_some());
    }

    #[test]
    fn zip_of_nothing_completes() {
        let probe = TestSubscriber::<Vec<u8>>::new();
        Flux::zip(Vec::new()).subscribe(probe.clone());
        assert!(probe.is_complete());
    }
}
