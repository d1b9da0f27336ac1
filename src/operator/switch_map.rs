//! Switching to the newest inner stream.
//!
//! Every outer item starts a new generation. Items of older generations
//! still waiting in the outlet are discarded when the switch happens.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config;
use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef};

#[derive(Default)]
struct State {
    /// Incremented for every outer item; only the inner stream of the
    /// latest generation may emit.
    generation: u64,
    current: Option<SubscriptionRef>,
    inner_active: bool,
    outer_done: bool,
    stopped: bool,
}

struct Shared<U> {
    outlet: Arc<Outlet<U>>,
    outer: Arc<Deferred>,
    state: Mutex<State>,
    prefetch: i64,
}

impl<U: Send + 'static> Shared<U> {
    fn stop(&self) {
        let current = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.current.take()
        };
        self.outer.cancel();
        if let Some(current) = current {
            current.cancel();
        }
    }

    fn fail(&self, error: FluxError) {
        self.stop();
        self.outlet.error(error);
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        !state.stopped && state.generation == generation
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
        let (generation, previous) = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.generation += 1;
            state.inner_active = true;
            (state.generation, state.current.take())
        };
        self.shared.outlet.retire_before(generation);
        if let Some(previous) = previous {
            previous.cancel();
        }
        (self.mapper)(item).subscribe(InnerSubscriber {
            shared: self.shared.clone(),
            generation,
            subscription: None,
        });
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        let finished = {
            let mut state = self.shared.state.lock();
            state.outer_done = true;
            !state.inner_active
        };
        if finished {
            self.shared.outlet.complete();
        }
    }
}

struct InnerSubscriber<U> {
    shared: Arc<Shared<U>>,
    generation: u64,
    subscription: Option<SubscriptionRef>,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let accepted = {
            let mut state = self.shared.state.lock();
            let accepted = !state.stopped && state.generation == self.generation;
            if accepted {
                state.current = Some(subscription.clone());
            }
            accepted
        };
        if !accepted {
            subscription.cancel();
            return;
        }
        self.subscription = Some(subscription.clone());
        subscription.request(self.shared.prefetch);
    }

    fn on_next(&mut self, item: U) {
        if !self.shared.is_current(self.generation) {
            return;
        }
        if let Some(subscription) = &self.subscription {
            self.shared
                .outlet
                .push_in_generation(item, self.generation, subscription);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if self.shared.is_current(self.generation) {
            self.shared.fail(error);
        }
    }

    fn on_complete(&mut self) {
        let finished = {
            let mut state = self.shared.state.lock();
            if state.stopped || state.generation != self.generation {
                return;
            }
            state.current = None;
            state.inner_active = false;
            state.outer_done
        };
        if finished {
            self.shared.outlet.complete();
        }
    }
}

struct SwitchMap<T, F> {
    upstream: Flux<T>,
    mapper: Arc<F>,
}

impl<T, U, F> Publisher<U> for SwitchMap<T, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Flux<U> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<U>) {
        let shared = Arc::new(Shared {
            outlet: Outlet::new(false),
            outer: Deferred::new(),
            state: Mutex::new(State::default()),
            prefetch: config::global().prefetch as i64,
        });
        let on_cancel = shared.clone();
        shared.outlet.set_on_cancel(move || on_cancel.stop());
        shared.outlet.attach(subscriber);
        self.upstream.subscribe(OuterSubscriber {
            shared,
            mapper: self.mapper.clone(),
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Map every item to an inner stream, relaying only the most recent
    /// one. A new outer item cancels the inner stream in progress and drops
    /// whatever it emitted that downstream has not received yet.
    pub fn switch_map<U, F>(&self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        Flux::from_publisher(SwitchMap {
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
    fn new_item_cancels_running_inner() {
        let vts = VirtualTimeScheduler::new();
        let s = vts.clone();
        let probe = TestSubscriber::new();
        Flux::interval(Duration::from_millis(10), vts.clone())
            .take(3)
            .switch_map(move |x| {
                Flux::interval(Duration::from_millis(3), s.clone())
                    .take(5)
                    .map(move |i| x * 10 + i)
            })
            .subscribe(probe.clone());
        vts.advance_time_by(Duration::from_millis(100));
        assert_eq!(probe.values(), vec![0, 1, 2, 10, 11, 12, 20, 21, 22, 23, 24]);
        assert!(probe.is_complete());
    }

    #[test]
    fn completes_after_last_inner() {
        let vts = VirtualTimeScheduler::new();
        let s = vts.clone();
        let probe = TestSubscriber::new();
        Flux::just(7u64)
            .switch_map(move |x| Flux::timer(Duration::from_secs(1), s.clone()).map(move |_| x))
            .subscribe(probe.clone());
        assert!(!probe.is_terminated());
        vts.advance_time_by(Duration::from_secs(1));
        assert_eq!(probe.values(), vec![7]);
        assert!(probe.is_complete());
    }

    #[test]
    fn superseded_items_are_dropped_under_bounded_demand() {
        let probe = TestSubscriber::with_request(1);
        Flux::range(0, 2)
            .switch_map(|x| Flux::range(x * 10, 3))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0]);
        probe.request(10);
        assert_eq!(probe.values(), vec![0, 10, 11, 12]);
        assert!(probe.is_complete());
        assert_eq!(probe.verify_contract(), Ok(()));
    }

    #[test]
    fn inner_error_fails_stream() {
        let probe = TestSubscriber::<i32>::new();
        Flux::range(0, 3)
            .switch_map(|x| {
                if x == 1 {
                    Flux::error(FluxError::msg("inner"))
                } else {
                    Flux::just(x)
                }
            })
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0]);
        assert!(probe.error().is_some());
    }
}
