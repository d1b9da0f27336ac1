//! Recovering from errors.
//!
//! Stages that replace their upstream after a failure hand downstream an
//! [`Arbiter`] instead of the upstream subscription. The arbiter remembers
//! how much downstream requested and was not delivered yet, and asks each
//! new upstream for exactly that.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::demand::{Wip, UNBOUNDED};
use crate::error::FluxError;
use crate::flux::{ContinueHook, Flux, Publisher};
use crate::subscriber::{BoxSubscriber, Subscriber, Subscription, SubscriptionRef};

#[derive(Default)]
struct ArbiterState {
    current: Option<SubscriptionRef>,
    requested: i64,
    illegal: Option<i64>,
    cancelled: bool,
}

/// A subscription whose upstream can be swapped.
#[derive(Default)]
pub(crate) struct Arbiter {
    state: Mutex<ArbiterState>,
}

impl Arbiter {
    pub fn new() -> Arc<Arbiter> {
        Arc::new(Arbiter::default())
    }

    /// Make `upstream` the current source and ask it for the outstanding
    /// demand.
    pub fn set(&self, upstream: SubscriptionRef) {
        self.set_unless(upstream, || false);
    }

    /// Like [`set`](Arbiter::set), but cancel `upstream` instead if `stale`
    /// holds. `stale` is evaluated under the arbiter lock, so it cannot
    /// race with [`switch_off`](Arbiter::switch_off).
    pub fn set_unless<F: FnOnce() -> bool>(&self, upstream: SubscriptionRef, stale: F) {
        let pending = {
            let mut state = self.state.lock();
            if state.cancelled || stale() {
                None
            } else {
                state.current = Some(upstream.clone());
                Some(state.illegal.take().unwrap_or(state.requested))
            }
        };
        match pending {
            None => upstream.cancel(),
            Some(0) => {}
            Some(n) => upstream.request(n),
        }
    }

    /// Account for `n` delivered items.
    pub fn produced(&self, n: i64) {
        let mut state = self.state.lock();
        if state.requested != UNBOUNDED {
            state.requested = (state.requested - n).max(0);
        }
    }

    /// Cancel the current upstream but stay open for a successor.
    pub fn switch_off(&self) {
        let current = self.state.lock().current.take();
        if let Some(current) = current {
            current.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

impl Subscription for Arbiter {
    fn request(&self, n: i64) {
        let upstream = {
            let mut state = self.state.lock();
            if state.cancelled || n == 0 {
                return;
            }
            if n < 0 {
                if state.current.is_none() {
                    state.illegal = Some(n);
                }
            } else {
                state.requested = state.requested.saturating_add(n);
            }
            state.current.clone()
        };
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let current = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.current.take()
        };
        if let Some(current) = current {
            current.cancel();
        }
    }
}

/// Forwards signals of successive upstreams to one downstream subscriber.
pub(crate) struct Relay<T> {
    pub downstream: BoxSubscriber<T>,
    pub arbiter: Arc<Arbiter>,
}

impl<T: Send + 'static> Relay<T> {
    /// Subscribe `downstream` to a fresh arbiter.
    pub fn start(mut downstream: BoxSubscriber<T>) -> Relay<T> {
        let arbiter = Arbiter::new();
        downstream.on_subscribe(arbiter.clone());
        Relay {
            downstream,
            arbiter,
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Relay<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.arbiter.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.arbiter.produced(1);
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

/// Errors no recovery operator may swallow.
fn is_fatal(error: &FluxError) -> bool {
    matches!(error, FluxError::IllegalDemand(_))
}

struct ResumeSubscriber<T, F> {
    relay: Option<Relay<T>>,
    fallback: Arc<F>,
}

impl<T, F> Subscriber<T> for ResumeSubscriber<T, F>
where
    T: Send + 'static,
    F: Fn(FluxError) -> Flux<T> + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if let Some(relay) = &mut self.relay {
            relay.on_subscribe(subscription);
        }
    }

    fn on_next(&mut self, item: T) {
        if let Some(relay) = &mut self.relay {
            relay.on_next(item);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        let mut relay = match self.relay.take() {
            Some(relay) => relay,
            None => return,
        };
        if is_fatal(&error) {
            relay.on_error(error);
            return;
        }
        tracing::debug!(error = %error, kind = error.as_label(), "resuming with fallback");
        (self.fallback)(error).subscribe(relay);
    }

    fn on_complete(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.on_complete();
        }
    }
}

struct Resume<T, F> {
    upstream: Flux<T>,
    fallback: Arc<F>,
}

impl<T, F> Publisher<T> for Resume<T, F>
where
    T: Send + 'static,
    F: Fn(FluxError) -> Flux<T> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        self.upstream.subscribe(ResumeSubscriber {
            relay: Some(Relay::start(subscriber)),
            fallback: self.fallback.clone(),
        });
    }
}

struct MapErrorSubscriber<T, F> {
    downstream: BoxSubscriber<T>,
    f: Arc<F>,
}

impl<T, F> Subscriber<T> for MapErrorSubscriber<T, F>
where
    T: Send + 'static,
    F: Fn(FluxError) -> FluxError + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        self.downstream.on_error((self.f)(error));
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

/// Resubscribes without growing the stack when an attempt fails
/// synchronously during `subscribe`.
struct RetryState<T> {
    upstream: Flux<T>,
    remaining: AtomicU64,
    pending: Mutex<Option<Relay<T>>>,
    wip: Wip,
}

impl<T: Send + 'static> RetryState<T> {
    fn resubscribe(self: &Arc<Self>, relay: Relay<T>) {
        *self.pending.lock() = Some(relay);
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let relay = self.pending.lock().take();
            if let Some(relay) = relay {
                if !relay.arbiter.is_cancelled() {
                    self.upstream.subscribe(RetrySubscriber {
                        state: self.clone(),
                        relay: Some(relay),
                    });
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }
}

struct RetrySubscriber<T> {
    state: Arc<RetryState<T>>,
    relay: Option<Relay<T>>,
}

impl<T: Send + 'static> Subscriber<T> for RetrySubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if let Some(relay) = &mut self.relay {
            relay.on_subscribe(subscription);
        }
    }

    fn on_next(&mut self, item: T) {
        if let Some(relay) = &mut self.relay {
            relay.on_next(item);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        let mut relay = match self.relay.take() {
            Some(relay) => relay,
            None => return,
        };
        let remaining = self.state.remaining.load(Ordering::Acquire);
        if remaining == 0 || is_fatal(&error) {
            relay.on_error(error);
            return;
        }
        self.state.remaining.store(remaining - 1, Ordering::Release);
        tracing::debug!(error = %error, remaining = remaining - 1, "retrying");
        self.state.resubscribe(relay);
    }

    fn on_complete(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.on_complete();
        }
    }
}

struct Retry<T> {
    upstream: Flux<T>,
    attempts: u64,
}

impl<T: Send + 'static> Publisher<T> for Retry<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let state = Arc::new(RetryState {
            upstream: self.upstream.clone(),
            remaining: AtomicU64::new(self.attempts),
            pending: Mutex::new(None),
            wip: Wip::new(),
        });
        state.resubscribe(Relay::start(subscriber));
    }
}

impl<T: Send + 'static> Flux<T> {
    /// On error, continue with the stream returned by `fallback`.
    ///
    /// Demand that was requested but not yet delivered carries over to the
    /// fallback.
    pub fn on_error_resume<F>(&self, fallback: F) -> Flux<T>
    where
        F: Fn(FluxError) -> Flux<T> + Send + Sync + 'static,
    {
        Flux::from_publisher(Resume {
            upstream: self.clone(),
            fallback: Arc::new(fallback),
        })
    }

    /// On error, emit `value` and complete.
    ///
    /// ```
    /// use rivulet::{Flux, FluxError};
    ///
    /// let recovered = Flux::range(1, 2)
    ///     .concat_with(Flux::error(FluxError::msg("boom")))
    ///     .on_error_return(-1);
    /// assert_eq!(
    ///     recovered.collect_list().block_last().unwrap(),
    ///     Some(vec![1, 2, -1])
    /// );
    /// ```
    pub fn on_error_return(&self, value: T) -> Flux<T>
    where
        T: Clone + Sync,
    {
        self.on_error_resume(move |_| Flux::just(value.clone()))
    }

    /// Replace the error with `f(error)`. The stream still fails.
    pub fn on_error_map<F>(&self, f: F) -> Flux<T>
    where
        F: Fn(FluxError) -> FluxError + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.stage(false, move |upstream, _| {
            let f = f.clone();
            upstream.lift(move |downstream| {
                Box::new(MapErrorSubscriber {
                    downstream,
                    f: f.clone(),
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Skip elements that fail in an upstream [`try_map`](Flux::try_map) or
    /// [`try_filter`](Flux::try_filter), reporting each to `hook` together
    /// with the element, which can be recovered with
    /// [`downcast_ref`](std::any::Any::downcast_ref).
    ///
    /// Only those stages, and the `map`, `filter` and peek stages between
    /// them and this operator, cooperate. Errors from anywhere else pass
    /// through unchanged.
    pub fn on_error_continue<H>(&self, hook: H) -> Flux<T>
    where
        H: Fn(&FluxError, &dyn Any) + Send + Sync + 'static,
    {
        if !self.can_resume() {
            tracing::debug!("no element-level recovery upstream, on_error_continue has no effect");
            return self.clone();
        }
        let hook: ContinueHook = Arc::new(hook);
        self.resumed(hook)
    }

    /// Resubscribe to this stream after an error, at most `attempts` times.
    /// The last error is passed on. Outstanding demand carries over to
    /// each new attempt.
    pub fn retry(&self, attempts: u64) -> Flux<T> {
        Flux::from_publisher(Retry {
            upstream: self.clone(),
            attempts,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::TestSubscriber;

    fn divide(x: i32) -> Result<i32, FluxError> {
        100i32
            .checked_div(x)
            .ok_or_else(|| FluxError::msg("attempt to divide by zero"))
    }

    fn flaky(failures: usize, attempts: Arc<AtomicUsize>) -> Flux<i32> {
        Flux::defer(move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < failures {
                Flux::just(1).concat_with(Flux::error(FluxError::msg("flaky")))
            } else {
                Flux::from_iter(vec![1, 2])
            }
        })
    }

    #[test]
    fn on_error_return_appends_value() {
        let probe = TestSubscriber::new();
        Flux::from_iter(vec![1, 2, 0, 5])
            .try_map(divide)
            .on_error_return(-1)
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![100, 50, -1]);
        assert!(probe.is_complete());
    }

    #[test]
    fn resume_carries_outstanding_demand() {
        let probe = TestSubscriber::with_request(3);
        Flux::just(1)
            .concat_with(Flux::error(FluxError::msg("x")))
            .on_error_resume(|_| Flux::range(10, 100))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 10, 11]);
        assert!(!probe.over_delivered());
        probe.request(1);
        assert_eq!(probe.values(), vec![1, 10, 11, 12]);
    }

    #[test]
    fn on_error_map_replaces_error() {
        let probe = TestSubscriber::<i32>::new();
        Flux::error(FluxError::msg("low level"))
            .on_error_map(|e| FluxError::msg(format!("wrapped: {}", e)))
            .subscribe(probe.clone());
        assert_eq!(
            probe.error().map(|e| e.to_string()),
            Some("wrapped: low level".to_string())
        );
    }

    #[test]
    fn retry_once_then_succeed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let probe = TestSubscriber::new();
        flaky(1, attempts.clone()).retry(1).subscribe(probe.clone());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(probe.values(), vec![1, 1, 2]);
        assert!(probe.is_complete());
    }

    #[test]
    fn retry_exhausted_propagates_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let probe = TestSubscriber::new();
        flaky(usize::MAX, attempts.clone()).retry(1).subscribe(probe.clone());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(probe.error().map(|e| e.kind()), Some(ErrorKind::Upstream));
    }

    #[test]
    fn illegal_demand_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let probe = TestSubscriber::with_request(0);
        flaky(0, attempts.clone()).retry(5).subscribe(probe.clone());
        probe.request(-1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(probe.error(), Some(FluxError::IllegalDemand(-1))));
    }

    #[test]
    fn continue_without_cooperating_stage_is_transparent() {
        let probe = TestSubscriber::new();
        Flux::from_iter(vec![1, 2, 0, 5])
            .map(|x| x * 2)
            .on_error_continue(|_, _| ())
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![2, 4, 0, 10]);
        assert!(probe.is_complete());
    }
}
