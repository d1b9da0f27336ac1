//! One-to-one and filtering stages.

use std::any::Any;
use std::sync::Arc;

use crate::error::FluxError;
use crate::flux::{ContinueHook, Flux};
use crate::subscriber::{BoxSubscriber, Subscriber, SubscriptionRef};

struct MapSubscriber<U, F> {
    downstream: BoxSubscriber<U>,
    f: Arc<F>,
}

impl<T, U, F> Subscriber<T> for MapSubscriber<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.downstream.on_next((self.f)(item));
    }

    fn on_error(&mut self, error: FluxError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

struct FilterSubscriber<T, P> {
    downstream: BoxSubscriber<T>,
    predicate: Arc<P>,
    upstream: Option<SubscriptionRef>,
}

impl<T, P> Subscriber<T> for FilterSubscriber<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if (self.predicate)(&item) {
            self.downstream.on_next(item);
        } else if let Some(upstream) = &self.upstream {
            upstream.request(1);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

struct FilterMapSubscriber<U, F> {
    downstream: BoxSubscriber<U>,
    f: Arc<F>,
    upstream: Option<SubscriptionRef>,
}

impl<T, U, F> Subscriber<T> for FilterMapSubscriber<U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Option<U> + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        match (self.f)(item) {
            Some(mapped) => self.downstream.on_next(mapped),
            None => {
                if let Some(upstream) = &self.upstream {
                    upstream.request(1);
                }
            }
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

/// What a fallible stage does with the result for one element.
enum Outcome<U> {
    Emit(U),
    Skip,
    Fail(FluxError),
}

/// Shared behaviour of `try_map` and `try_filter`: a failing element either
/// ends the stream or, with a continue hook, is reported and replaced by a
/// fresh request upstream.
struct TrySubscriber<U, F> {
    downstream: BoxSubscriber<U>,
    step: Arc<F>,
    hook: Option<ContinueHook>,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<U: Send + 'static, F> TrySubscriber<U, F> {
    fn handle(&mut self, outcome: Outcome<U>) {
        match outcome {
            Outcome::Emit(item) => self.downstream.on_next(item),
            Outcome::Skip => self.request_one(),
            Outcome::Fail(error) => {
                self.done = true;
                if let Some(upstream) = self.upstream.take() {
                    upstream.cancel();
                }
                self.downstream.on_error(error);
            }
        }
    }

    fn request_one(&self) {
        if let Some(upstream) = &self.upstream {
            upstream.request(1);
        }
    }
}

macro_rules! try_stage_signals {
    () => {
        fn on_subscribe(&mut self, subscription: SubscriptionRef) {
            self.upstream = Some(subscription.clone());
            self.downstream.on_subscribe(subscription);
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
    };
}

struct TryMap<F>(F);
struct TryFilter<P>(P);

impl<T, U, F> Subscriber<T> for TrySubscriber<U, TryMap<F>>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FluxError> + Send + Sync + 'static,
{
    try_stage_signals!();

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        let kept = self.hook.as_ref().map(|_| item.clone());
        let outcome = match ((self.step.0)(item), &self.hook, kept) {
            (Ok(mapped), _, _) => Outcome::Emit(mapped),
            (Err(error), Some(hook), Some(item)) => {
                tracing::debug!(error = %error, "skipping failed element");
                hook(&error, &item as &dyn Any);
                Outcome::Skip
            }
            (Err(error), _, _) => Outcome::Fail(error),
        };
        self.handle(outcome);
    }
}

impl<T, P> Subscriber<T> for TrySubscriber<T, TryFilter<P>>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FluxError> + Send + Sync + 'static,
{
    try_stage_signals!();

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        let outcome = match ((self.step.0)(&item), &self.hook) {
            (Ok(true), _) => Outcome::Emit(item),
            (Ok(false), _) => Outcome::Skip,
            (Err(error), Some(hook)) => {
                tracing::debug!(error = %error, "skipping failed element");
                hook(&error, &item as &dyn Any);
                Outcome::Skip
            }
            (Err(error), None) => Outcome::Fail(error),
        };
        self.handle(outcome);
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Transform every item with `f`.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let lengths = Flux::from_iter(vec!["a", "bcd"]).map(str::len);
    /// assert_eq!(lengths.collect_list().block_last().unwrap(), Some(vec![1, 3]));
    /// ```
    pub fn map<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.stage(false, move |upstream, _| {
            let f = f.clone();
            upstream.lift(move |downstream| {
                Box::new(MapSubscriber {
                    downstream,
                    f: f.clone(),
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Keep only items matching `predicate`. Every dropped item is replaced
    /// by a request for one more from upstream.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let even = Flux::range(1, 6).filter(|x| x % 2 == 0);
    /// assert_eq!(even.collect_list().block_last().unwrap(), Some(vec![2, 4, 6]));
    /// ```
    pub fn filter<P>(&self, predicate: P) -> Flux<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.stage(false, move |upstream, _| {
            let predicate = predicate.clone();
            upstream.lift(move |downstream| {
                Box::new(FilterSubscriber {
                    downstream,
                    predicate: predicate.clone(),
                    upstream: None,
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Map and filter in one step: `None` drops the item and asks upstream
    /// for another.
    pub fn filter_map<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.stage(false, move |upstream, _| {
            let f = f.clone();
            upstream.lift(move |downstream| {
                Box::new(FilterMapSubscriber {
                    downstream,
                    f: f.clone(),
                    upstream: None,
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Fallible `map`. An `Err` fails the stream, unless the chain is
    /// wrapped by [`on_error_continue`](Flux::on_error_continue), in which
    /// case the element is reported to its hook and skipped.
    ///
    /// ```
    /// use rivulet::{Flux, FluxError};
    ///
    /// let quotients = Flux::from_iter(vec![1, 2, 0, 5])
    ///     .try_map(|x| 100i32.checked_div(x).ok_or_else(|| FluxError::msg("/ by zero")));
    /// let mut items = quotients.into_blocking_iter();
    /// assert_eq!(items.next().unwrap().unwrap(), 100);
    /// assert_eq!(items.next().unwrap().unwrap(), 50);
    /// assert!(items.next().unwrap().is_err());
    /// ```
    pub fn try_map<U, F>(&self, f: F) -> Flux<U>
    where
        T: Clone,
        U: Send + 'static,
        F: Fn(T) -> Result<U, FluxError> + Send + Sync + 'static,
    {
        let step = Arc::new(TryMap(f));
        self.stage(true, move |upstream, hook| {
            let step = step.clone();
            upstream.lift(move |downstream| {
                Box::new(TrySubscriber {
                    downstream,
                    step: step.clone(),
                    hook: hook.clone(),
                    upstream: None,
                    done: false,
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Fallible `filter`, see [`try_map`](Flux::try_map) for how errors are
    /// handled.
    pub fn try_filter<P>(&self, predicate: P) -> Flux<T>
    where
        P: Fn(&T) -> Result<bool, FluxError> + Send + Sync + 'static,
    {
        let step = Arc::new(TryFilter(predicate));
        self.stage(true, move |upstream, hook| {
            let step = step.clone();
            upstream.lift(move |downstream| {
                Box::new(TrySubscriber {
                    downstream,
                    step: step.clone(),
                    hook: hook.clone(),
                    upstream: None,
                    done: false,
                }) as BoxSubscriber<T>
            })
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::TestSubscriber;

    fn divide(x: i32) -> Result<i32, FluxError> {
        100i32
            .checked_div(x)
            .ok_or_else(|| FluxError::msg("attempt to divide by zero"))
    }

    #[test]
    fn map_forwards_demand() {
        let probe = TestSubscriber::with_request(2);
        Flux::range(1, 5).map(|x| x * 10).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![10, 20]);
        probe.request(10);
        assert_eq!(probe.values(), vec![10, 20, 30, 40, 50]);
        assert!(probe.is_complete());
    }

    #[test]
    fn filter_replenishes_dropped_items() {
        let probe = TestSubscriber::with_request(2);
        Flux::range(1, 100).filter(|x| x % 10 == 0).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![10, 20]);
        assert!(!probe.over_delivered());
    }

    #[test]
    fn filter_map_replenishes_dropped_items() {
        let probe = TestSubscriber::with_request(3);
        Flux::from_iter(vec!["1", "x", "2", "y", "3", "4"])
            .filter_map(|s| s.parse::<i32>().ok())
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(!probe.is_terminated());
        probe.request(1);
        assert_eq!(probe.values(), vec![1, 2, 3, 4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn try_map_fails_on_error() {
        let probe = TestSubscriber::new();
        Flux::from_iter(vec![1, 2, 0, 5]).try_map(divide).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![100, 50]);
        assert_eq!(
            probe.error().map(|e| e.to_string()),
            Some("attempt to divide by zero".to_string())
        );
    }

    #[test]
    fn try_map_continues_with_hook() {
        let skipped = Arc::new(Mutex::new(Vec::new()));
        let log = skipped.clone();
        let probe = TestSubscriber::new();
        Flux::from_iter(vec![1, 2, 0, 5])
            .try_map(divide)
            .on_error_continue(move |_, item| {
                if let Some(x) = item.downcast_ref::<i32>() {
                    log.lock().unwrap().push(*x);
                }
            })
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![100, 50, 20]);
        assert!(probe.is_complete());
        assert_eq!(*skipped.lock().unwrap(), vec![0]);
    }

    #[test]
    fn continue_crosses_stateless_stages() {
        let probe = TestSubscriber::new();
        Flux::from_iter(vec![4, 0, 2])
            .try_filter(|x| if *x == 0 { Err(FluxError::msg("zero")) } else { Ok(true) })
            .map(|x| x + 1)
            .filter(|x| *x > 0)
            .on_error_continue(|_, _| ())
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![5, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn continue_is_transparent_elsewhere() {
        let probe = TestSubscriber::new();
        Flux::range(1, 2)
            .concat_with(Flux::error(FluxError::msg("late")))
            .on_error_continue(|_, _| ())
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.error().is_some());
    }
}
