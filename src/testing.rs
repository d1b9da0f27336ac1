//! Test harness for streams.
//!
//! [`TestSubscriber`] records every signal it receives and counts demand, so
//! that hand-written tests can inspect a stream step by step.
//! [`StepVerifier`] drives a `TestSubscriber` through a script of
//! expectations, optionally against a [`VirtualTimeScheduler`] so that
//! delays and timeouts are checked without waiting for them.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use rivulet::Flux;
//! use rivulet::testing::StepVerifier;
//!
//! StepVerifier::with_virtual_time(|vts| Flux::interval(Duration::from_secs(1), vts).take(2))
//!     .expect_subscription()
//!     .expect_no_event(Duration::from_secs(1))
//!     .expect_next(0)
//!     .expect_no_event(Duration::from_secs(1))
//!     .expect_next(1)
//!     .expect_complete()
//!     .verify()
//!     .unwrap();
//! ```

use std::fmt::Debug;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config;
use crate::demand::UNBOUNDED;
use crate::error::{ErrorKind, FluxError};
use crate::flux::Flux;
use crate::scheduler::VirtualTimeScheduler;
use crate::signal::Signal;
use crate::subscriber::{Subscriber, SubscriptionRef};

/// Failure of a [`StepVerifier`] script.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A signal other than the expected one arrived.
    #[error("step {step}: expected {expected}, got {actual}")]
    #[allow(missing_docs)]
    Mismatch {
        step: usize,
        expected: String,
        actual: String,
    },

    /// The expected signal did not arrive before the wall-clock bound.
    #[error("step {step}: no {expected} within {bound:?}")]
    #[allow(missing_docs)]
    Timeout {
        step: usize,
        expected: String,
        bound: Duration,
    },

    /// More items were delivered than requested.
    #[error("{delivered} items delivered for {requested} requested")]
    #[allow(missing_docs)]
    OverDelivery { requested: i64, delivered: i64 },

    /// Signals arrived after the terminal one.
    #[error("{0} signal(s) after the terminal signal")]
    AfterTerminal(usize),

    /// A signal arrived during a quiet period.
    #[error("step {step}: expected no event for {duration:?}, got {actual}")]
    #[allow(missing_docs)]
    UnexpectedEvent {
        step: usize,
        duration: Duration,
        actual: String,
    },
}

impl VerifyError {
    /// Stable snake_case label, for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            VerifyError::Mismatch { .. } => "verify_mismatch",
            VerifyError::Timeout { .. } => "verify_timeout",
            VerifyError::OverDelivery { .. } => "verify_over_delivery",
            VerifyError::AfterTerminal(_) => "verify_after_terminal",
            VerifyError::UnexpectedEvent { .. } => "verify_unexpected_event",
        }
    }
}

fn describe<T: Debug>(signal: &Signal<T>) -> String {
    match signal {
        Signal::Next(item) => format!("next({:?})", item),
        Signal::Error(error) => format!("error({})", error),
        Signal::Complete => "complete".to_string(),
    }
}

type Hook<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Record<T> {
    signals: Vec<Signal<T>>,
    subscribed: bool,
    terminated: bool,
    requested: i64,
    delivered: i64,
    /// First violation seen, as `(requested, delivered)`.
    over: Option<(i64, i64)>,
    late: usize,
}

#[derive(Default)]
struct Upstream {
    subscription: Option<SubscriptionRef>,
    pending: Vec<i64>,
    cancelled: bool,
}

struct Shared<T> {
    record: Mutex<Record<T>>,
    changed: Condvar,
    upstream: Mutex<Upstream>,
    hook: Mutex<Option<Hook<T>>>,
}

/// A subscriber that records what it receives.
///
/// Clones share one recording, so a test keeps a clone and hands another
/// to `subscribe`. Requests made before the subscription arrives are held
/// back and forwarded once it does.
pub struct TestSubscriber<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TestSubscriber<T> {
    fn clone(&self) -> Self {
        TestSubscriber {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Default for TestSubscriber<T> {
    fn default() -> Self {
        TestSubscriber::new()
    }
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// A subscriber that requests everything on subscription.
    pub fn new() -> TestSubscriber<T> {
        TestSubscriber::with_request(UNBOUNDED)
    }

    /// A subscriber that requests `n` items on subscription.
    pub fn with_request(n: i64) -> TestSubscriber<T> {
        let mut upstream = Upstream::default();
        if n != 0 {
            upstream.pending.push(n);
        }
        TestSubscriber {
            shared: Arc::new(Shared {
                record: Mutex::new(Record {
                    signals: Vec::new(),
                    subscribed: false,
                    terminated: false,
                    requested: n.max(0),
                    delivered: 0,
                    over: None,
                    late: 0,
                }),
                changed: Condvar::new(),
                upstream: Mutex::new(upstream),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` on every item before it is recorded. The hook may call
    /// back into this subscriber, e.g. to cancel.
    pub fn on_each<F>(&self, hook: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        *self.shared.hook.lock() = Some(Arc::new(hook));
    }

    /// Request `n` more items.
    pub fn request(&self, n: i64) {
        if n > 0 {
            let mut record = self.shared.record.lock();
            record.requested = record.requested.saturating_add(n);
        }
        let subscription = {
            let mut upstream = self.shared.upstream.lock();
            if upstream.subscription.is_none() {
                upstream.pending.push(n);
            }
            upstream.subscription.clone()
        };
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    /// Cancel the subscription, now or as soon as it arrives.
    pub fn cancel(&self) {
        let subscription = {
            let mut upstream = self.shared.upstream.lock();
            upstream.cancelled = true;
            upstream.subscription.clone()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.upstream.lock().cancelled
    }

    /// Whether `on_subscribe` was received.
    pub fn is_subscribed(&self) -> bool {
        self.shared.record.lock().subscribed
    }

    /// The items received so far.
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.shared
            .record
            .lock()
            .signals
            .iter()
            .filter_map(|signal| match signal {
                Signal::Next(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every signal received so far, in order.
    pub fn signals(&self) -> Vec<Signal<T>>
    where
        T: Clone,
    {
        self.shared.record.lock().signals.clone()
    }

    /// The error the stream ended with, if any.
    pub fn error(&self) -> Option<FluxError> {
        self.shared
            .record
            .lock()
            .signals
            .iter()
            .find_map(|signal| match signal {
                Signal::Error(error) => Some(error.clone()),
                _ => None,
            })
    }

    /// Whether the stream completed normally.
    pub fn is_complete(&self) -> bool {
        matches!(self.shared.record.lock().signals.last(), Some(Signal::Complete))
    }

    /// Whether a terminal signal was received.
    pub fn is_terminated(&self) -> bool {
        self.shared.record.lock().terminated
    }

    /// Total amount requested so far, saturating at `UNBOUNDED`.
    pub fn requested(&self) -> i64 {
        self.shared.record.lock().requested
    }

    /// Whether an item ever arrived beyond the requested amount.
    pub fn over_delivered(&self) -> bool {
        self.shared.record.lock().over.is_some()
    }

    /// Block until a terminal signal arrives. False on timeout.
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout, |record| record.terminated)
    }

    /// Block until `n` items were received or the stream terminated.
    /// False on timeout.
    pub fn await_count(&self, n: usize, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout, |record| {
            record.terminated || record.delivered >= n as i64
        })
    }

    /// Check the demand contract and the single terminal signal.
    pub fn verify_contract(&self) -> Result<(), VerifyError> {
        let record = self.shared.record.lock();
        if let Some((requested, delivered)) = record.over {
            return Err(VerifyError::OverDelivery {
                requested,
                delivered,
            });
        }
        if record.late > 0 {
            return Err(VerifyError::AfterTerminal(record.late));
        }
        Ok(())
    }

    fn wait_until<P>(&self, deadline: Instant, done: P) -> bool
    where
        P: Fn(&Record<T>) -> bool,
    {
        let mut record = self.shared.record.lock();
        while !done(&record) {
            if self.shared.changed.wait_until(&mut record, deadline).timed_out() {
                return done(&record);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.shared.record.lock().signals.len()
    }

    fn inspect<R, F>(&self, index: usize, f: F) -> Option<R>
    where
        F: FnOnce(&Signal<T>) -> R,
    {
        self.shared.record.lock().signals.get(index).map(f)
    }

    fn record(&self, signal: Signal<T>) {
        {
            let mut record = self.shared.record.lock();
            if record.terminated {
                record.late += 1;
                return;
            }
            match &signal {
                Signal::Next(_) => {
                    record.delivered += 1;
                    if record.delivered > record.requested && record.over.is_none() {
                        record.over = Some((record.requested, record.delivered));
                    }
                }
                _ => record.terminated = true,
            }
            record.signals.push(signal);
        }
        self.shared.changed.notify_all();
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let (pending, cancelled) = {
            let mut upstream = self.shared.upstream.lock();
            if upstream.subscription.is_some() {
                drop(upstream);
                subscription.cancel();
                return;
            }
            upstream.subscription = Some(subscription.clone());
            (mem::take(&mut upstream.pending), upstream.cancelled)
        };
        self.shared.record.lock().subscribed = true;
        self.shared.changed.notify_all();
        if cancelled {
            subscription.cancel();
            return;
        }
        for n in pending {
            subscription.request(n);
        }
    }

    fn on_next(&mut self, item: T) {
        let hook = self.shared.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&item);
        }
        self.record(Signal::Next(item));
    }

    fn on_error(&mut self, error: FluxError) {
        self.record(Signal::Error(error));
    }

    fn on_complete(&mut self) {
        self.record(Signal::Complete);
    }
}

type Matcher<A> = Box<dyn Fn(&A) -> bool>;

enum Step<T> {
    Subscription,
    Next { expected: String, matches: Matcher<T> },
    NextCount(usize),
    NoEvent(Duration),
    Await(Duration),
    Request(i64),
    Then(Box<dyn FnOnce()>),
    Cancel,
    Complete,
    Error { expected: String, matches: Matcher<FluxError> },
}

/// A script of expectations run against one subscription.
///
/// Steps run in order when [`verify`](Self::verify) is called. Waiting for
/// a signal is bounded by a wall-clock limit for the whole script; with
/// [`with_virtual_time`](Self::with_virtual_time), quiet periods and
/// [`then_await`](Self::then_await) advance the virtual clock instead of
/// sleeping.
///
/// Every verification also fails when more items arrive than were
/// requested, or when any signal follows the terminal one.
pub struct StepVerifier<T> {
    source: Flux<T>,
    vts: Option<VirtualTimeScheduler>,
    initial: i64,
    steps: Vec<Step<T>>,
}

impl<T: Debug + Send + 'static> StepVerifier<T> {
    /// Verify `source` in real time.
    pub fn create(source: Flux<T>) -> StepVerifier<T> {
        StepVerifier {
            source,
            vts: None,
            initial: UNBOUNDED,
            steps: Vec::new(),
        }
    }

    /// Verify the stream built by `build` against a fresh virtual clock.
    pub fn with_virtual_time<F>(build: F) -> StepVerifier<T>
    where
        F: FnOnce(VirtualTimeScheduler) -> Flux<T>,
    {
        let vts = VirtualTimeScheduler::new();
        StepVerifier {
            source: build(vts.clone()),
            vts: Some(vts),
            initial: UNBOUNDED,
            steps: Vec::new(),
        }
    }

    /// Request `n` items on subscription instead of everything.
    pub fn with_initial_request(mut self, n: i64) -> Self {
        self.initial = n;
        self
    }

    /// The virtual clock, if any.
    pub fn virtual_time(&self) -> Option<&VirtualTimeScheduler> {
        self.vts.as_ref()
    }

    fn push(mut self, step: Step<T>) -> Self {
        self.steps.push(step);
        self
    }

    /// Expect `on_subscribe`.
    pub fn expect_subscription(self) -> Self {
        self.push(Step::Subscription)
    }

    /// Expect the next signal to be `item`.
    pub fn expect_next(self, item: T) -> Self
    where
        T: PartialEq,
    {
        let expected = format!("next({:?})", item);
        self.push(Step::Next {
            expected,
            matches: Box::new(move |actual| *actual == item),
        })
    }

    /// Expect the next signals to be `items`, in order.
    pub fn expect_next_values<I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: PartialEq,
    {
        items.into_iter().fold(self, |verifier, item| verifier.expect_next(item))
    }

    /// Expect `n` items, whatever their values.
    pub fn expect_next_count(self, n: usize) -> Self {
        self.push(Step::NextCount(n))
    }

    /// Expect an item accepted by `predicate`.
    pub fn expect_next_matches<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + 'static,
    {
        self.push(Step::Next {
            expected: "next matching predicate".to_string(),
            matches: Box::new(predicate),
        })
    }

    /// Expect silence for `duration`. A signal arriving exactly at the end
    /// of the period is left for the following step.
    pub fn expect_no_event(self, duration: Duration) -> Self {
        self.push(Step::NoEvent(duration))
    }

    /// Let `duration` pass without expecting anything.
    pub fn then_await(self, duration: Duration) -> Self {
        self.push(Step::Await(duration))
    }

    /// Request `n` more items.
    pub fn then_request(self, n: i64) -> Self {
        self.push(Step::Request(n))
    }

    /// Run an arbitrary action, e.g. push into a sink.
    pub fn then<F: FnOnce() + 'static>(self, action: F) -> Self {
        self.push(Step::Then(Box::new(action)))
    }

    /// Cancel the subscription. Later steps still run.
    pub fn then_cancel(self) -> Self {
        self.push(Step::Cancel)
    }

    /// Expect normal completion.
    pub fn expect_complete(self) -> Self {
        self.push(Step::Complete)
    }

    /// Expect an error of any kind.
    pub fn expect_error(self) -> Self {
        self.push(Step::Error {
            expected: "error".to_string(),
            matches: Box::new(|_| true),
        })
    }

    /// Expect an error of the given kind.
    pub fn expect_error_kind(self, kind: ErrorKind) -> Self {
        self.push(Step::Error {
            expected: format!("error of kind {:?}", kind),
            matches: Box::new(move |error| error.kind() == kind),
        })
    }

    /// Expect an error accepted by `predicate`.
    pub fn expect_error_matches<F>(self, predicate: F) -> Self
    where
        F: Fn(&FluxError) -> bool + 'static,
    {
        self.push(Step::Error {
            expected: "error matching predicate".to_string(),
            matches: Box::new(predicate),
        })
    }

    /// Run the script within `Config::verify_timeout`. Returns the
    /// wall-clock time it took.
    pub fn verify(self) -> Result<Duration, VerifyError> {
        let bound = config::global().verify_timeout;
        self.verify_timeout(bound)
    }

    /// Run the script within `bound` of wall-clock time.
    pub fn verify_timeout(self, bound: Duration) -> Result<Duration, VerifyError> {
        let started = Instant::now();
        let probe = TestSubscriber::with_request(self.initial);
        self.source.subscribe(probe.clone());
        let mut run = Run {
            probe: &probe,
            vts: self.vts.as_ref(),
            deadline: started + bound,
            bound,
            cursor: 0,
        };
        let outcome = self
            .steps
            .into_iter()
            .enumerate()
            .try_for_each(|(index, step)| run.step(index, step));
        if !probe.is_terminated() {
            probe.cancel();
        }
        probe.verify_contract()?;
        outcome?;
        let elapsed = started.elapsed();
        tracing::trace!(?elapsed, "verification passed");
        Ok(elapsed)
    }

    /// Expect completion and verify.
    pub fn verify_complete(self) -> Result<Duration, VerifyError> {
        self.expect_complete().verify()
    }
}

struct Run<'a, T> {
    probe: &'a TestSubscriber<T>,
    vts: Option<&'a VirtualTimeScheduler>,
    deadline: Instant,
    bound: Duration,
    /// Index of the next recorded signal to check.
    cursor: usize,
}

const TICK: Duration = Duration::from_nanos(1);

impl<'a, T: Debug + Send + 'static> Run<'a, T> {
    fn step(&mut self, index: usize, step: Step<T>) -> Result<(), VerifyError> {
        match step {
            Step::Subscription => {
                if self.probe.wait_until(self.deadline, |record| record.subscribed) {
                    Ok(())
                } else {
                    Err(self.timeout(index, "subscription"))
                }
            }
            Step::Next { expected, matches } => {
                let verdict = self.take(index, &expected, |signal| match signal {
                    Signal::Next(item) if matches(item) => None,
                    other => Some(describe(other)),
                })?;
                self.judge(index, expected, verdict)
            }
            Step::NextCount(n) => {
                for k in 0..n {
                    let expected = format!("next #{} of {}", k + 1, n);
                    let verdict = self.take(index, &expected, |signal| match signal {
                        Signal::Next(_) => None,
                        other => Some(describe(other)),
                    })?;
                    self.judge(index, expected, verdict)?;
                }
                Ok(())
            }
            Step::NoEvent(duration) => self.quiet(index, duration),
            Step::Await(duration) => {
                match self.vts {
                    Some(vts) => vts.advance_time_by(duration),
                    None => thread::sleep(duration),
                }
                Ok(())
            }
            Step::Request(n) => {
                self.probe.request(n);
                Ok(())
            }
            Step::Then(action) => {
                action();
                Ok(())
            }
            Step::Cancel => {
                self.probe.cancel();
                Ok(())
            }
            Step::Complete => {
                let verdict = self.take(index, "complete", |signal| match signal {
                    Signal::Complete => None,
                    other => Some(describe(other)),
                })?;
                self.judge(index, "complete".to_string(), verdict)
            }
            Step::Error { expected, matches } => {
                let verdict = self.take(index, &expected, |signal| match signal {
                    Signal::Error(error) if matches(error) => None,
                    other => Some(describe(other)),
                })?;
                self.judge(index, expected, verdict)
            }
        }
    }

    /// Wait for the signal at the cursor and inspect it.
    fn take<R, F>(&mut self, index: usize, expected: &str, inspect: F) -> Result<R, VerifyError>
    where
        F: FnOnce(&Signal<T>) -> R,
    {
        let cursor = self.cursor;
        self.probe
            .wait_until(self.deadline, |record| record.signals.len() > cursor);
        let verdict = self
            .probe
            .inspect(cursor, inspect)
            .ok_or_else(|| self.timeout(index, expected))?;
        self.cursor += 1;
        Ok(verdict)
    }

    fn judge(&self, index: usize, expected: String, verdict: Option<String>) -> Result<(), VerifyError> {
        match verdict {
            None => Ok(()),
            Some(actual) => Err(VerifyError::Mismatch {
                step: index,
                expected,
                actual,
            }),
        }
    }

    fn quiet(&mut self, index: usize, duration: Duration) -> Result<(), VerifyError> {
        let seen = self.cursor;
        match self.vts {
            Some(vts) => {
                let before_end = duration.saturating_sub(TICK);
                vts.advance_time_by(before_end);
                if self.probe.len() == seen {
                    vts.advance_time_by(duration - before_end);
                    return Ok(());
                }
            }
            None => {
                let until = Instant::now() + duration;
                if !self.probe.wait_until(until, |record| record.signals.len() > seen) {
                    return Ok(());
                }
            }
        }
        let actual = self
            .probe
            .inspect(seen, |signal| describe(signal))
            .unwrap_or_default();
        Err(VerifyError::UnexpectedEvent {
            step: index,
            duration,
            actual,
        })
    }

    fn timeout(&self, index: usize, expected: &str) -> VerifyError {
        VerifyError::Timeout {
            step: index,
            expected: expected.to_string(),
            bound: self.bound,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_demand_and_items() {
        let probe = TestSubscriber::with_request(2);
        Flux::range(0, 5).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0, 1]);
        assert_eq!(probe.requested(), 2);
        assert!(probe.verify_contract().is_ok());
    }

    #[test]
    fn requests_before_subscription_are_kept() {
        let probe = TestSubscriber::with_request(0);
        probe.request(2);
        Flux::range(0, 5).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![0, 1]);
    }

    #[test]
    fn detects_over_delivery() {
        let probe = TestSubscriber::with_request(1);
        let mut driver = probe.clone();
        driver.on_subscribe(Arc::new(crate::subscriber::NoopSubscription));
        driver.on_next(1);
        driver.on_next(2);
        assert!(probe.over_delivered());
        assert_eq!(
            probe.verify_contract(),
            Err(VerifyError::OverDelivery {
                requested: 1,
                delivered: 2
            })
        );
    }

    #[test]
    fn detects_signal_after_terminal() {
        let probe = TestSubscriber::<i32>::new();
        let mut driver = probe.clone();
        driver.on_subscribe(Arc::new(crate::subscriber::NoopSubscription));
        driver.on_complete();
        driver.on_next(1);
        assert_eq!(probe.values(), Vec::<i32>::new());
        assert_eq!(probe.verify_contract(), Err(VerifyError::AfterTerminal(1)));
    }

    #[test]
    fn script_passes() {
        StepVerifier::create(Flux::range(1, 3))
            .expect_next(1)
            .expect_next_values(vec![2, 3])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn script_reports_mismatch() {
        let outcome = StepVerifier::create(Flux::range(1, 3))
            .expect_next(2)
            .verify();
        assert_eq!(
            outcome,
            Err(VerifyError::Mismatch {
                step: 0,
                expected: "next(2)".into(),
                actual: "next(1)".into()
            })
        );
    }

    #[test]
    fn bounded_demand_script() {
        StepVerifier::create(Flux::range(0, 10))
            .with_initial_request(0)
            .expect_subscription()
            .then_request(3)
            .expect_next_count(3)
            .then_request(UNBOUNDED)
            .expect_next_count(7)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn missing_signal_times_out() {
        let outcome = StepVerifier::create(Flux::<i32>::never())
            .expect_next(1)
            .verify_timeout(Duration::from_millis(20));
        assert!(matches!(outcome, Err(VerifyError::Timeout { step: 0, .. })));
    }

    #[test]
    fn quiet_period_under_virtual_time() {
        let elapsed = StepVerifier::with_virtual_time(|vts| {
            Flux::timer(Duration::from_secs(3600), vts)
        })
        .expect_subscription()
        .expect_no_event(Duration::from_secs(3600))
        .expect_next(0)
        .verify_complete()
        .unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn early_event_is_unexpected() {
        let outcome = StepVerifier::with_virtual_time(|vts| Flux::timer(Duration::from_secs(1), vts))
            .expect_no_event(Duration::from_secs(2))
            .verify();
        assert!(matches!(outcome, Err(VerifyError::UnexpectedEvent { step: 0, .. })));
    }

    #[test]
    fn error_expectations() {
        StepVerifier::create(Flux::<i32>::error(FluxError::Overflow("full")))
            .expect_error_kind(ErrorKind::Overflow)
            .verify()
            .unwrap();
        StepVerifier::create(Flux::<i32>::error(FluxError::msg("boom")))
            .expect_error_matches(|e| e.to_string() == "boom")
            .verify()
            .unwrap();
    }

    #[test]
    fn cancel_ends_script() {
        StepVerifier::create(Flux::range(0, 1000))
            .with_initial_request(1)
            .expect_next(0)
            .then_cancel()
            .verify()
            .unwrap();
    }
}
