//! Cold sources.
//!
//! Synchronous sources are pulled: each unit of demand pulls one item from
//! a per-subscription [`Pull`] state on whichever thread currently owns the
//! drain loop. Timed sources push into an [`Outlet`] from a scheduler
//! worker.

use std::iter::Peekable;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::demand::{check_request, Demand, Wip};
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::scheduler::{Scheduler, Worker};
use crate::subscriber::{fail_now, BoxSubscriber, NoopSubscription, Subscription};

/// How a pulled source ended.
type End = Result<(), FluxError>;

enum Pulled<T> {
    Item(T),
    End(End),
}

/// Per-subscription state of a synchronous source.
trait Pull<T>: Send + 'static {
    fn pull(&mut self) -> Pulled<T>;

    /// Whether the source is known to be finished without pulling again.
    fn peek_end(&mut self) -> Option<End>;
}

struct IterPull<I: Iterator>(Peekable<I>);

impl<I> Pull<I::Item> for IterPull<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send,
{
    fn pull(&mut self) -> Pulled<I::Item> {
        match self.0.next() {
            Some(item) => Pulled::Item(item),
            None => Pulled::End(Ok(())),
        }
    }

    fn peek_end(&mut self) -> Option<End> {
        match self.0.peek() {
            Some(_) => None,
            None => Some(Ok(())),
        }
    }
}

struct Active<T, P> {
    subscriber: BoxSubscriber<T>,
    source: P,
}

/// Subscription of a pulled source.
struct PullSubscription<T, P> {
    active: Mutex<Option<Active<T, P>>>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    illegal: Mutex<Option<FluxError>>,
}

impl<T: Send + 'static, P: Pull<T>> PullSubscription<T, P> {
    fn start(mut subscriber: BoxSubscriber<T>, source: P) {
        let subscription = Arc::new(PullSubscription {
            active: Mutex::new(None),
            demand: Demand::new(),
            wip: Wip::owned(),
            cancelled: AtomicBool::new(false),
            illegal: Mutex::new(None),
        });
        subscriber.on_subscribe(subscription.clone());
        *subscription.active.lock() = Some(Active { subscriber, source });
        subscription.drain_loop();
    }

    fn drain(&self) {
        if self.wip.enter() {
            self.drain_loop();
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            self.emit();
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn emit(&self) {
        let mut guard = self.active.lock();
        let release = match guard.as_mut() {
            Some(active) => self.emit_into(active),
            None => false,
        };
        if release {
            *guard = None;
        }
    }

    fn emit_into(&self, active: &mut Active<T, P>) -> bool {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return true;
            }
            let illegal = self.illegal.lock().take();
            if let Some(error) = illegal {
                active.subscriber.on_error(error);
                return true;
            }
            if let Some(end) = active.source.peek_end() {
                finish(&mut active.subscriber, end);
                return true;
            }
            if self.demand.get() == 0 {
                return false;
            }
            match active.source.pull() {
                Pulled::Item(item) => {
                    self.demand.produced(1);
                    active.subscriber.on_next(item);
                }
                Pulled::End(end) => {
                    finish(&mut active.subscriber, end);
                    return true;
                }
            }
        }
    }
}

fn finish<T: 'static>(subscriber: &mut BoxSubscriber<T>, end: End) {
    match end {
        Ok(()) => subscriber.on_complete(),
        Err(error) => subscriber.on_error(error),
    }
}

impl<T: Send + 'static, P: Pull<T>> Subscription for PullSubscription<T, P> {
    fn request(&self, n: i64) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        match check_request(n) {
            Ok(Some(n)) => {
                self.demand.add(n);
            }
            Ok(None) => return,
            Err(error) => *self.illegal.lock() = Some(error),
        }
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

struct FromIter<I> {
    items: I,
}

impl<I> Publisher<I::Item> for FromIter<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<I::Item>) {
        let iter = self.items.clone().into_iter().peekable();
        PullSubscription::start(subscriber, IterPull(iter));
    }
}

/// The sink handed to a `generate` callback.
///
/// Each call may emit at most one item and may end the stream.
pub struct SyncSink<T> {
    item: Option<T>,
    end: Option<End>,
}

impl<T> SyncSink<T> {
    /// Emit the item of this round.
    pub fn next(&mut self, item: T) {
        if self.item.is_some() {
            self.end = Some(Err(FluxError::IllegalState(
                "generator emitted more than one item in a round",
            )));
            return;
        }
        self.item = Some(item);
    }

    /// End the stream normally.
    pub fn complete(&mut self) {
        if self.end.is_none() {
            self.end = Some(Ok(()));
        }
    }

    /// End the stream with `error`.
    pub fn error(&mut self, error: FluxError) {
        if self.end.is_none() {
            self.end = Some(Err(error));
        }
    }
}

struct GeneratePull<T, S, G> {
    state: Option<S>,
    generator: Arc<G>,
    pending: Option<End>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S, G> Pull<T> for GeneratePull<T, S, G>
where
    T: Send + 'static,
    S: Send + 'static,
    G: Fn(S, &mut SyncSink<T>) -> Result<S, FluxError> + Send + Sync + 'static,
{
    fn pull(&mut self) -> Pulled<T> {
        let state = match self.state.take() {
            Some(state) => state,
            None => return Pulled::End(Ok(())),
        };
        let mut sink = SyncSink {
            item: None,
            end: None,
        };
        match (self.generator)(state, &mut sink) {
            Ok(next) => self.state = Some(next),
            Err(error) => return Pulled::End(Err(error)),
        }
        match (sink.item, sink.end) {
            (Some(item), end) => {
                self.pending = end;
                Pulled::Item(item)
            }
            (None, Some(end)) => Pulled::End(end),
            (None, None) => Pulled::End(Err(FluxError::IllegalState(
                "generator returned without emitting a signal",
            ))),
        }
    }

    fn peek_end(&mut self) -> Option<End> {
        self.pending.take()
    }
}

struct Generate<S, I, G> {
    init: I,
    generator: Arc<G>,
    _marker: PhantomData<fn() -> S>,
}

impl<T, S, I, G> Publisher<T> for Generate<S, I, G>
where
    T: Send + 'static,
    S: Send + 'static,
    I: Fn() -> S + Send + Sync + 'static,
    G: Fn(S, &mut SyncSink<T>) -> Result<S, FluxError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        PullSubscription::start(
            subscriber,
            GeneratePull {
                state: Some((self.init)()),
                generator: self.generator.clone(),
                pending: None,
                _marker: PhantomData,
            },
        );
    }
}

struct Empty;

impl<T: Send + 'static> Publisher<T> for Empty {
    fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
        subscriber.on_subscribe(Arc::new(NoopSubscription));
        subscriber.on_complete();
    }
}

struct Never;

impl<T: Send + 'static> Publisher<T> for Never {
    fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
        subscriber.on_subscribe(Arc::new(NoopSubscription));
    }
}

struct Error(FluxError);

impl<T: Send + 'static> Publisher<T> for Error {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        fail_now(subscriber, self.0.clone());
    }
}

struct Defer<F>(F);

impl<T, F> Publisher<T> for Defer<F>
where
    T: Send + 'static,
    F: Fn() -> Flux<T> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        (self.0)().subscribe_boxed(subscriber);
    }
}

struct Interval {
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl Interval {
    fn tick(outlet: Arc<Outlet<u64>>, worker: Arc<dyn Worker>, period: Duration, n: u64) {
        if outlet.is_cancelled() {
            return;
        }
        if outlet.requested() <= outlet.queued() as i64 {
            tracing::debug!(tick = n, "interval tick without demand");
            outlet.error(FluxError::Overflow("could not emit tick due to lack of requests"));
            worker.dispose();
            return;
        }
        outlet.push(n);
        let next = worker.clone();
        worker.schedule(
            Box::new(move || Interval::tick(outlet, next, period, n + 1)),
            period,
        );
    }
}

impl Publisher<u64> for Interval {
    fn subscribe(&self, subscriber: BoxSubscriber<u64>) {
        let outlet = Outlet::new(false);
        let worker = self.scheduler.create_worker();
        let disposer = worker.clone();
        outlet.set_on_cancel(move || disposer.dispose());
        outlet.attach(subscriber);
        let period = self.period;
        let next = worker.clone();
        worker.schedule(
            Box::new(move || Interval::tick(outlet, next, period, 0)),
            period,
        );
    }
}

/// Emits one value after a delay.
struct Delay<F> {
    make: F,
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T, F> Publisher<T> for Delay<F>
where
    T: Send + 'static,
    F: Fn() -> Option<T> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let value = match (self.make)() {
            Some(value) => value,
            None => {
                fail_now(
                    subscriber,
                    FluxError::IllegalState("single-use delayed value subscribed twice"),
                );
                return;
            }
        };
        let outlet = Outlet::new(false);
        let worker = self.scheduler.create_worker();
        let disposer = worker.clone();
        outlet.set_on_cancel(move || disposer.dispose());
        outlet.attach(subscriber);
        let fire = outlet.clone();
        worker.schedule(
            Box::new(move || {
                fire.push(value);
                fire.complete();
            }),
            self.delay,
        );
    }
}

impl<T: Send + 'static> Flux<T> {
    /// A stream of one value.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// assert_eq!(Flux::just("hi").block_last().unwrap(), Some("hi"));
    /// ```
    pub fn just(value: T) -> Flux<T>
    where
        T: Clone + Sync,
    {
        Flux::from_iter(std::iter::once(value))
    }

    /// A stream of the items of a collection, replayed for every subscriber.
    pub fn from_iter<I>(items: I) -> Flux<T>
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Flux::from_publisher(FromIter { items })
    }

    /// Completes right away.
    pub fn empty() -> Flux<T> {
        Flux::from_publisher(Empty)
    }

    /// Fails right away with `error`.
    pub fn error(error: FluxError) -> Flux<T> {
        Flux::from_publisher(Error(error))
    }

    /// Never signals anything after `on_subscribe`.
    pub fn never() -> Flux<T> {
        Flux::from_publisher(Never)
    }

    /// Build the stream lazily, once per subscriber.
    pub fn defer<F>(factory: F) -> Flux<T>
    where
        F: Fn() -> Flux<T> + Send + Sync + 'static,
    {
        Flux::from_publisher(Defer(factory))
    }

    /// A synchronous, stateful generator.
    ///
    /// `generator` is called once per requested item with the current state
    /// and returns the next state. In each call it must emit exactly one
    /// item through the sink, end the stream, or both (item first). An
    /// `Err` return ends the stream with that error.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let fib = Flux::generate(
    ///     || (0u64, 1u64),
    ///     |(a, b), sink| {
    ///         sink.next(a);
    ///         if a > 10 {
    ///             sink.complete();
    ///         }
    ///         Ok((b, a + b))
    ///     },
    /// );
    /// let all = fib.collect_list().block_last().unwrap();
    /// assert_eq!(all, Some(vec![0, 1, 1, 2, 3, 5, 8, 13]));
    /// ```
    pub fn generate<S, I, G>(init: I, generator: G) -> Flux<T>
    where
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        G: Fn(S, &mut SyncSink<T>) -> Result<S, FluxError> + Send + Sync + 'static,
    {
        Flux::from_publisher(Generate {
            init,
            generator: Arc::new(generator),
            _marker: PhantomData,
        })
    }

    /// `value` after `delay` on a worker of `scheduler`. Only one subscriber
    /// can ever receive the value.
    pub(crate) fn delayed<S: Scheduler>(value: T, delay: Duration, scheduler: S) -> Flux<T> {
        let slot = Mutex::new(Some(value));
        Flux::from_publisher(Delay {
            make: move || slot.lock().take(),
            delay,
            scheduler: Arc::new(scheduler),
        })
    }
}

impl Flux<i32> {
    /// `count` consecutive integers starting at `start`.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let v = Flux::range(5, 3).collect_list().block_last().unwrap();
    /// assert_eq!(v, Some(vec![5, 6, 7]));
    /// ```
    pub fn range(start: i32, count: usize) -> Flux<i32> {
        Flux::from_iter((0..count).map(move |i| start.wrapping_add(i as i32)))
    }
}

impl Flux<u64> {
    /// Emits `0, 1, 2, ...`, one value per `period`, starting one period
    /// after subscription. A tick that finds no outstanding demand fails the
    /// stream with an overflow error.
    pub fn interval<S: Scheduler>(period: Duration, scheduler: S) -> Flux<u64> {
        Flux::from_publisher(Interval {
            period,
            scheduler: Arc::new(scheduler),
        })
    }

    /// Emits `0` after `delay`, then completes.
    pub fn timer<S: Scheduler>(delay: Duration, scheduler: S) -> Flux<u64> {
        Flux::from_publisher(Delay {
            make: || Some(0),
            delay,
            scheduler: Arc::new(scheduler),
        })
    }
}
