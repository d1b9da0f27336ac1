//! Push sources with an overflow policy.
//!
//! [`Flux::create`] hands a producer a [`FluxSink`] it can feed from any
//! thread, at any pace. Whatever arrives beyond downstream demand is handled
//! by an [`OverflowStrategy`]. The `on_backpressure_*` operators apply the
//! same policies to an upstream that is asked for everything at once.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::{Admit, Offer, Outlet};
use crate::subscriber::{BoxSubscriber, Subscriber, SubscriptionRef};

type OverflowHook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// What a bounded buffer does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOverflowStrategy {
    /// Fail the stream with an overflow error once the buffer is drained.
    Error,
    /// Drop the incoming item.
    DropLatest,
    /// Drop the oldest buffered item to make room.
    DropOldest,
}

/// Buffering policy for items produced beyond demand.
///
/// ```
/// use rivulet::{BufferOverflowStrategy, BufferPolicy};
///
/// let policy = BufferPolicy::<u32>::bounded(16)
///     .strategy(BufferOverflowStrategy::DropOldest)
///     .on_overflow(|dropped| eprintln!("dropped {}", dropped));
/// assert_eq!(policy.capacity(), Some(16));
/// ```
pub struct BufferPolicy<T> {
    capacity: Option<usize>,
    on_overflow: Option<OverflowHook<T>>,
    strategy: BufferOverflowStrategy,
}

impl<T> Clone for BufferPolicy<T> {
    fn clone(&self) -> Self {
        BufferPolicy {
            capacity: self.capacity,
            on_overflow: self.on_overflow.clone(),
            strategy: self.strategy,
        }
    }
}

impl<T> fmt::Debug for BufferPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPolicy")
            .field("capacity", &self.capacity)
            .field("on_overflow", &self.on_overflow.is_some())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<T> BufferPolicy<T> {
    /// Buffer without limit.
    pub fn unbounded() -> Self {
        BufferPolicy {
            capacity: None,
            on_overflow: None,
            strategy: BufferOverflowStrategy::Error,
        }
    }

    /// Buffer up to `capacity` items beyond demand, then fail.
    pub fn bounded(capacity: usize) -> Self {
        BufferPolicy {
            capacity: Some(capacity),
            ..BufferPolicy::unbounded()
        }
    }

    /// Called with every item the policy gives up on.
    pub fn on_overflow<F: Fn(T) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_overflow = Some(Arc::new(hook));
        self
    }

    /// What to do once the buffer is full.
    pub fn strategy(mut self, strategy: BufferOverflowStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The configured capacity, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// Policy for items produced while downstream has no outstanding demand.
pub enum OverflowStrategy<T> {
    /// Fail with an overflow error.
    Error,
    /// Discard the item.
    Drop,
    /// Keep only the most recent undelivered item.
    Latest,
    /// Buffer according to the policy.
    Buffer(BufferPolicy<T>),
}

impl<T> Clone for OverflowStrategy<T> {
    fn clone(&self) -> Self {
        match self {
            OverflowStrategy::Error => OverflowStrategy::Error,
            OverflowStrategy::Drop => OverflowStrategy::Drop,
            OverflowStrategy::Latest => OverflowStrategy::Latest,
            OverflowStrategy::Buffer(policy) => OverflowStrategy::Buffer(policy.clone()),
        }
    }
}

impl<T> fmt::Debug for OverflowStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowStrategy::Error => f.write_str("Error"),
            OverflowStrategy::Drop => f.write_str("Drop"),
            OverflowStrategy::Latest => f.write_str("Latest"),
            OverflowStrategy::Buffer(policy) => f.debug_tuple("Buffer").field(policy).finish(),
        }
    }
}

/// Applies an overflow strategy in front of an outlet.
struct Emitter<T> {
    outlet: Arc<Outlet<T>>,
    strategy: OverflowStrategy<T>,
}

impl<T: Send + 'static> Emitter<T> {
    fn emit(&self, item: T) {
        let offer = match &self.strategy {
            OverflowStrategy::Error | OverflowStrategy::Drop => {
                self.outlet.offer_with(item, within_demand)
            }
            OverflowStrategy::Latest => self.outlet.offer_with(item, |queued, requested| {
                if queued as i64 <= requested {
                    Admit::Push
                } else {
                    Admit::ReplaceNewest
                }
            }),
            OverflowStrategy::Buffer(policy) => {
                let capacity = policy.capacity;
                let strategy = policy.strategy;
                self.outlet.offer_with(item, |queued, requested| {
                    match within_demand(queued, requested) {
                        Admit::Push => Admit::Push,
                        _ => {
                            let backlog = queued as i64 - requested;
                            match capacity {
                                Some(capacity) if backlog >= capacity as i64 => match strategy {
                                    BufferOverflowStrategy::DropOldest => Admit::EvictOldest,
                                    _ => Admit::Reject,
                                },
                                _ => Admit::Push,
                            }
                        }
                    }
                })
            }
        };
        match offer {
            Offer::Queued | Offer::Closed => {}
            Offer::Rejected(item) | Offer::Evicted(item) => self.overflowed(item),
        }
    }

    fn overflowed(&self, item: T) {
        match &self.strategy {
            OverflowStrategy::Error => {
                tracing::debug!("push source overflowed");
                self.outlet.error(FluxError::Overflow(
                    "could not emit value due to lack of requests",
                ));
            }
            OverflowStrategy::Drop | OverflowStrategy::Latest => {
                tracing::trace!("dropped item without demand");
            }
            OverflowStrategy::Buffer(policy) => {
                if let Some(hook) = &policy.on_overflow {
                    hook(item);
                }
                if policy.strategy == BufferOverflowStrategy::Error {
                    tracing::debug!(capacity = ?policy.capacity, "buffer overflowed");
                    self.outlet.error(FluxError::Overflow("buffer is full"));
                } else {
                    tracing::trace!(capacity = ?policy.capacity, "buffer dropped an item");
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.outlet.is_cancelled() || self.outlet.is_done()
    }
}

fn within_demand(queued: usize, requested: i64) -> Admit {
    if (queued as i64) < requested {
        Admit::Push
    } else {
        Admit::Reject
    }
}

/// Thread-safe handle through which a `create` producer emits.
///
/// Signals sent after the stream terminated or was cancelled are ignored.
pub struct FluxSink<T> {
    emitter: Arc<Emitter<T>>,
}

impl<T> Clone for FluxSink<T> {
    fn clone(&self) -> Self {
        FluxSink {
            emitter: self.emitter.clone(),
        }
    }
}

impl<T: Send + 'static> FluxSink<T> {
    /// Emit an item, subject to the overflow strategy.
    pub fn next(&self, item: T) {
        self.emitter.emit(item);
    }

    /// Fail the stream.
    pub fn error(&self, error: FluxError) {
        self.emitter.outlet.error(error);
    }

    /// Complete the stream once buffered items are delivered.
    pub fn complete(&self) {
        self.emitter.outlet.complete();
    }

    /// Demand not yet covered by emitted items.
    pub fn requested(&self) -> i64 {
        let requested = self.emitter.outlet.requested();
        if requested == UNBOUNDED {
            return requested;
        }
        (requested - self.emitter.outlet.queued() as i64).max(0)
    }

    /// Whether further signals would be ignored.
    pub fn is_cancelled(&self) -> bool {
        self.emitter.is_closed()
    }

    /// Run `hook` with every downstream request.
    pub fn on_request<F: Fn(i64) + Send + Sync + 'static>(&self, hook: F) {
        self.emitter.outlet.set_on_request(hook);
    }

    /// Run `hook` when downstream cancels.
    pub fn on_cancel<F: FnOnce() + Send + 'static>(&self, hook: F) {
        self.emitter.outlet.set_on_cancel(hook);
    }
}

struct Create<T, P> {
    producer: P,
    strategy: OverflowStrategy<T>,
}

impl<T, P> Publisher<T> for Create<T, P>
where
    T: Send + 'static,
    P: Fn(FluxSink<T>) -> Result<(), FluxError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::new(true);
        outlet.attach(subscriber);
        let sink = FluxSink {
            emitter: Arc::new(Emitter {
                outlet,
                strategy: self.strategy.clone(),
            }),
        };
        if let Err(error) = (self.producer)(sink.clone()) {
            sink.error(error);
        }
    }
}

struct OnBackpressure<T> {
    upstream: Flux<T>,
    strategy: OverflowStrategy<T>,
}

impl<T: Send + 'static> Publisher<T> for OnBackpressure<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::new(true);
        let upstream = Arc::new(Mutex::new(None::<SubscriptionRef>));
        let slot = upstream.clone();
        outlet.set_on_cancel(move || {
            let current = slot.lock().take();
            if let Some(subscription) = current {
                subscription.cancel();
            }
        });
        outlet.attach(subscriber);
        self.upstream.subscribe(BackpressureSubscriber {
            emitter: Emitter {
                outlet,
                strategy: self.strategy.clone(),
            },
            upstream,
        });
    }
}

struct BackpressureSubscriber<T> {
    emitter: Emitter<T>,
    upstream: Arc<Mutex<Option<SubscriptionRef>>>,
}

impl<T: Send + 'static> Subscriber<T> for BackpressureSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.emitter.outlet.is_cancelled() {
            subscription.cancel();
            return;
        }
        *self.upstream.lock() = Some(subscription.clone());
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, item: T) {
        self.emitter.emit(item);
        if self.emitter.is_closed() {
            let current = self.upstream.lock().take();
            if let Some(subscription) = current {
                subscription.cancel();
            }
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.emitter.outlet.error(error);
    }

    fn on_complete(&mut self) {
        self.emitter.outlet.complete();
    }
}

impl<T: Send + 'static> Flux<T> {
    /// A stream fed by `producer` through a [`FluxSink`].
    ///
    /// `producer` runs once per subscriber, right after subscription. It may
    /// keep clones of the sink and emit later from other threads. An `Err`
    /// return fails the stream.
    ///
    /// ```
    /// use rivulet::{Flux, OverflowStrategy};
    ///
    /// let flux = Flux::create(
    ///     |sink| {
    ///         for word in ["a", "b", "c"] {
    ///             sink.next(word);
    ///         }
    ///         sink.complete();
    ///         Ok(())
    ///     },
    ///     OverflowStrategy::Buffer(Default::default()),
    /// );
    /// assert_eq!(flux.collect_list().block_last().unwrap(), Some(vec!["a", "b", "c"]));
    /// ```
    pub fn create<P>(producer: P, strategy: OverflowStrategy<T>) -> Flux<T>
    where
        P: Fn(FluxSink<T>) -> Result<(), FluxError> + Send + Sync + 'static,
    {
        Flux::from_publisher(Create { producer, strategy })
    }

    fn on_backpressure(&self, strategy: OverflowStrategy<T>) -> Flux<T> {
        Flux::from_publisher(OnBackpressure {
            upstream: self.clone(),
            strategy,
        })
    }

    /// Request everything from upstream and buffer what downstream is not
    /// ready for.
    pub fn on_backpressure_buffer(&self, policy: BufferPolicy<T>) -> Flux<T> {
        self.on_backpressure(OverflowStrategy::Buffer(policy))
    }

    /// Request everything from upstream and hand items nobody asked for to
    /// `hook`.
    pub fn on_backpressure_drop<F>(&self, hook: F) -> Flux<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_backpressure_buffer(
            BufferPolicy::bounded(0)
                .strategy(BufferOverflowStrategy::DropLatest)
                .on_overflow(hook),
        )
    }

    /// Request everything from upstream and fail on the first item nobody
    /// asked for.
    pub fn on_backpressure_error(&self) -> Flux<T> {
        self.on_backpressure(OverflowStrategy::Error)
    }

    /// Request everything from upstream and keep only the latest item
    /// nobody asked for yet.
    pub fn on_backpressure_latest(&self) -> Flux<T> {
        self.on_backpressure(OverflowStrategy::Latest)
    }
}

impl<T> Default for BufferPolicy<T> {
    fn default() -> Self {
        BufferPolicy::unbounded()
    }
}
