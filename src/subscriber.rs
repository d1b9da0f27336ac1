//! Subscribers and subscriptions.
//!
//! A [`Subscriber`] consumes signals; the [`Subscription`] it receives in
//! `on_subscribe` is its only way to ask for more items or to stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::demand::UNBOUNDED;
use crate::error::FluxError;

/// The back-channel from a subscriber to its publisher.
///
/// Both methods may be called from any thread, and re-entrantly from inside
/// the subscriber's own callbacks.
pub trait Subscription: Send + Sync {
    /// Ask for `n` more items. `0` is a no-op, a negative amount fails the
    /// stream with [`FluxError::IllegalDemand`].
    fn request(&self, n: i64);

    /// Stop the flow of signals. Idempotent.
    fn cancel(&self);
}

/// Shared handle to a subscription.
pub type SubscriptionRef = Arc<dyn Subscription>;

/// The consumer side of a stream.
///
/// Calls to one subscriber are never concurrent: `on_subscribe` comes first,
/// then any number of `on_next`, then at most one of `on_error` or
/// `on_complete`.
pub trait Subscriber<T>: Send + 'static {
    /// Receive the subscription. Nothing flows until `request` is called.
    fn on_subscribe(&mut self, subscription: SubscriptionRef);

    /// Receive one item.
    fn on_next(&mut self, item: T);

    /// The stream failed.
    fn on_error(&mut self, error: FluxError);

    /// The stream ended normally.
    fn on_complete(&mut self);
}

/// Boxed subscriber as passed between stages.
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

/// Subscription that ignores everything, for publishers that terminate
/// immediately.
pub(crate) struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _: i64) {}
    fn cancel(&self) {}
}

/// Shorthand to deliver a terminal signal without any item.
pub(crate) fn fail_now<T: 'static>(mut subscriber: BoxSubscriber<T>, error: FluxError) {
    subscriber.on_subscribe(Arc::new(NoopSubscription));
    subscriber.on_error(error);
}

/// Handle to cancel a subscription made with closures.
#[derive(Clone)]
pub struct Disposable {
    slot: Arc<Slot>,
}

#[derive(Default)]
struct Slot {
    subscription: Mutex<Option<SubscriptionRef>>,
    disposed: AtomicBool,
}

impl Disposable {
    fn new() -> Disposable {
        Disposable {
            slot: Arc::new(Slot::default()),
        }
    }

    fn set(&self, subscription: &SubscriptionRef) {
        if self.slot.disposed.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        *self.slot.subscription.lock() = Some(subscription.clone());
        if self.slot.disposed.load(Ordering::Acquire) {
            subscription.cancel();
        }
    }

    /// Cancel the underlying subscription.
    pub fn dispose(&self) {
        self.slot.disposed.store(true, Ordering::Release);
        let current = self.slot.subscription.lock().take();
        if let Some(subscription) = current {
            subscription.cancel();
        }
    }

    /// Whether `dispose` was called.
    pub fn is_disposed(&self) -> bool {
        self.slot.disposed.load(Ordering::Acquire)
    }
}

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(FluxError) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;

/// Subscriber built from closures that requests everything up front.
pub(crate) struct LambdaSubscriber<T> {
    on_next: NextFn<T>,
    on_error: ErrorFn,
    on_complete: CompleteFn,
    disposable: Disposable,
}

impl<T: Send + 'static> LambdaSubscriber<T> {
    pub fn new(on_next: NextFn<T>, on_error: ErrorFn, on_complete: CompleteFn) -> Self {
        LambdaSubscriber {
            on_next,
            on_error,
            on_complete,
            disposable: Disposable::new(),
        }
    }

    pub fn disposable(&self) -> Disposable {
        self.disposable.clone()
    }
}

impl<T: Send + 'static> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.disposable.set(&subscription);
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, item: T) {
        (self.on_next)(item)
    }

    fn on_error(&mut self, error: FluxError) {
        (self.on_error)(error)
    }

    fn on_complete(&mut self) {
        (self.on_complete)()
    }
}

/// A subscription slot that accepts requests before the upstream arrives.
///
/// Demand requested early is handed over in one `request` when the upstream
/// is set; a cancel before that cancels the upstream on arrival.
#[derive(Default)]
pub(crate) struct Deferred {
    state: Mutex<DeferredState>,
}

#[derive(Default)]
struct DeferredState {
    upstream: Option<SubscriptionRef>,
    pending: i64,
    cancelled: bool,
}

impl Deferred {
    pub fn new() -> Arc<Deferred> {
        Arc::new(Deferred::default())
    }

    pub fn set(&self, upstream: SubscriptionRef) {
        let pending = {
            let mut state = self.state.lock();
            if state.cancelled {
                None
            } else {
                state.upstream = Some(upstream.clone());
                Some(std::mem::take(&mut state.pending))
            }
        };
        match pending {
            None => upstream.cancel(),
            Some(0) => {}
            Some(n) => upstream.request(n),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

impl Subscription for Deferred {
    fn request(&self, n: i64) {
        let upstream = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            match &state.upstream {
                Some(upstream) => upstream.clone(),
                None => {
                    state.pending = if n < 0 || state.pending < 0 {
                        n.min(state.pending)
                    } else {
                        state.pending.saturating_add(n)
                    };
                    return;
                }
            }
        };
        upstream.request(n);
    }

    fn cancel(&self) {
        let upstream = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.upstream.take()
        };
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

/// The set of upstream subscriptions of a multi-source stage.
///
/// Only the owning stage adds or removes members; cancelling the set cancels
/// every current member and every member added afterwards.
pub(crate) struct Upstreams {
    inner: Mutex<Option<Members>>,
}

struct Members {
    next_id: usize,
    entries: HashMap<usize, SubscriptionRef>,
}

impl Upstreams {
    pub fn new() -> Upstreams {
        Upstreams {
            inner: Mutex::new(Some(Members {
                next_id: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Register a subscription. Returns `None`, after cancelling it, if the
    /// set was already cancelled.
    pub fn add(&self, subscription: &SubscriptionRef) -> Option<usize> {
        let id = {
            let mut guard = self.inner.lock();
            guard.as_mut().map(|members| {
                let id = members.next_id;
                members.next_id += 1;
                members.entries.insert(id, subscription.clone());
                id
            })
        };
        if id.is_none() {
            subscription.cancel();
        }
        id
    }

    pub fn remove(&self, id: usize) {
        if let Some(members) = self.inner.lock().as_mut() {
            members.entries.remove(&id);
        }
    }

    pub fn cancel_all(&self) {
        let members = self.inner.lock().take();
        if let Some(members) = members {
            for subscription in members.entries.into_values() {
                subscription.cancel();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().is_none()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counting {
        cancels: AtomicUsize,
    }

    impl Subscription for Counting {
        fn request(&self, _: i64) {}
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn upstreams_cancel_members_and_latecomers() {
        let set = Upstreams::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let a_ref: SubscriptionRef = a.clone();
        let b_ref: SubscriptionRef = b.clone();
        let id = set.add(&a_ref).expect("set is open");
        set.remove(id);
        set.add(&a_ref);
        set.cancel_all();
        assert!(set.is_cancelled());
        assert_eq!(a.cancels.load(Ordering::SeqCst), 1);
        assert!(set.add(&b_ref).is_none());
        assert_eq!(b.cancels.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct Requests {
        log: Mutex<Vec<i64>>,
    }

    impl Subscription for Requests {
        fn request(&self, n: i64) {
            self.log.lock().push(n);
        }
        fn cancel(&self) {
            self.log.lock().push(0);
        }
    }

    #[test]
    fn deferred_hands_over_early_demand() {
        let slot = Deferred::new();
        slot.request(2);
        slot.request(3);
        let upstream = Arc::new(Requests::default());
        slot.set(upstream.clone());
        slot.request(UNBOUNDED);
        assert_eq!(*upstream.log.lock(), vec![5, UNBOUNDED]);
        slot.cancel();
        slot.request(1);
        assert_eq!(*upstream.log.lock(), vec![5, UNBOUNDED, 0]);
    }

    #[test]
    fn deferred_keeps_illegal_request() {
        let slot = Deferred::new();
        slot.request(4);
        slot.request(-2);
        slot.request(4);
        let upstream = Arc::new(Requests::default());
        slot.set(upstream.clone());
        assert_eq!(*upstream.log.lock(), vec![-2]);
    }

    #[test]
    fn deferred_cancel_before_set() {
        let slot = Deferred::new();
        slot.cancel();
        assert!(slot.is_cancelled());
        let upstream = Arc::new(Requests::default());
        slot.set(upstream.clone());
        assert_eq!(*upstream.log.lock(), vec![0]);
    }

    #[test]
    fn dispose_before_and_after_set() {
        let early = Disposable::new();
        early.dispose();
        let s = Arc::new(Counting::default());
        let s_ref: SubscriptionRef = s.clone();
        early.set(&s_ref);
        assert_eq!(s.cancels.load(Ordering::SeqCst), 1);

        let late = Disposable::new();
        late.set(&s_ref);
        assert!(!late.is_disposed());
        late.dispose();
        late.dispose();
        assert_eq!(s.cancels.load(Ordering::SeqCst), 2);
    }
}
