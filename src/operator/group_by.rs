//! Splitting a stream into keyed sub-streams.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef};

/// The sub-stream of one key emitted by [`Flux::group_by`].
///
/// Dereferences to the [`Flux`] of the group's items. Like a window, a
/// group accepts a single subscriber.
pub struct GroupedFlux<K, T> {
    key: K,
    flux: Flux<T>,
}

impl<K: Clone, T> Clone for GroupedFlux<K, T> {
    fn clone(&self) -> Self {
        GroupedFlux {
            key: self.key.clone(),
            flux: self.flux.clone(),
        }
    }
}

impl<K, T> GroupedFlux<K, T> {
    /// The key shared by every item of this group.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, T> Deref for GroupedFlux<K, T> {
    type Target = Flux<T>;

    fn deref(&self) -> &Flux<T> {
        &self.flux
    }
}

struct Shared<K, T> {
    main: Arc<Outlet<GroupedFlux<K, T>>>,
    upstream: Arc<Deferred>,
    /// The main stream plus every group not yet cancelled.
    refs: AtomicUsize,
}

impl<K: Send + 'static, T: Send + 'static> Shared<K, T> {
    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!("all groups released, cancelling upstream");
            self.upstream.cancel();
        }
    }
}

struct GroupBySubscriber<K, T, F> {
    shared: Arc<Shared<K, T>>,
    key_fn: Arc<F>,
    groups: HashMap<K, Arc<Outlet<T>>>,
}

impl<K, T, F> GroupBySubscriber<K, T, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    fn open(&mut self, key: &K) -> Option<Arc<Outlet<T>>> {
        if self.shared.main.is_cancelled() {
            return None;
        }
        tracing::trace!("opening group");
        let outlet = Outlet::new(true);
        self.shared.refs.fetch_add(1, Ordering::AcqRel);
        let released = AtomicBool::new(false);
        let shared = self.shared.clone();
        outlet.set_on_cancel(move || {
            if !released.swap(true, Ordering::AcqRel) {
                shared.release();
            }
        });
        let publisher: Arc<dyn Publisher<T>> = outlet.clone();
        self.shared.main.push(GroupedFlux {
            key: key.clone(),
            flux: Flux::from_arc(publisher),
        });
        self.groups.insert(key.clone(), outlet.clone());
        Some(outlet)
    }
}

impl<K, T, F> Subscriber<T> for GroupBySubscriber<K, T, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.shared.upstream.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        let key = (self.key_fn)(&item);
        let existing = self.groups.get(&key).cloned();
        let group = match existing {
            Some(group) => Some(group),
            None => self.open(&key),
        };
        if let Some(group) = group {
            group.push(item);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        for (_, group) in self.groups.drain() {
            group.error(error.clone());
        }
        self.shared.main.error(error);
    }

    fn on_complete(&mut self) {
        for (_, group) in self.groups.drain() {
            group.complete();
        }
        self.shared.main.complete();
    }
}

struct GroupBy<T, F> {
    upstream: Flux<T>,
    key_fn: Arc<F>,
}

impl<K, T, F> Publisher<GroupedFlux<K, T>> for GroupBy<T, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<GroupedFlux<K, T>>) {
        let shared = Arc::new(Shared {
            main: Outlet::new(true),
            upstream: Deferred::new(),
            refs: AtomicUsize::new(1),
        });
        let upstream = shared.upstream.clone();
        let requested = AtomicBool::new(false);
        shared.main.set_on_request(move |_| {
            if !requested.swap(true, Ordering::AcqRel) {
                upstream.request(UNBOUNDED);
            }
        });
        let on_cancel = shared.clone();
        shared.main.set_on_cancel(move || on_cancel.release());
        shared.main.attach(subscriber);
        self.upstream.subscribe(GroupBySubscriber {
            shared,
            key_fn: self.key_fn.clone(),
            groups: HashMap::new(),
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Split the stream by key. A group is emitted when its key occurs for
    /// the first time and completes when this stream completes.
    ///
    /// Upstream is consumed without bound; a group buffers its items until
    /// it is subscribed. Items of a group whose subscriber cancelled are
    /// dropped.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let sizes = Flux::range(1, 10)
    ///     .group_by(|x| x % 3)
    ///     .flat_map(|group| {
    ///         let key = *group.key();
    ///         group.collect_list().map(move |items| (key, items.len()))
    ///     });
    /// let mut sizes = sizes.collect_list().block_last().unwrap().unwrap();
    /// sizes.sort();
    /// assert_eq!(sizes, vec![(0, 3), (1, 4), (2, 3)]);
    /// ```
    pub fn group_by<K, F>(&self, key_fn: F) -> Flux<GroupedFlux<K, T>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Flux::from_publisher(GroupBy {
            upstream: self.clone(),
            key_fn: Arc::new(key_fn),
        })
    }
}
