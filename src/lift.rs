//! Lifting subscriber transformations to stream transformations.
//!
//! Most synchronous stages never need their own publisher: they only wrap
//! the downstream subscriber in one that rewrites signals on the way
//! through, and subscribe that wrapper upstream.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::flux::{Flux, Publisher};
use crate::subscriber::BoxSubscriber;

struct Lift<T, U, F> {
    upstream: Flux<T>,
    wrap: F,
    _marker: PhantomData<fn(U)>,
}

impl<T, U, F> Publisher<U> for Lift<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(BoxSubscriber<U>) -> BoxSubscriber<T> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<U>) {
        self.upstream.subscribe_boxed((self.wrap)(subscriber));
    }
}

impl<T: Send + 'static> Flux<T> {
    /// A stream whose subscribers are wrapped by `wrap` before being
    /// subscribed to this one.
    pub(crate) fn lift<U, F>(&self, wrap: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(BoxSubscriber<U>) -> BoxSubscriber<T> + Send + Sync + 'static,
    {
        Flux::from_arc(Arc::new(Lift {
            upstream: self.clone(),
            wrap,
            _marker: PhantomData,
        }))
    }
}
