//! Splitting a stream into sub-streams.
//!
//! Each window is a unicast [`Flux`] backed by its own outlet. Items of a
//! window are queued until the window is subscribed, so windows may be
//! consumed later or concurrently without holding up the source.
//!
//! The upstream subscription is shared by the main stream and every open
//! window. It is cancelled once the main stream was cancelled and all
//! windows were either closed or cancelled.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::flux::{Flux, Publisher};
use crate::outlet::Outlet;
use crate::subscriber::{BoxSubscriber, Deferred, Subscriber, Subscription, SubscriptionRef};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

enum Boundary<T> {
    Count(usize),
    Until { predicate: Predicate<T>, cut_before: bool },
}

impl<T> Clone for Boundary<T> {
    fn clone(&self) -> Self {
        match self {
            Boundary::Count(size) => Boundary::Count(*size),
            Boundary::Until {
                predicate,
                cut_before,
            } => Boundary::Until {
                predicate: predicate.clone(),
                cut_before: *cut_before,
            },
        }
    }
}

struct Shared<T> {
    main: Arc<Outlet<Flux<T>>>,
    upstream: Arc<Deferred>,
    refs: AtomicUsize,
}

impl<T: Send + 'static> Shared<T> {
    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.upstream.cancel();
        }
    }
}

/// One reference on the upstream, dropped at most once.
struct Token<T> {
    shared: Arc<Shared<T>>,
    released: AtomicBool,
}

impl<T: Send + 'static> Token<T> {
    fn acquire(shared: &Arc<Shared<T>>) -> Arc<Token<T>> {
        shared.refs.fetch_add(1, Ordering::AcqRel);
        Arc::new(Token {
            shared: shared.clone(),
            released: AtomicBool::new(false),
        })
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.shared.release();
        }
    }
}

struct Open<T> {
    outlet: Arc<Outlet<T>>,
    token: Arc<Token<T>>,
    len: usize,
}

impl<T: Send + 'static> Open<T> {
    fn close(self) {
        self.outlet.complete();
        self.token.release();
    }
}

struct WindowSubscriber<T> {
    shared: Arc<Shared<T>>,
    boundary: Boundary<T>,
    current: Option<Open<T>>,
}

impl<T: Send + 'static> WindowSubscriber<T> {
    /// The open window, opening a new one if needed. `None` once the main
    /// stream is gone.
    fn window(&mut self) -> Option<&mut Open<T>> {
        if self.current.is_none() {
            if self.shared.main.is_cancelled() {
                return None;
            }
            let outlet = Outlet::new(true);
            let token = Token::acquire(&self.shared);
            let on_cancel = token.clone();
            outlet.set_on_cancel(move || on_cancel.release());
            let publisher: Arc<dyn Publisher<T>> = outlet.clone();
            self.shared.main.push(Flux::from_arc(publisher));
            self.current = Some(Open {
                outlet,
                token,
                len: 0,
            });
        }
        self.current.as_mut()
    }

    fn close(&mut self) {
        if let Some(open) = self.current.take() {
            open.close();
        }
    }

    fn append(&mut self, item: T) {
        if let Some(open) = self.window() {
            open.outlet.push(item);
            open.len += 1;
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for WindowSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.shared.upstream.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        match self.boundary.clone() {
            Boundary::Count(size) => {
                self.append(item);
                if self.current.as_ref().map_or(false, |open| open.len >= size) {
                    self.close();
                }
            }
            Boundary::Until {
                predicate,
                cut_before,
            } => {
                let hit = predicate(&item);
                if hit && cut_before {
                    self.close();
                    self.append(item);
                } else {
                    self.append(item);
                    if hit {
                        self.close();
                    }
                }
            }
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if let Some(open) = self.current.take() {
            open.outlet.error(error.clone());
            open.token.release();
        }
        self.shared.main.error(error);
    }

    fn on_complete(&mut self) {
        self.close();
        self.shared.main.complete();
    }
}

struct Window<T> {
    upstream: Flux<T>,
    boundary: Boundary<T>,
}

impl<T: Send + 'static> Publisher<Flux<T>> for Window<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<Flux<T>>) {
        let shared = Arc::new(Shared {
            main: Outlet::new(true),
            upstream: Deferred::new(),
            refs: AtomicUsize::new(1),
        });
        let upstream = shared.upstream.clone();
        match &self.boundary {
            Boundary::Count(size) => {
                let size = i64::try_from(*size).unwrap_or(UNBOUNDED);
                shared.main.set_on_request(move |n| {
                    upstream.request(if n == UNBOUNDED { n } else { n.saturating_mul(size) })
                });
            }
            Boundary::Until { .. } => {
                let requested = AtomicBool::new(false);
                shared.main.set_on_request(move |_| {
                    if !requested.swap(true, Ordering::AcqRel) {
                        upstream.request(UNBOUNDED);
                    }
                });
            }
        }
        let on_cancel = shared.clone();
        shared.main.set_on_cancel(move || on_cancel.release());
        shared.main.attach(subscriber);
        self.upstream.subscribe(WindowSubscriber {
            shared,
            boundary: self.boundary.clone(),
            current: None,
        });
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Split into consecutive windows of `size` items. A request for `k`
    /// windows is passed upstream as `k * size` items.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let sums = Flux::range(1, 7)
    ///     .window(3)
    ///     .concat_map(|w| w.collect_list())
    ///     .map(|w| w.iter().sum::<i32>());
    /// assert_eq!(sums.collect_list().block_last().unwrap(), Some(vec![6, 15, 7]));
    /// ```
    ///
    /// # Panics
    ///
    /// If `size` is zero.
    pub fn window(&self, size: usize) -> Flux<Flux<T>> {
        assert!(size > 0, "window size must be positive");
        Flux::from_publisher(Window {
            upstream: self.clone(),
            boundary: Boundary::Count(size),
        })
    }

    /// Split into windows that end where `predicate` matches. With
    /// `cut_before` the matching item opens the next window, otherwise it
    /// closes the current one. Empty windows are never emitted.
    pub fn window_until<P>(&self, predicate: P, cut_before: bool) -> Flux<Flux<T>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Flux::from_publisher(Window {
            upstream: self.clone(),
            boundary: Boundary::Until {
                predicate: Arc::new(predicate),
                cut_before,
            },
        })
    }
}
