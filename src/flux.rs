//! The composition handle.
//!
//! A [`Flux`] is a cheap, cloneable description of a stream. Composing it
//! does no work; every call to one of the `subscribe*` methods runs the
//! whole chain anew for that subscriber.

use std::any::Any;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use crate::demand::UNBOUNDED;
use crate::error::FluxError;
use crate::signal::Signal;
use crate::subscriber::{
    BoxSubscriber, Disposable, LambdaSubscriber, Subscriber, SubscriptionRef,
};

/// A source of signals.
///
/// `subscribe` must call `on_subscribe` on the subscriber before anything
/// else, and must not deliver more items than were requested through the
/// subscription.
pub trait Publisher<T>: Send + Sync + 'static {
    /// Start a new subscription.
    fn subscribe(&self, subscriber: BoxSubscriber<T>);
}

/// Side effect run by `on_error_continue` for an element that failed.
pub type ContinueHook = Arc<dyn Fn(&FluxError, &dyn Any) + Send + Sync>;

type Resume<T> = Arc<dyn Fn(ContinueHook) -> Flux<T> + Send + Sync>;

/// A stream of values of type `T`.
///
/// ```
/// use rivulet::Flux;
///
/// let doubled = Flux::range(1, 4).map(|x| x * 2);
/// assert_eq!(doubled.collect_list().block_last().unwrap(), Some(vec![2, 4, 6, 8]));
///
/// // Every subscription runs the chain again.
/// assert_eq!(doubled.block_last().unwrap(), Some(8));
/// ```
pub struct Flux<T> {
    publisher: Arc<dyn Publisher<T>>,
    /// Rebuilds this chain with element-level error recovery, when the
    /// chain contains a stage that can skip a failing element.
    resume: Option<Resume<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Flux<T> {
        Flux {
            publisher: self.publisher.clone(),
            resume: self.resume.clone(),
        }
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Wrap a custom publisher.
    pub fn from_publisher<P: Publisher<T>>(publisher: P) -> Flux<T> {
        Flux::from_arc(Arc::new(publisher))
    }

    pub(crate) fn from_arc(publisher: Arc<dyn Publisher<T>>) -> Flux<T> {
        Flux {
            publisher,
            resume: None,
        }
    }

    /// Subscribe an already boxed subscriber.
    pub(crate) fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>) {
        self.publisher.subscribe(subscriber);
    }

    /// Build a stage on top of this stream.
    ///
    /// `build` receives the upstream and, when the chain is rebuilt by
    /// `on_error_continue`, the hook to run for failing elements. Stages
    /// that can skip an element pass `skips_elements`; all others merely
    /// carry an upstream's ability along.
    pub(crate) fn stage<U, B>(&self, skips_elements: bool, build: B) -> Flux<U>
    where
        U: Send + 'static,
        B: Fn(Flux<T>, Option<ContinueHook>) -> Flux<U> + Send + Sync + 'static,
    {
        let plain = build(self.clone(), None);
        if !skips_elements && self.resume.is_none() {
            return plain;
        }
        let upstream = self.clone();
        Flux {
            publisher: plain.publisher,
            resume: Some(Arc::new(move |hook: ContinueHook| {
                build(upstream.resumed(hook.clone()), Some(hook))
            })),
        }
    }

    /// This chain rebuilt with `hook`, or unchanged if nothing in it can
    /// skip elements.
    pub(crate) fn resumed(&self, hook: ContinueHook) -> Flux<T> {
        match &self.resume {
            Some(resume) => {
                let mut rebuilt = resume(hook);
                rebuilt.resume = None;
                rebuilt
            }
            None => self.clone(),
        }
    }

    pub(crate) fn can_resume(&self) -> bool {
        self.resume.is_some()
    }

    /// Subscribe a subscriber.
    pub fn subscribe<S: Subscriber<T>>(&self, subscriber: S) {
        self.subscribe_boxed(Box::new(subscriber));
    }

    /// Subscribe with closures, requesting an unbounded amount.
    ///
    /// ```
    /// use std::sync::{Arc, Mutex};
    /// use rivulet::Flux;
    ///
    /// let seen = Arc::new(Mutex::new(Vec::new()));
    /// let sink = seen.clone();
    /// let done = Arc::new(Mutex::new(false));
    /// let flag = done.clone();
    /// Flux::from_iter(vec!["a", "b"]).subscribe_with(
    ///     move |s| sink.lock().unwrap().push(s),
    ///     |e| panic!("{}", e),
    ///     move || *flag.lock().unwrap() = true,
    /// );
    /// assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    /// assert!(*done.lock().unwrap());
    /// ```
    pub fn subscribe_with<N, E, C>(&self, on_next: N, on_error: E, on_complete: C) -> Disposable
    where
        N: FnMut(T) + Send + 'static,
        E: FnMut(FluxError) + Send + 'static,
        C: FnMut() + Send + 'static,
    {
        let subscriber =
            LambdaSubscriber::new(Box::new(on_next), Box::new(on_error), Box::new(on_complete));
        let disposable = subscriber.disposable();
        self.subscribe(subscriber);
        disposable
    }

    /// Subscribe with an item closure only. Errors are logged.
    pub fn subscribe_fn<N>(&self, on_next: N) -> Disposable
    where
        N: FnMut(T) + Send + 'static,
    {
        self.subscribe_with(
            on_next,
            |error| tracing::error!(error = %error, kind = error.as_label(), "unhandled stream error"),
            || (),
        )
    }

    /// Block the current thread until the stream terminates and return its
    /// last item.
    ///
    /// ```
    /// use rivulet::{Flux, FluxError};
    ///
    /// assert_eq!(Flux::just(3).block_last().unwrap(), Some(3));
    /// assert_eq!(Flux::<i32>::empty().block_last().unwrap(), None);
    /// assert!(Flux::<i32>::error(FluxError::msg("no")).block_last().is_err());
    /// ```
    pub fn block_last(&self) -> Result<Option<T>, FluxError> {
        let (tx, rx) = channel();
        self.subscribe(ChannelSubscriber {
            tx,
            initial: UNBOUNDED,
        });
        let mut last = None;
        for event in rx {
            match event {
                Event::Subscribed(_) => {}
                Event::Signal(Signal::Next(item)) => last = Some(item),
                Event::Signal(Signal::Error(error)) => return Err(error),
                Event::Signal(Signal::Complete) => return Ok(last),
            }
        }
        Err(FluxError::IllegalState("stream stopped without terminal signal"))
    }

    /// A blocking iterator that requests one item per call to `next`.
    ///
    /// Dropping the iterator cancels the subscription.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let mut iter = Flux::range(0, 1_000_000).into_blocking_iter();
    /// assert_eq!(iter.next().map(Result::ok), Some(Some(0)));
    /// assert_eq!(iter.next().map(Result::ok), Some(Some(1)));
    /// ```
    pub fn into_blocking_iter(&self) -> BlockingIter<T> {
        let (tx, rx) = channel();
        self.subscribe(ChannelSubscriber { tx, initial: 1 });
        BlockingIter {
            rx,
            subscription: None,
            done: false,
        }
    }
}

enum Event<T> {
    Subscribed(SubscriptionRef),
    Signal(Signal<T>),
}

struct ChannelSubscriber<T> {
    tx: Sender<Event<T>>,
    initial: i64,
}

impl<T: Send + 'static> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let _ = self.tx.send(Event::Subscribed(subscription.clone()));
        subscription.request(self.initial);
    }

    fn on_next(&mut self, item: T) {
        let _ = self.tx.send(Event::Signal(Signal::Next(item)));
    }

    fn on_error(&mut self, error: FluxError) {
        let _ = self.tx.send(Event::Signal(Signal::Error(error)));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(Event::Signal(Signal::Complete));
    }
}

/// Iterator over the items of a stream, see [`Flux::into_blocking_iter`].
pub struct BlockingIter<T> {
    rx: Receiver<Event<T>>,
    subscription: Option<SubscriptionRef>,
    done: bool,
}

impl<T> Iterator for BlockingIter<T> {
    type Item = Result<T, FluxError>;

    fn next(&mut self) -> Option<Result<T, FluxError>> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.rx.recv() {
                Ok(event) => event,
                Err(_) => {
                    self.done = true;
                    return None;
                }
            };
            match event {
                Event::Subscribed(subscription) => self.subscription = Some(subscription),
                Event::Signal(Signal::Next(item)) => {
                    if let Some(subscription) = &self.subscription {
                        subscription.request(1);
                    }
                    return Some(Ok(item));
                }
                Event::Signal(Signal::Error(error)) => {
                    self.done = true;
                    return Some(Err(error));
                }
                Event::Signal(Signal::Complete) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

impl<T> Drop for BlockingIter<T> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(subscription) = &self.subscription {
                subscription.cancel();
            }
        }
    }
}
