//! Side-effect stages that leave the stream itself untouched.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::FluxError;
use crate::flux::Flux;
use crate::signal::SignalType;
use crate::subscriber::{BoxSubscriber, Subscriber, Subscription, SubscriptionRef};

type OnNext<T> = Arc<dyn Fn(&T) + Send + Sync>;
type OnError = Arc<dyn Fn(&FluxError) + Send + Sync>;
type OnComplete = Arc<dyn Fn() + Send + Sync>;
type OnFinally = Arc<dyn Fn(SignalType) + Send + Sync>;

/// The callbacks of one peek stage. Unset ones are skipped.
struct Callbacks<T> {
    on_next: Option<OnNext<T>>,
    on_error: Option<OnError>,
    on_complete: Option<OnComplete>,
    on_finally: Option<OnFinally>,
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Callbacks {
            on_next: None,
            on_error: None,
            on_complete: None,
            on_finally: None,
        }
    }
}

impl<T> Clone for Callbacks<T> {
    fn clone(&self) -> Self {
        Callbacks {
            on_next: self.on_next.clone(),
            on_error: self.on_error.clone(),
            on_complete: self.on_complete.clone(),
            on_finally: self.on_finally.clone(),
        }
    }
}

/// Runs the finally hook at most once, whichever of terminal signal or
/// cancellation comes first.
struct Finally {
    fired: AtomicBool,
    hook: OnFinally,
}

impl Finally {
    fn fire(&self, signal: SignalType) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            (self.hook)(signal);
        }
    }
}

struct FinallySubscription {
    upstream: SubscriptionRef,
    finally: Arc<Finally>,
}

impl Subscription for FinallySubscription {
    fn request(&self, n: i64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.finally.fire(SignalType::Cancel);
    }
}

struct PeekSubscriber<T> {
    downstream: BoxSubscriber<T>,
    callbacks: Callbacks<T>,
    finally: Option<Arc<Finally>>,
}

impl<T: Send + 'static> Subscriber<T> for PeekSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        match &self.finally {
            Some(finally) => self.downstream.on_subscribe(Arc::new(FinallySubscription {
                upstream: subscription,
                finally: finally.clone(),
            })),
            None => self.downstream.on_subscribe(subscription),
        }
    }

    fn on_next(&mut self, item: T) {
        if let Some(hook) = &self.callbacks.on_next {
            hook(&item);
        }
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        if let Some(hook) = &self.callbacks.on_error {
            hook(&error);
        }
        self.downstream.on_error(error);
        if let Some(finally) = &self.finally {
            finally.fire(SignalType::OnError);
        }
    }

    fn on_complete(&mut self) {
        if let Some(hook) = &self.callbacks.on_complete {
            hook();
        }
        self.downstream.on_complete();
        if let Some(finally) = &self.finally {
            finally.fire(SignalType::OnComplete);
        }
    }
}

struct LogSubscription {
    upstream: SubscriptionRef,
    category: Arc<str>,
}

impl Subscription for LogSubscription {
    fn request(&self, n: i64) {
        if n == crate::demand::UNBOUNDED {
            tracing::info!(category = %self.category, "request(unbounded)");
        } else {
            tracing::info!(category = %self.category, "request({})", n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        tracing::info!(category = %self.category, "cancel()");
        self.upstream.cancel();
    }
}

struct LogSubscriber<T> {
    downstream: BoxSubscriber<T>,
    category: Arc<str>,
}

impl<T: Debug + Send + 'static> Subscriber<T> for LogSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        tracing::info!(category = %self.category, "onSubscribe()");
        self.downstream.on_subscribe(Arc::new(LogSubscription {
            upstream: subscription,
            category: self.category.clone(),
        }));
    }

    fn on_next(&mut self, item: T) {
        tracing::info!(category = %self.category, "onNext({:?})", item);
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        tracing::info!(category = %self.category, kind = error.as_label(), "onError({})", error);
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        tracing::info!(category = %self.category, "onComplete()");
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> Flux<T> {
    fn peek(&self, callbacks: Callbacks<T>) -> Flux<T> {
        self.stage(false, move |upstream, _| {
            let callbacks = callbacks.clone();
            upstream.lift(move |downstream| {
                Box::new(PeekSubscriber {
                    downstream,
                    callbacks: callbacks.clone(),
                    finally: callbacks.on_finally.clone().map(|hook| {
                        Arc::new(Finally {
                            fired: AtomicBool::new(false),
                            hook,
                        })
                    }),
                }) as BoxSubscriber<T>
            })
        })
    }

    /// Run `f` on every item before passing it on.
    ///
    /// ```
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    /// use rivulet::Flux;
    ///
    /// let seen = Arc::new(AtomicUsize::new(0));
    /// let counter = seen.clone();
    /// Flux::range(0, 5)
    ///     .do_on_next(move |_| { counter.fetch_add(1, Ordering::SeqCst); })
    ///     .block_last()
    ///     .unwrap();
    /// assert_eq!(seen.load(Ordering::SeqCst), 5);
    /// ```
    pub fn do_on_next<F>(&self, f: F) -> Flux<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.peek(Callbacks {
            on_next: Some(Arc::new(f)),
            ..Callbacks::default()
        })
    }

    /// Run `f` when the stream fails, before the error is passed on.
    pub fn do_on_error<F>(&self, f: F) -> Flux<T>
    where
        F: Fn(&FluxError) + Send + Sync + 'static,
    {
        self.peek(Callbacks {
            on_error: Some(Arc::new(f)),
            ..Callbacks::default()
        })
    }

    /// Run `f` when the stream completes, before completion is passed on.
    pub fn do_on_complete<F>(&self, f: F) -> Flux<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.peek(Callbacks {
            on_complete: Some(Arc::new(f)),
            ..Callbacks::default()
        })
    }

    /// Run `f` exactly once per subscription, after it ended by completion,
    /// error or cancellation.
    pub fn do_finally<F>(&self, f: F) -> Flux<T>
    where
        F: Fn(SignalType) + Send + Sync + 'static,
    {
        self.peek(Callbacks {
            on_finally: Some(Arc::new(f)),
            ..Callbacks::default()
        })
    }

    /// Emit a `tracing` event at info level for every signal and every call
    /// on the subscription, tagged with `category`.
    pub fn log(&self, category: &str) -> Flux<T>
    where
        T: Debug,
    {
        let category: Arc<str> = Arc::from(category);
        self.stage(false, move |upstream, _| {
            let category = category.clone();
            upstream.lift(move |downstream| {
                Box::new(LogSubscriber {
                    downstream,
                    category: category.clone(),
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

    fn journal() -> (Arc<Mutex<Vec<String>>>, impl Fn(String) + Clone + Send + Sync + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |line| sink.lock().unwrap().push(line))
    }

    #[test]
    fn hooks_run_in_signal_order() {
        let (log, write) = journal();
        let (w1, w2, w3) = (write.clone(), write.clone(), write);
        let probe = TestSubscriber::new();
        Flux::range(1, 2)
            .do_on_next(move |x| w1(format!("next {}", x)))
            .do_on_complete(move || w2("complete".into()))
            .do_finally(move |signal| w3(format!("finally {:?}", signal)))
            .subscribe(probe.clone());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["next 1", "next 2", "complete", "finally OnComplete"]
        );
    }

    #[test]
    fn finally_reports_error_once() {
        let (log, write) = journal();
        let w = write.clone();
        let probe = TestSubscriber::<i32>::new();
        Flux::error(FluxError::msg("x"))
            .do_on_error(move |e| write(format!("error {}", e)))
            .do_finally(move |signal| w(format!("finally {:?}", signal)))
            .subscribe(probe.clone());
        probe.cancel();
        assert_eq!(*log.lock().unwrap(), vec!["error x", "finally OnError"]);
    }

    #[test]
    fn finally_on_cancel() {
        let (log, write) = journal();
        let probe = TestSubscriber::<i32>::with_request(1);
        Flux::never()
            .do_finally(move |signal| write(format!("{:?}", signal)))
            .subscribe(probe.clone());
        probe.cancel();
        probe.cancel();
        assert_eq!(*log.lock().unwrap(), vec!["Cancel"]);
    }

    #[test]
    fn log_is_transparent() {
        let probe = TestSubscriber::new();
        Flux::range(1, 3).log("test").subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }
}
