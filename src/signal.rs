//! Signals delivered to a subscriber.

use crate::error::FluxError;

/// One signal of a stream.
///
/// For any one subscription at most one terminal signal (`Error` or
/// `Complete`) is delivered, and it is always the last one.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// A value.
    Next(T),
    /// Abnormal termination.
    Error(FluxError),
    /// Normal termination.
    Complete,
}

impl<T> Signal<T> {
    /// Whether this signal ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// The value of a `Next` signal.
    pub fn into_next(self) -> Option<T> {
        match self {
            Signal::Next(value) => Some(value),
            _ => None,
        }
    }

    /// Map the carried value, keeping terminal signals as they are.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Signal<U> {
        match self {
            Signal::Next(value) => Signal::Next(f(value)),
            Signal::Error(err) => Signal::Error(err),
            Signal::Complete => Signal::Complete,
        }
    }
}

/// How a subscription ended, as reported to `do_finally`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Upstream completed.
    OnComplete,
    /// Upstream failed.
    OnError,
    /// Downstream cancelled.
    Cancel,
}
