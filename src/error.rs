//! Error kinds delivered through `on_error`.
//!
//! Cancellation is not an error: a cancelled subscription simply stops
//! receiving signals. Everything else that ends a stream abnormally is a
//! [`FluxError`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A terminal error travelling down a stream.
///
/// Errors are cheap to clone, so that operators such as `group_by` can
/// broadcast one failure to many sub-streams.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FluxError {
    /// Opaque failure raised by producer or operator logic.
    #[error("{0}")]
    Upstream(Arc<dyn StdError + Send + Sync>),

    /// A push source produced more than downstream requested under a
    /// non-dropping overflow policy.
    #[error("overflow: {0}")]
    Overflow(&'static str),

    /// No signal arrived within the given bound.
    #[error("no signal observed within {0:?}")]
    Timeout(Duration),

    /// `request` was called with a negative amount.
    #[error("request({0}) is invalid, demand must be positive")]
    IllegalDemand(i64),

    /// An operator contract was violated, e.g. a unicast window was
    /// subscribed twice.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

/// Discriminant of a [`FluxError`], handy for expectations in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`FluxError::Upstream`].
    Upstream,
    /// See [`FluxError::Overflow`].
    Overflow,
    /// See [`FluxError::Timeout`].
    Timeout,
    /// See [`FluxError::IllegalDemand`].
    IllegalDemand,
    /// See [`FluxError::IllegalState`].
    IllegalState,
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

impl FluxError {
    /// Wrap an arbitrary error as an upstream failure.
    pub fn upstream<E>(error: E) -> FluxError
    where
        E: StdError + Send + Sync + 'static,
    {
        FluxError::Upstream(Arc::new(error))
    }

    /// An upstream failure carrying only a message.
    ///
    /// ```
    /// # use rivulet::{ErrorKind, FluxError};
    /// let err = FluxError::msg("division by zero");
    /// assert_eq!(err.kind(), ErrorKind::Upstream);
    /// assert_eq!(err.to_string(), "division by zero");
    /// ```
    pub fn msg<S: Into<String>>(message: S) -> FluxError {
        FluxError::upstream(Message(message.into()))
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FluxError::Upstream(_) => ErrorKind::Upstream,
            FluxError::Overflow(_) => ErrorKind::Overflow,
            FluxError::Timeout(_) => ErrorKind::Timeout,
            FluxError::IllegalDemand(_) => ErrorKind::IllegalDemand,
            FluxError::IllegalState(_) => ErrorKind::IllegalState,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            FluxError::Upstream(_) => "upstream",
            FluxError::Overflow(_) => "overflow",
            FluxError::Timeout(_) => "timeout",
            FluxError::IllegalDemand(_) => "illegal_demand",
            FluxError::IllegalState(_) => "illegal_state",
        }
    }

    /// Access the wrapped cause of an upstream error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            FluxError::Upstream(cause) => cause.downcast_ref::<E>(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    #[test]
    fn kinds_and_labels() {
        let errors = [
            (FluxError::msg("x"), ErrorKind::Upstream, "upstream"),
            (FluxError::Overflow("full"), ErrorKind::Overflow, "overflow"),
            (
                FluxError::Timeout(Duration::from_millis(5)),
                ErrorKind::Timeout,
                "timeout",
            ),
            (FluxError::IllegalDemand(-1), ErrorKind::IllegalDemand, "illegal_demand"),
            (FluxError::IllegalState("twice"), ErrorKind::IllegalState, "illegal_state"),
        ];
        for (err, kind, label) in errors.iter() {
            assert_eq!(err.kind(), *kind);
            assert_eq!(err.as_label(), *label);
        }
    }

    #[test]
    fn downcast_upstream_cause() {
        let err = FluxError::upstream(io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(err.downcast_ref::<io::Error>().map(|e| e.kind()), Some(io::ErrorKind::Other));
        assert!(FluxError::Overflow("x").downcast_ref::<io::Error>().is_none());
    }

    #[test]
    fn display() {
        assert_eq!(
            FluxError::IllegalDemand(-3).to_string(),
            "request(-3) is invalid, demand must be positive"
        );
        assert_eq!(FluxError::msg("Opps").to_string(), "Opps");
    }
}
