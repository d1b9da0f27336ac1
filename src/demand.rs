//! Demand accounting and drain-loop ownership.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::error::FluxError;

/// Demand value that disables backpressure.
pub const UNBOUNDED: i64 = i64::MAX;

/// Outstanding requested-but-undelivered items of one subscription.
///
/// The counter saturates at [`UNBOUNDED`]; once there it never decreases.
#[derive(Debug, Default)]
pub struct Demand {
    requested: AtomicI64,
}

impl Demand {
    /// Create an empty demand counter.
    pub fn new() -> Demand {
        Demand::default()
    }

    /// Add `n` units, returning the previous value.
    pub fn add(&self, n: i64) -> i64 {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return current;
            }
            let next = current.saturating_add(n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Consume `n` delivered units.
    pub fn produced(&self, n: i64) {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return;
            }
            let next = (current - n).max(0);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Currently outstanding units.
    pub fn get(&self) -> i64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Whether backpressure is switched off.
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }
}

/// Validate an argument of `Subscription::request`.
///
/// `Ok(None)` means the call is a no-op.
pub fn check_request(n: i64) -> Result<Option<i64>, FluxError> {
    match n {
        n if n < 0 => Err(FluxError::IllegalDemand(n)),
        0 => Ok(None),
        n => Ok(Some(n)),
    }
}

/// Work-in-progress counter that elects a single drain owner.
///
/// Whoever moves the counter away from zero owns the drain loop; everybody
/// else only records that more work is pending.
///
/// ```ignore
/// if !wip.enter() { return; }
/// let mut missed = 1;
/// loop {
///     // deliver whatever is deliverable
///     missed = wip.leave(missed);
///     if missed == 0 { break; }
/// }
/// ```
#[derive(Debug, Default)]
pub(crate) struct Wip(AtomicUsize);

impl Wip {
    pub fn new() -> Wip {
        Wip(AtomicUsize::new(0))
    }

    /// Starts out owned by the creator.
    pub fn owned() -> Wip {
        Wip(AtomicUsize::new(1))
    }

    pub fn enter(&self) -> bool {
        self.0.fetch_add(1, Ordering::AcqRel) == 0
    }

    pub fn leave(&self, missed: usize) -> usize {
        self.0.fetch_sub(missed, Ordering::AcqRel) - missed
    }
}
