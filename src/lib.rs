//! Demand-driven reactive streams
//!
//! *Rivulet* provides asynchronous streams with backpressure: a consumer
//! says how many items it is ready for, and no stage ever delivers more.
//! Streams are composed from operators, moved between threads with
//! schedulers, and tested deterministically against a virtual clock.
//!
//!
//! # Streams, subscribers and demand
//!
//! A [`Flux`] describes a stream of items that ends either with completion or
//! with one [`FluxError`]. It is cold: nothing happens until a [`Subscriber`]
//! subscribes, and every subscription runs the whole chain afresh.
//!
//! The subscriber receives a [`Subscription`] first. Items only flow after it
//! calls `request(n)`, and the total number of items delivered never exceeds
//! the total requested. Requests accumulate and saturate at [`UNBOUNDED`],
//! which switches a stage to push mode. `cancel()` stops the flow and may be
//! called at any time, also from inside a callback.
//!
//! Callbacks to one subscriber are never concurrent, even when the producing
//! side runs on many threads. Stages serialize their output with a
//! work-in-progress counter instead of holding locks across user code.
//!
//!
//! # Example
//!
//! ```
//! # // NOTE: If you change this example, please update the README.md
//! # // accordingly, so that they remain in sync!
//! use rivulet::Flux;
//!
//! // A finite source
//! let numbers = Flux::range(1, 10);
//!
//! // Transform and filter it
//! let evens = numbers.map(|x| x * 10).filter(|x| x % 20 == 0);
//!
//! // Nothing has run yet. Collecting subscribes and blocks for the result.
//! assert_eq!(
//!     evens.collect_list().block_last().unwrap(),
//!     Some(vec![20, 40, 60, 80, 100])
//! );
//!
//! // Flatten, combine, recover
//! let words = Flux::from_iter(vec!["a b", "c"])
//!     .concat_map(|line| Flux::from_iter(line.split(' ').map(String::from).collect::<Vec<_>>()));
//! let pairs = Flux::zip(vec![words, Flux::from_iter(vec!["1".to_string(), "2".into(), "3".into()])]);
//! assert_eq!(
//!     pairs.map(|pair| pair.concat()).collect_list().block_last().unwrap(),
//!     Some(vec!["a1".to_string(), "b2".into(), "c3".into()])
//! );
//! ```
//!
//!
//! # Schedulers and time
//!
//! Work is placed explicitly: [`Flux::subscribe_on`] chooses where the source
//! runs, [`Flux::publish_on`] where everything downstream of it runs. Operators
//! that need a clock (`interval`, `timeout`, `delay_elements`) take a
//! [`Scheduler`] argument. A [`VirtualTimeScheduler`] stands in for the wall
//! clock in tests, and [`testing::StepVerifier`] scripts expectations against
//! it.
//!
//! Nothing in the library installs a `tracing` subscriber; the engine logs
//! retries, drops and scheduler lifecycle at `debug` and `trace` level.

#![warn(missing_docs)]

pub use crate::config::Config;
pub use crate::demand::{Demand, UNBOUNDED};
pub use crate::error::{ErrorKind, FluxError};
pub use crate::flux::{BlockingIter, ContinueHook, Flux, Publisher};
pub use crate::operator::GroupedFlux;
pub use crate::scheduler::{
    ImmediateScheduler, Scheduler, Schedulers, Task, TaskHandle, ThreadPoolScheduler,
    VirtualTimeScheduler, Worker,
};
pub use crate::signal::{Signal, SignalType};
pub use crate::sink::{BufferOverflowStrategy, BufferPolicy, FluxSink, OverflowStrategy};
pub use crate::source::SyncSink;
pub use crate::subscriber::{BoxSubscriber, Disposable, Subscriber, Subscription, SubscriptionRef};

pub mod config;
mod demand;
mod error;
mod flux;
mod lift;
mod operator;
mod outlet;
mod scheduler;
mod signal;
mod sink;
mod source;
mod subscriber;
pub mod testing;
