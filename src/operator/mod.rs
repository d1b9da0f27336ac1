//! Operator stages.
//!
//! Every operator is a method on [`Flux`](crate::Flux); the modules here
//! only group their implementations. Stateless stages (`map`, `filter`,
//! peeks, `take`, `buffer`) wrap the downstream subscriber. Stages fed by
//! several sources, or by a timer, funnel their output through an outlet.

mod buffer;
mod flat_map;
mod group_by;
mod map;
mod merge;
mod peek;
mod recover;
mod schedule;
mod sequential;
mod switch_map;
mod take;
mod time;
mod window;
mod zip;

pub use self::group_by::GroupedFlux;
