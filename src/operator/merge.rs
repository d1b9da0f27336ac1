//! Combining whole streams.

use crate::flux::Flux;

impl<T: Send + 'static> Flux<T> {
    /// Subscribe to all `sources` at once and relay their items as they
    /// arrive. Completes when every source completed; the first error
    /// cancels the remaining sources.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let merged = Flux::merge(vec![Flux::range(0, 3), Flux::range(10, 3)]);
    /// let mut all = merged.collect_list().block_last().unwrap().unwrap();
    /// all.sort();
    /// assert_eq!(all, vec![0, 1, 2, 10, 11, 12]);
    /// ```
    pub fn merge(sources: Vec<Flux<T>>) -> Flux<T> {
        let concurrency = sources.len().max(1);
        Flux::from_iter(sources).flat_map_with(|source| source, concurrency)
    }

    /// Merge this stream with `other`.
    pub fn merge_with(&self, other: Flux<T>) -> Flux<T> {
        Flux::merge(vec![self.clone(), other])
    }

    /// Relay `sources` one after another. Each source is subscribed only
    /// once the previous one completed.
    ///
    /// ```
    /// # use rivulet::Flux;
    /// let joined = Flux::concat(vec![Flux::range(0, 2), Flux::just(9)]);
    /// assert_eq!(joined.collect_list().block_last().unwrap(), Some(vec![0, 1, 9]));
    /// ```
    pub fn concat(sources: Vec<Flux<T>>) -> Flux<T> {
        Flux::from_iter(sources).concat_map(|source| source)
    }

    /// Relay `other` after this stream completed.
    pub fn concat_with(&self, other: Flux<T>) -> Flux<T> {
        Flux::concat(vec![self.clone(), other])
    }
}
