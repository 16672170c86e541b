//! Cached top-N list.

use super::{RankLister, Rankable};
use crate::time::{TimeSource, WallClock};
use crate::tracing_compat::trace;
use crate::types::Time;
use core::cmp::Ordering;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Orders scores descending, with NaN after every number.
///
/// Equal scores compare equal; their relative order after sorting is
/// unspecified.
#[must_use]
pub fn rank_order(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

struct RankState<T> {
    ranked: Arc<[T]>,
    last_rerank: Option<Time>,
    reranks: u64,
}

/// A top-N view over a collection, rebuilt at most once per interval.
///
/// # Example
///
/// ```
/// use calltrace::rank::{RankList, Rankable};
/// use std::time::Duration;
///
/// #[derive(Clone)]
/// struct Endpoint(&'static str, f64);
///
/// impl Rankable for Endpoint {
///     fn average(&self, _metric: usize, _window: usize) -> f64 {
///         self.1
///     }
/// }
///
/// let list = RankList::new(
///     || vec![Endpoint("a", 1.0), Endpoint("b", 5.0), Endpoint("c", 3.0)],
///     2,
///     0,
///     0,
///     Duration::from_secs(1),
/// );
/// let top: Vec<_> = list.list().iter().map(|e| e.0).collect();
/// assert_eq!(top, ["b", "c"]);
/// ```
pub struct RankList<T> {
    lister: Box<dyn RankLister<T>>,
    clock: Arc<dyn TimeSource>,
    max_size: usize,
    metric: usize,
    window: usize,
    rerank_interval: Duration,
    state: Mutex<RankState<T>>,
}

impl<T> core::fmt::Debug for RankList<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RankList")
            .field("max_size", &self.max_size)
            .field("metric", &self.metric)
            .field("window", &self.window)
            .field("rerank_interval", &self.rerank_interval)
            .field("len", &state.ranked.len())
            .field("last_rerank", &state.last_rerank)
            .field("reranks", &state.reranks)
            .finish_non_exhaustive()
    }
}

impl<T> RankList<T>
where
    T: Rankable + Clone + Send + Sync + 'static,
{
    /// Creates a list ranking `lister`'s items by `metric` over `window`,
    /// keeping the best `max_size`, using the wall clock.
    pub fn new(
        lister: impl RankLister<T> + 'static,
        max_size: usize,
        metric: usize,
        window: usize,
        rerank_interval: Duration,
    ) -> Self {
        Self {
            lister: Box::new(lister),
            clock: Arc::new(WallClock::new()),
            max_size,
            metric,
            window,
            rerank_interval,
            state: Mutex::new(RankState {
                ranked: Arc::from(Vec::new()),
                last_rerank: None,
                reranks: 0,
            }),
        }
    }

    /// Replaces the clock used to decide staleness.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the item at `index` of the ranking, best first.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        self.snapshot().get(index).cloned()
    }

    /// Returns the whole ranking, best first.
    #[must_use]
    pub fn list(&self) -> Arc<[T]> {
        self.snapshot()
    }

    /// Number of ranked items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Returns true if the ranking is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reranks so far. Does not trigger one.
    #[must_use]
    pub fn rerank_count(&self) -> u64 {
        self.state.lock().reranks
    }

    /// Time of the last rerank. Does not trigger one.
    #[must_use]
    pub fn last_rerank(&self) -> Option<Time> {
        self.state.lock().last_rerank
    }

    /// Maximum number of items kept.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn snapshot(&self) -> Arc<[T]> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        if self.is_stale(&state, now) {
            self.rerank(&mut state, now);
        }
        Arc::clone(&state.ranked)
    }

    fn is_stale(&self, state: &RankState<T>, now: Time) -> bool {
        match state.last_rerank {
            None => true,
            Some(_) if self.rerank_interval.is_zero() => true,
            Some(last) => now > last + self.rerank_interval,
        }
    }

    fn rerank(&self, state: &mut RankState<T>, now: Time) {
        let mut scored: Vec<(f64, T)> = self
            .lister
            .list()
            .into_iter()
            .map(|item| (item.average(self.metric, self.window), item))
            .collect();

        if self.max_size == 0 {
            scored.clear();
        } else if scored.len() > self.max_size {
            scored.select_nth_unstable_by(self.max_size - 1, |a, b| rank_order(a.0, b.0));
            scored.truncate(self.max_size);
        }
        scored.sort_unstable_by(|a, b| rank_order(a.0, b.0));

        state.ranked = scored.into_iter().map(|(_, item)| item).collect();
        state.last_rerank = Some(now);
        state.reranks += 1;
        trace!(
            kept = state.ranked.len(),
            reranks = state.reranks,
            "rank list reranked"
        );
    }
}

impl<T> RankLister<T> for RankList<T>
where
    T: Rankable + Clone + Send + Sync + 'static,
{
    fn list(&self) -> Vec<T> {
        self.snapshot().to_vec()
    }
}
