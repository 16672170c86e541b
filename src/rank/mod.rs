//! Time-windowed top-N ranking.
//!
//! A [`RankList`] periodically pulls a collection from a [`RankLister`],
//! scores every item with [`Rankable::average`], and caches the best
//! `max_size` items as an immutable snapshot. Readers always see a complete
//! snapshot; a stale one is rebuilt on access.

mod list;

pub use list::{RankList, rank_order};

use std::sync::Arc;

/// An item that can be scored over a metric and time window.
///
/// `metric` and `window` are opaque selectors interpreted by the
/// implementation.
pub trait Rankable {
    /// Average of `metric` over `window`.
    fn average(&self, metric: usize, window: usize) -> f64;
}

impl<R: Rankable + ?Sized> Rankable for &R {
    fn average(&self, metric: usize, window: usize) -> f64 {
        (**self).average(metric, window)
    }
}

impl<R: Rankable + ?Sized> Rankable for Arc<R> {
    fn average(&self, metric: usize, window: usize) -> f64 {
        (**self).average(metric, window)
    }
}

impl<R: Rankable + ?Sized> Rankable for Box<R> {
    fn average(&self, metric: usize, window: usize) -> f64 {
        (**self).average(metric, window)
    }
}

/// Supplies the full collection to rank.
///
/// Called with the rank list's lock held; it must not call back into the
/// same rank list.
pub trait RankLister<T>: Send + Sync {
    /// Returns the current collection.
    fn list(&self) -> Vec<T>;
}

impl<T, F> RankLister<T> for F
where
    F: Fn() -> Vec<T> + Send + Sync,
{
    fn list(&self) -> Vec<T> {
        self()
    }
}
