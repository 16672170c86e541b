//! Trace markers.
//!
//! A marker turns an ordinary record into the root of a named trace. It owns
//! the trace's budget and elision threshold and moves through a small
//! lifecycle:
//!
//! ```text
//! Active ──close root──► Finalizing ──┬─► Submitted
//!                                     └─► Discarded
//! ```

use crate::types::{SymbolId, Time};
use core::fmt;
use serde::Serialize;
use std::time::Duration;

/// Lifecycle state of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    /// The root record is still open.
    Active,
    /// The root closed and the keep/discard decision is being made.
    Finalizing,
    /// The trace was kept and handed to the sink.
    Submitted,
    /// The trace was shorter than its minimum duration and was dropped.
    Discarded,
}

impl TraceState {
    /// Returns true once no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Submitted | Self::Discarded)
    }
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Finalizing => "finalizing",
            Self::Submitted => "submitted",
            Self::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// Per-trace bookkeeping attached to a trace's root record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceMarker {
    trace_type: SymbolId,
    start_time: Time,
    min_duration: Duration,
    max_records: usize,
    record_count: usize,
    overflow: bool,
    state: TraceState,
}

impl TraceMarker {
    /// The root record is the first record charged against the budget.
    pub(crate) fn new(
        trace_type: SymbolId,
        start_time: Time,
        min_duration: Duration,
        max_records: usize,
    ) -> Self {
        Self {
            trace_type,
            start_time,
            min_duration,
            max_records: max_records.max(1),
            record_count: 1,
            overflow: false,
            state: TraceState::Active,
        }
    }

    /// Interned trace type.
    #[must_use]
    pub const fn trace_type(&self) -> SymbolId {
        self.trace_type
    }

    /// Timestamp at which the trace began.
    #[must_use]
    pub const fn start_time(&self) -> Time {
        self.start_time
    }

    /// Minimum duration for the trace to be kept, also the elision
    /// threshold for its non-root records.
    #[must_use]
    pub const fn min_duration(&self) -> Duration {
        self.min_duration
    }

    /// Record budget captured when the trace began.
    #[must_use]
    pub const fn max_records(&self) -> usize {
        self.max_records
    }

    /// Records held against the budget, root included: every retained record
    /// plus the admitted records that are still open. Once the root closes
    /// this equals the number of records in the finished tree.
    #[must_use]
    pub const fn record_count(&self) -> usize {
        self.record_count
    }

    /// True once a record that would have been retained was refused for
    /// exceeding the budget.
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TraceState {
        self.state
    }

    /// Duration of the trace in nanoseconds if it ends at `exit`.
    #[must_use]
    pub fn duration_at(&self, exit: Time) -> u64 {
        exit.duration_since(self.start_time)
    }

    /// Reserves budget for a newly opened record. Returns false when the
    /// budget is spent.
    pub(crate) fn try_charge(&mut self) -> bool {
        if self.record_count >= self.max_records {
            return false;
        }
        self.record_count += 1;
        true
    }

    /// Returns the reservation of a record that ended up not retained.
    pub(crate) fn refund(&mut self) {
        debug_assert!(self.record_count > 1, "refund would release the root");
        self.record_count = self.record_count.saturating_sub(1).max(1);
    }

    pub(crate) fn mark_overflow(&mut self) {
        self.overflow = true;
    }

    /// Returns true if a trace ending at `exit` is long enough to keep.
    pub(crate) fn qualifies(&self, exit: Time) -> bool {
        u128::from(self.duration_at(exit)) >= self.min_duration.as_nanos()
    }

    pub(crate) fn set_state(&mut self, state: TraceState) {
        debug_assert!(!self.state.is_terminal(), "trace state already final");
        self.state = state;
    }
}
