//! Per-thread trace builder.
//!
//! The builder consumes the enter/exit event stream of one thread and turns it
//! into call trees. It keeps a stack of open records; a record becomes the
//! root of a trace when [`TraceBuilder::begin`] marks it, and the tree is
//! finalized when that root closes.
//!
//! Records live in a slab while the trace is being built. Closing a record
//! either links it into its parent's child list (retained) or folds its call
//! count into the parent and frees its slot (elided). Three rules decide:
//!
//! - A non-root record that returned faster than the trace's minimum duration
//!   is elided, unless it failed or still carries retained children.
//! - A record refused by the trace's record budget is elided. If it would
//!   otherwise have been retained, the trace is flagged as overflowed.
//! - A record closed outside any trace is dropped.
//!
//! The budget counts retained records. An admitted record reserves one unit
//! while it is open and gives it back if it is elided, so folded calls never
//! use up the budget.
//!
//! Nested traces get their own budget and their own lifecycle. A nested
//! trace that qualifies is submitted on its own when its root closes; either
//! way its call count is folded into the enclosing record.
//!
//! A builder is single-threaded by construction: every method takes
//! `&mut self`, and sharing one across threads needs external locking.

use super::marker::{TraceMarker, TraceState};
use super::record::{AttrValue, CapturedError, Outcome, RecordFlags, TraceRecord};
use super::sink::TraceSink;
use super::tree::TraceTree;
use crate::config::TracerSettings;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{RecordId, SymbolId, Time};
use slab::Slab;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;

/// Counters describing what a builder has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuilderStats {
    /// Records entered.
    pub records_entered: u64,
    /// Traces begun.
    pub traces_begun: u64,
    /// Traces handed to the sink, nested ones included.
    pub traces_submitted: u64,
    /// Submitted traces that were begun inside another active trace.
    pub nested_traces_submitted: u64,
    /// Traces dropped for being shorter than their minimum duration.
    pub traces_discarded: u64,
    /// Records elided for returning faster than the minimum duration.
    pub records_elided_short: u64,
    /// Records that would have been retained but were refused because their
    /// trace's budget was spent.
    pub records_elided_overflow: u64,
    /// Records closed while no trace was active.
    pub stray_records: u64,
    /// `begin` calls ignored because there was no open record, or the record
    /// already carried a marker.
    pub ignored_begins: u64,
    /// `exit`/`error`/`set_attr` calls ignored on an empty stack.
    pub unbalanced_events: u64,
}

/// Where a builder reads its budget and default threshold from.
#[derive(Debug, Clone)]
pub(crate) enum SettingsSource {
    Global,
    Shared(Arc<TracerSettings>),
}

impl SettingsSource {
    pub(crate) fn get(&self) -> &TracerSettings {
        match self {
            Self::Global => TracerSettings::global(),
            Self::Shared(settings) => settings,
        }
    }
}

/// How an open record stands against the budget of the innermost trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Entered while no trace was active.
    Untraced,
    /// Holds one unit of the innermost trace's budget.
    Charged,
    /// Entered after the innermost trace's budget was spent.
    Refused,
    /// Roots a trace of its own.
    TraceRoot,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    slot: usize,
    admission: Admission,
}

/// Builds call trees from one thread's enter/exit events.
///
/// # Example
///
/// ```
/// use calltrace::trace::{CollectingSink, TraceBuilder};
/// use calltrace::types::{SymbolId, Time};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let sink = Arc::new(CollectingSink::new());
/// let mut builder = TraceBuilder::new(sink.clone());
/// let (class, method, sig) = (SymbolId::new(1), SymbolId::new(2), SymbolId::new(3));
///
/// builder.enter(class, method, sig, Time::from_millis(100));
/// builder.begin(SymbolId::new(4), Duration::ZERO, Time::from_millis(100));
/// builder.exit(Time::from_millis(200));
///
/// let traces = sink.take();
/// assert_eq!(traces.len(), 1);
/// assert_eq!(traces[0].duration_nanos(), Some(100_000_000));
/// ```
pub struct TraceBuilder {
    records: Slab<TraceRecord>,
    stack: Vec<Frame>,
    /// Slots of the roots of active traces, innermost last.
    traces: SmallVec<[usize; 4]>,
    sink: Arc<dyn TraceSink>,
    settings: SettingsSource,
    stats: BuilderStats,
    last_event: Time,
}

impl core::fmt::Debug for TraceBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TraceBuilder")
            .field("depth", &self.stack.len())
            .field("active_traces", &self.traces.len())
            .field("live_records", &self.records.len())
            .field("stats", &self.stats)
            .field("last_event", &self.last_event)
            .finish_non_exhaustive()
    }
}

impl TraceBuilder {
    /// Creates a builder that reads its settings from the process-wide
    /// [`TracerSettings::global`].
    #[must_use]
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self::from_source(sink, SettingsSource::Global)
    }

    /// Creates a builder bound to a specific settings instance.
    #[must_use]
    pub fn with_settings(sink: Arc<dyn TraceSink>, settings: Arc<TracerSettings>) -> Self {
        Self::from_source(sink, SettingsSource::Shared(settings))
    }

    pub(crate) fn from_source(sink: Arc<dyn TraceSink>, settings: SettingsSource) -> Self {
        Self {
            records: Slab::new(),
            stack: Vec::new(),
            traces: SmallVec::new(),
            sink,
            settings,
            stats: BuilderStats::default(),
            last_event: Time::ZERO,
        }
    }

    /// Opens a record for a method invocation.
    pub fn enter(
        &mut self,
        class_id: SymbolId,
        method_id: SymbolId,
        signature_id: SymbolId,
        timestamp: Time,
    ) {
        self.last_event = timestamp;
        self.stats.records_entered += 1;

        let parent = self.stack.last().map(|f| RecordId::from_index(f.slot));
        let admission = self.charge_innermost();
        let record = TraceRecord::open(class_id, method_id, signature_id, timestamp, parent);
        let slot = self.records.insert(record);
        self.stack.push(Frame { slot, admission });
    }

    /// Marks the innermost open record as the root of a trace of type
    /// `trace_type` that is kept only if it lasts at least `min_duration`.
    ///
    /// Ignored when no record is open or the record already roots a trace.
    pub fn begin(&mut self, trace_type: SymbolId, min_duration: Duration, timestamp: Time) {
        self.last_event = timestamp;
        let Some(frame) = self.stack.last().copied() else {
            debug!(?trace_type, "begin ignored: no open record");
            self.stats.ignored_begins += 1;
            return;
        };
        if frame.admission == Admission::TraceRoot {
            debug!(?trace_type, "begin ignored: record already roots a trace");
            self.stats.ignored_begins += 1;
            return;
        }

        // The record leaves the enclosing trace's tree, so it no longer holds
        // that trace's budget.
        if frame.admission == Admission::Charged {
            self.refund_innermost();
        }
        let max_records = self.settings.get().max_trace_records();
        self.records[frame.slot].set_marker(TraceMarker::new(
            trace_type,
            timestamp,
            min_duration,
            max_records,
        ));
        if let Some(top) = self.stack.last_mut() {
            top.admission = Admission::TraceRoot;
        }
        self.traces.push(frame.slot);
        self.stats.traces_begun += 1;
        trace!(
            ?trace_type,
            depth = self.stack.len(),
            nested = self.traces.len() > 1,
            "trace begun"
        );
    }

    /// Like [`begin`](Self::begin) with the configured default minimum
    /// duration.
    pub fn begin_default(&mut self, trace_type: SymbolId, timestamp: Time) {
        let min_duration = self.settings.get().min_trace_time();
        self.begin(trace_type, min_duration, timestamp);
    }

    /// Closes the innermost open record with a normal return.
    pub fn exit(&mut self, timestamp: Time) {
        self.close(Outcome::Returned { exit: timestamp });
    }

    /// Closes the innermost open record with a captured failure.
    pub fn error(&mut self, error: CapturedError, timestamp: Time) {
        self.close(Outcome::Failed {
            exit: timestamp,
            error: Box::new(error),
        });
    }

    /// Appends an attribute to the innermost open record.
    pub fn set_attr(&mut self, key: SymbolId, value: impl Into<AttrValue>, timestamp: Time) {
        self.last_event = timestamp;
        let Some(frame) = self.stack.last() else {
            warn!(?key, "attribute ignored: no open record");
            self.stats.unbalanced_events += 1;
            return;
        };
        self.records[frame.slot].push_attr(key, value.into());
    }

    /// Number of open records.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// True when no record is open.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// True while at least one trace is active.
    #[must_use]
    pub fn in_trace(&self) -> bool {
        !self.traces.is_empty()
    }

    /// Number of active traces, counting nested ones.
    #[must_use]
    pub fn active_traces(&self) -> usize {
        self.traces.len()
    }

    /// The innermost open record.
    #[must_use]
    pub fn top(&self) -> Option<&TraceRecord> {
        self.stack.last().map(|f| &self.records[f.slot])
    }

    /// The parent of the innermost open record.
    #[must_use]
    pub fn parent_of_top(&self) -> Option<&TraceRecord> {
        let parent = self.top()?.parent()?;
        self.records.get(parent.index())
    }

    /// The marker of the innermost active trace.
    #[must_use]
    pub fn current_marker(&self) -> Option<&TraceMarker> {
        let root = *self.traces.last()?;
        self.records.get(root)?.marker()
    }

    /// Records currently held in memory, open or awaiting finalization.
    #[must_use]
    pub fn live_records(&self) -> usize {
        self.records.len()
    }

    /// Timestamp of the last event seen.
    #[must_use]
    pub fn last_event_time(&self) -> Time {
        self.last_event
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &BuilderStats {
        &self.stats
    }

    /// Reserves budget for a new record in the innermost active trace.
    fn charge_innermost(&mut self) -> Admission {
        let Some(&root) = self.traces.last() else {
            return Admission::Untraced;
        };
        let admitted = self.records[root]
            .marker_mut()
            .is_none_or(TraceMarker::try_charge);
        if admitted {
            Admission::Charged
        } else {
            Admission::Refused
        }
    }

    fn refund_innermost(&mut self) {
        if let Some(&root) = self.traces.last() {
            if let Some(marker) = self.records[root].marker_mut() {
                marker.refund();
            }
        }
    }

    /// Flags the innermost trace after it refused a record worth keeping.
    fn overflow_innermost(&mut self) {
        if let Some(&root) = self.traces.last() {
            let record = &mut self.records[root];
            record.flags_mut().insert(RecordFlags::OVERFLOW);
            if let Some(marker) = record.marker_mut() {
                marker.mark_overflow();
            }
        }
    }

    fn close(&mut self, outcome: Outcome) {
        let exit = outcome.exit().unwrap_or(self.last_event);
        self.last_event = exit;
        let Some(frame) = self.stack.pop() else {
            warn!(exit = %exit, "close ignored: no open record");
            self.stats.unbalanced_events += 1;
            return;
        };

        self.records[frame.slot].close(outcome);
        if frame.admission == Admission::TraceRoot {
            self.finish_trace(frame.slot, exit);
            return;
        }

        let Some(&root) = self.traces.last() else {
            self.free_subtree(frame.slot);
            self.stats.stray_records += 1;
            return;
        };
        // Inside a trace the record sits above the trace root, so it has an
        // open parent.
        let Some(parent) = self.stack.last().copied() else {
            self.free_subtree(frame.slot);
            return;
        };

        let record = &self.records[frame.slot];
        let call_count = record.call_count();
        let keeps_detail = record.outcome().is_failed() || !record.children().is_empty();
        let duration = u128::from(record.duration_nanos().unwrap_or(0));
        let min_duration = self.records[root]
            .marker()
            .map_or(Duration::ZERO, TraceMarker::min_duration);
        let worth_keeping = keeps_detail || duration >= min_duration.as_nanos();

        self.records[parent.slot].add_calls(call_count);
        match (frame.admission, worth_keeping) {
            (Admission::Charged, true) => {
                self.records[parent.slot].push_child(RecordId::from_index(frame.slot));
            }
            (Admission::Charged, false) => {
                self.free_subtree(frame.slot);
                self.refund_innermost();
                self.stats.records_elided_short += 1;
            }
            (Admission::Refused, true) => {
                self.free_subtree(frame.slot);
                self.overflow_innermost();
                self.stats.records_elided_overflow += 1;
            }
            (_, false) => {
                self.free_subtree(frame.slot);
                self.stats.records_elided_short += 1;
            }
            (Admission::Untraced | Admission::TraceRoot, true) => {
                self.free_subtree(frame.slot);
            }
        }
    }

    /// Finalizes the trace rooted at `slot`, whose record has just closed.
    #[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
    fn finish_trace(&mut self, slot: usize, exit: Time) {
        let popped = self.traces.pop();
        debug_assert_eq!(popped, Some(slot), "trace roots closed out of order");

        let parent = self.stack.last().copied();
        let enclosed = !self.traces.is_empty();
        let record = &mut self.records[slot];
        let call_count = record.call_count();
        let Some(marker) = record.marker_mut() else {
            return;
        };
        marker.set_state(TraceState::Finalizing);
        let keep = marker.qualifies(exit);
        let trace_type = marker.trace_type();
        let duration = marker.duration_at(exit);

        if let Some(parent) = parent {
            self.records[parent.slot].add_calls(call_count);
        }

        if !keep {
            if let Some(marker) = self.records[slot].marker_mut() {
                marker.set_state(TraceState::Discarded);
            }
            self.free_subtree(slot);
            self.stats.traces_discarded += 1;
            trace!(?trace_type, duration, "trace discarded");
            return;
        }

        if let Some(marker) = self.records[slot].marker_mut() {
            marker.set_state(TraceState::Submitted);
        }
        let tree = self.extract(slot);
        self.stats.traces_submitted += 1;
        if enclosed {
            self.stats.nested_traces_submitted += 1;
        }
        debug!(
            ?trace_type,
            duration,
            nested = enclosed,
            records = tree.len(),
            "trace submitted"
        );
        self.sink.submit(tree);
    }

    /// Moves the subtree rooted at `slot` out of the slab into a pre-order
    /// tree.
    fn extract(&mut self, slot: usize) -> TraceTree {
        let mut records = Vec::new();
        let mut pending: Vec<(usize, Option<usize>)> = vec![(slot, None)];
        while let Some((slot, parent)) = pending.pop() {
            let Some(mut record) = self.records.try_remove(slot) else {
                continue;
            };
            let index = records.len();
            record.set_parent(parent.map(RecordId::from_index));
            let children = record.take_children();
            if let Some(parent) = parent {
                let parent: &mut TraceRecord = &mut records[parent];
                parent.push_child(RecordId::from_index(index));
            }
            records.push(record);
            pending.extend(children.iter().rev().map(|c| (c.index(), Some(index))));
        }
        TraceTree::from_preorder(records)
    }

    fn free_subtree(&mut self, slot: usize) {
        let mut pending = vec![slot];
        while let Some(slot) = pending.pop() {
            if let Some(mut record) = self.records.try_remove(slot) {
                pending.extend(record.take_children().iter().map(|c| c.index()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::test_utils::{ActionRecorder, init_test_logging, ms};
    use crate::trace::sink::CollectingSink;

    const C1: SymbolId = SymbolId::new(1);
    const M1: SymbolId = SymbolId::new(2);
    const M2: SymbolId = SymbolId::new(3);
    const SIG: SymbolId = SymbolId::new(4);
    const T1: SymbolId = SymbolId::new(5);
    const A1: SymbolId = SymbolId::new(6);
    const A2: SymbolId = SymbolId::new(7);

    fn builder(max_records: usize) -> (TraceBuilder, Arc<CollectingSink>) {
        init_test_logging();
        let sink = Arc::new(CollectingSink::new());
        let settings = Arc::new(TracerSettings::new(
            TracerConfig::default().with_max_trace_records(max_records),
        ));
        let b = TraceBuilder::with_settings(sink.clone(), settings);
        (b, sink)
    }

    fn only_trace(sink: &CollectingSink) -> TraceTree {
        let mut traces = sink.take();
        assert_eq!(traces.len(), 1, "expected exactly one trace");
        traces.remove(0)
    }

    fn actions(tree: &TraceTree) -> Vec<String> {
        let mut recorder = ActionRecorder::default();
        tree.walk(&mut recorder);
        recorder.into_actions()
    }

    #[test]
    fn single_method_call() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(100));
        b.begin(T1, Duration::ZERO, ms(100));
        b.exit(ms(200));

        let tree = only_trace(&sink);
        assert_eq!(
            actions(&tree),
            ["traceBegin", "traceEnter", "traceStats", "traceReturn"]
        );
        let root = tree.root();
        assert_eq!(root.entry(), ms(100));
        assert_eq!(root.exit(), Some(ms(200)));
        assert_eq!(root.call_count(), 1);
        assert!(root.flags().contains(RecordFlags::TRACE_BEGIN));
        assert_eq!(tree.marker().map(TraceMarker::state), Some(TraceState::Submitted));
        assert!(b.is_idle());
        assert_eq!(b.live_records(), 0);
    }

    #[test]
    fn single_call_with_attributes() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(10));
        b.begin(T1, Duration::ZERO, ms(10));
        b.set_attr(A1, "some val", ms(20));
        b.set_attr(A2, "other val", ms(30));
        b.exit(ms(40));

        let tree = only_trace(&sink);
        assert_eq!(
            actions(&tree),
            [
                "traceBegin",
                "traceEnter",
                "traceStats",
                "newAttr",
                "newAttr",
                "traceReturn"
            ]
        );
        assert_eq!(tree.root().attr(A1), Some(&AttrValue::from("some val")));
        assert_eq!(tree.root().attr(A2), Some(&AttrValue::from("other val")));
    }

    #[test]
    fn single_call_with_error() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(100));
        b.begin(T1, Duration::ZERO, ms(100));
        b.error(CapturedError::new("PaymentDeclined", "card expired"), ms(200));

        let tree = only_trace(&sink);
        assert_eq!(
            actions(&tree),
            ["traceBegin", "traceEnter", "traceStats", "traceError"]
        );
        assert_eq!(
            tree.root().error().map(CapturedError::message),
            Some("card expired")
        );
    }

    #[test]
    fn nested_call_is_kept() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(100));
        b.begin(T1, Duration::ZERO, ms(100));
        b.enter(C1, M2, SIG, ms(110));
        b.exit(ms(190));
        b.exit(ms(200));

        let tree = only_trace(&sink);
        assert_eq!(
            actions(&tree),
            [
                "traceBegin",
                "traceEnter",
                "traceStats",
                "traceEnter",
                "traceStats",
                "traceReturn",
                "traceReturn"
            ]
        );
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.root().call_count(), 2);
        let child = tree.children(RecordId::ROOT).next().expect("child");
        assert_eq!(child.method_id(), M2);
        assert_eq!(child.parent(), Some(RecordId::ROOT));
    }

    #[test]
    fn short_children_are_elided_but_counted() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(10), ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.exit(ms(2));
        b.enter(C1, M2, SIG, ms(3));
        b.exit(ms(20));
        b.exit(ms(100));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.root().call_count(), 3);
        let kept = tree.children(RecordId::ROOT).next().expect("child");
        assert_eq!(kept.entry(), ms(3));
        assert_eq!(b.stats().records_elided_short, 1);
    }

    #[test]
    fn child_at_exact_threshold_is_kept() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(10), ms(0));
        b.enter(C1, M2, SIG, ms(5));
        b.exit(ms(15));
        b.exit(ms(50));

        assert_eq!(only_trace(&sink).len(), 2);
    }

    #[test]
    fn failed_children_are_never_elided() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(10), ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.error(CapturedError::new("E", "fast failure"), ms(2));
        b.exit(ms(100));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.failures().count(), 1);
    }

    #[test]
    fn short_parent_of_failure_is_kept() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(10), ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.enter(C1, M2, SIG, ms(2));
        b.error(CapturedError::new("E", "deep"), ms(3));
        b.exit(ms(4));
        b.exit(ms(100));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.root().call_count(), 3);
    }

    #[test]
    fn short_trace_is_discarded() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(100));
        b.begin(T1, Duration::from_millis(50), ms(100));
        b.exit(ms(120));

        assert!(sink.is_empty());
        assert_eq!(b.stats().traces_discarded, 1);
        assert_eq!(b.live_records(), 0);
    }

    #[test]
    fn trace_duration_counts_from_begin() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(50), ms(60));
        b.exit(ms(100));
        // 100ms since entry, but only 40ms since begin.
        assert!(sink.is_empty());
    }

    #[test]
    fn overflow_elides_and_flags() {
        let (mut b, sink) = builder(3);
        crate::test_phase!("overflow_elides_and_flags");
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        for i in 0..5 {
            b.enter(C1, M2, SIG, ms(10 + i * 10));
            b.exit(ms(15 + i * 10));
        }
        b.exit(ms(100));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 3);
        assert!(tree.is_overflow());
        assert_eq!(tree.root().call_count(), 6);
        let marker = tree.marker().expect("marker");
        assert!(marker.is_overflow());
        assert_eq!(marker.record_count(), 3);
        assert_eq!(b.stats().records_elided_overflow, 3);
        crate::test_complete!("overflow_elides_and_flags", retained = tree.len());
    }

    #[test]
    fn stray_records_are_dropped() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.exit(ms(2));
        assert_eq!(b.stats().stray_records, 1);
        assert_eq!(b.depth(), 1);

        b.begin(T1, Duration::ZERO, ms(3));
        b.exit(ms(10));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root().method_id(), M1);
    }

    #[test]
    fn begin_on_empty_stack_is_ignored() {
        let (mut b, sink) = builder(4096);
        b.begin(T1, Duration::ZERO, ms(0));
        assert!(!b.in_trace());
        assert_eq!(b.stats().ignored_begins, 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn second_begin_on_same_record_is_ignored() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        b.begin(A1, Duration::from_secs(10), ms(1));
        assert_eq!(b.active_traces(), 1);
        b.exit(ms(5));

        let tree = only_trace(&sink);
        assert_eq!(tree.trace_type(), Some(T1));
        assert_eq!(b.stats().ignored_begins, 1);
    }

    #[test]
    fn exit_on_empty_stack_is_ignored() {
        let (mut b, sink) = builder(4096);
        b.exit(ms(1));
        b.error(CapturedError::new("E", "x"), ms(2));
        b.set_attr(A1, 1_i64, ms(3));
        assert_eq!(b.stats().unbalanced_events, 3);
        assert!(b.is_idle());
        assert!(sink.is_empty());
    }

    #[test]
    fn fast_calls_do_not_spend_the_budget() {
        let (mut b, sink) = builder(3);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(10), ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.exit(ms(1));
        b.enter(C1, M2, SIG, ms(2));
        b.exit(ms(2));
        b.enter(C1, M2, SIG, ms(3));
        b.exit(ms(43));
        b.exit(ms(100));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 2);
        assert!(!tree.is_overflow());
        assert_eq!(tree.root().call_count(), 4);
        assert_eq!(tree.marker().map(TraceMarker::record_count), Some(2));
        assert_eq!(b.stats().records_elided_short, 2);
        assert_eq!(b.stats().records_elided_overflow, 0);
    }

    #[test]
    fn refused_short_records_do_not_flag_overflow() {
        let (mut b, sink) = builder(2);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(10), ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.enter(C1, M2, SIG, ms(2)); // refused
        b.exit(ms(3));
        b.exit(ms(50));
        b.exit(ms(100));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 2);
        assert!(!tree.is_overflow());
        assert_eq!(tree.root().call_count(), 3);
        assert_eq!(b.stats().records_elided_short, 1);
    }

    #[test]
    fn nested_trace_is_submitted_on_its_own() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        b.enter(C1, M2, SIG, ms(10));
        b.begin(A1, Duration::ZERO, ms(10));
        b.enter(C1, M2, SIG, ms(20));
        b.exit(ms(30));
        b.exit(ms(40));
        assert_eq!(b.active_traces(), 1);
        assert_eq!(sink.len(), 1);
        b.exit(ms(50));

        let traces = sink.take();
        assert_eq!(traces.len(), 2);
        let nested = &traces[0];
        assert_eq!(nested.trace_type(), Some(A1));
        assert_eq!(nested.len(), 2);
        assert_eq!(nested.root().call_count(), 2);
        assert!(nested.root().parent().is_none());
        assert_eq!(nested.marker().map(TraceMarker::state), Some(TraceState::Submitted));

        let outer = &traces[1];
        assert_eq!(outer.trace_type(), Some(T1));
        assert_eq!(outer.len(), 1);
        assert_eq!(outer.root().call_count(), 3);
        assert_eq!(outer.marker().map(TraceMarker::record_count), Some(1));
        assert_eq!(
            actions(outer),
            ["traceBegin", "traceEnter", "traceStats", "traceReturn"]
        );
        assert_eq!(b.stats().traces_submitted, 2);
        assert_eq!(b.stats().nested_traces_submitted, 1);
    }

    #[test]
    fn nested_trace_outlives_a_discarded_outer_trace() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::from_millis(1000), ms(0));
        b.enter(C1, M2, SIG, ms(10));
        b.begin(A1, Duration::from_millis(10), ms(10));
        b.exit(ms(40));
        b.exit(ms(50));

        let tree = only_trace(&sink);
        assert_eq!(tree.trace_type(), Some(A1));
        assert_eq!(tree.duration_nanos(), Some(30_000_000));
        assert_eq!(b.stats().traces_discarded, 1);
        assert_eq!(b.stats().traces_submitted, 1);
        assert_eq!(b.live_records(), 0);
    }

    #[test]
    fn short_nested_trace_is_folded() {
        let (mut b, sink) = builder(4096);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        b.enter(C1, M2, SIG, ms(10));
        b.begin(A1, Duration::from_millis(100), ms(10));
        b.enter(C1, M2, SIG, ms(11));
        b.exit(ms(12));
        b.exit(ms(20));
        b.exit(ms(50));

        let tree = only_trace(&sink);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root().call_count(), 3);
        assert_eq!(b.stats().traces_discarded, 1);
    }

    #[test]
    fn nested_trace_has_its_own_budget() {
        let (mut b, sink) = builder(2);
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        b.enter(C1, M2, SIG, ms(1));
        // The outer budget is now spent; this record is refused until it
        // roots a trace of its own.
        b.enter(C1, M2, SIG, ms(2));
        b.begin(A1, Duration::ZERO, ms(2));
        b.enter(C1, M2, SIG, ms(3));
        b.exit(ms(4));
        b.exit(ms(5));
        b.exit(ms(6));
        b.exit(ms(7));

        let traces = sink.take();
        assert_eq!(traces.len(), 2);
        let (nested, outer) = (&traces[0], &traces[1]);
        assert_eq!(nested.trace_type(), Some(A1));
        assert_eq!(nested.len(), 2);
        assert!(!nested.is_overflow());
        assert_eq!(outer.len(), 2);
        assert!(!outer.is_overflow());
        assert_eq!(outer.root().call_count(), 4);
    }

    #[test]
    fn nested_trace_inside_an_overflowed_trace_gets_a_fresh_budget() {
        let (mut b, sink) = builder(2);
        crate::test_phase!("nested_trace_inside_an_overflowed_trace_gets_a_fresh_budget");
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        b.enter(C1, M2, SIG, ms(1));
        b.exit(ms(2));
        b.enter(C1, M2, SIG, ms(3)); // refused
        b.enter(C1, M2, SIG, ms(4)); // refused, becomes nested root
        b.begin(A1, Duration::ZERO, ms(4));
        b.enter(C1, M2, SIG, ms(5));
        b.exit(ms(6));
        crate::test_section!("unwind");
        b.exit(ms(7));
        assert_eq!(b.current_marker().map(TraceMarker::record_count), Some(2));
        b.exit(ms(8));
        b.exit(ms(9));

        let traces = sink.take();
        assert_eq!(traces.len(), 2);
        let (nested, outer) = (&traces[0], &traces[1]);
        assert_eq!(nested.trace_type(), Some(A1));
        assert_eq!(nested.len(), 2);
        assert!(!nested.is_overflow());

        assert_eq!(outer.trace_type(), Some(T1));
        assert!(outer.is_overflow());
        assert_eq!(outer.len(), 2);
        assert_eq!(outer.marker().map(TraceMarker::record_count), Some(2));
        assert_eq!(outer.root().call_count(), 5);
        assert_eq!(b.stats().records_elided_overflow, 1);
        crate::test_complete!(
            "nested_trace_inside_an_overflowed_trace_gets_a_fresh_budget",
            submitted = traces.len()
        );
    }

    #[test]
    fn diagnostics_track_the_stack() {
        let (mut b, _sink) = builder(4096);
        assert!(b.top().is_none());
        b.enter(C1, M1, SIG, ms(0));
        b.begin(T1, Duration::ZERO, ms(0));
        b.enter(C1, M2, SIG, ms(1));

        assert_eq!(b.depth(), 2);
        assert!(b.in_trace());
        assert_eq!(b.top().map(TraceRecord::method_id), Some(M2));
        assert_eq!(b.parent_of_top().map(TraceRecord::method_id), Some(M1));
        assert_eq!(b.current_marker().map(TraceMarker::record_count), Some(2));
        assert_eq!(b.last_event_time(), ms(1));
        assert_eq!(b.live_records(), 2);
    }

    #[test]
    fn begin_default_uses_configured_threshold() {
        init_test_logging();
        let sink = Arc::new(CollectingSink::new());
        let settings = Arc::new(TracerSettings::new(
            TracerConfig::default().with_min_trace_time(Duration::from_millis(30)),
        ));
        let mut b = TraceBuilder::with_settings(sink.clone(), Arc::clone(&settings));

        b.enter(C1, M1, SIG, ms(0));
        b.begin_default(T1, ms(0));
        b.exit(ms(20));
        assert!(sink.is_empty());

        settings.set_min_trace_time(Duration::from_millis(10));
        b.enter(C1, M1, SIG, ms(100));
        b.begin_default(T1, ms(100));
        b.exit(ms(120));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn slots_are_reused_across_traces() {
        let (mut b, sink) = builder(4096);
        for round in 0..10 {
            let base = round * 100;
            b.enter(C1, M1, SIG, ms(base));
            b.begin(T1, Duration::ZERO, ms(base));
            b.enter(C1, M2, SIG, ms(base + 1));
            b.exit(ms(base + 2));
            b.exit(ms(base + 3));
            assert_eq!(b.live_records(), 0);
        }
        assert_eq!(sink.len(), 10);
        assert_eq!(b.stats().traces_submitted, 10);
    }
}
