//! Finished call trees.
//!
//! A [`TraceTree`] is what a sink receives: the retained records of one trace,
//! laid out in pre-order with the root at index 0. Every [`RecordId`] inside
//! the tree is an index into that layout.

use super::marker::TraceMarker;
use super::record::{AttrValue, CapturedError, Outcome, RecordFlags, TraceRecord};
use crate::types::{RecordId, SymbolId, Time};
use serde::Serialize;

/// Callbacks emitted while walking a finished tree.
///
/// For each record the walk emits, in order: `trace_begin` (trace roots
/// only), `trace_enter`, `trace_stats`, one `new_attr` per attribute, the
/// whole walk of every retained child, then `trace_return` or `trace_error`.
pub trait TraceVisitor {
    /// A record carrying a trace marker is about to be entered.
    fn trace_begin(&mut self, _marker: &TraceMarker) {}

    /// A record is entered.
    fn trace_enter(&mut self, _record: &TraceRecord) {}

    /// Aggregate statistics of the current record.
    fn trace_stats(&mut self, _call_count: u64, _flags: RecordFlags) {}

    /// One attribute of the current record.
    fn new_attr(&mut self, _key: SymbolId, _value: &AttrValue) {}

    /// The current record returned normally.
    fn trace_return(&mut self, _exit: Time) {}

    /// The current record failed.
    fn trace_error(&mut self, _error: &CapturedError, _exit: Time) {}
}

/// A finished trace: its retained records in pre-order.
#[derive(Debug, Clone, Serialize)]
pub struct TraceTree {
    records: Vec<TraceRecord>,
}

impl TraceTree {
    /// Records must be in pre-order, root first, with parent and child links
    /// already remapped to positions in `records`.
    pub(crate) fn from_preorder(records: Vec<TraceRecord>) -> Self {
        debug_assert!(!records.is_empty(), "trace tree without a root");
        debug_assert!(records[0].parent().is_none(), "root has a parent");
        Self { records }
    }

    /// The root record.
    #[must_use]
    pub fn root(&self) -> &TraceRecord {
        &self.records[0]
    }

    /// The root's trace marker.
    #[must_use]
    pub fn marker(&self) -> Option<&TraceMarker> {
        self.root().marker()
    }

    /// Interned trace type, if the root carries a marker.
    #[must_use]
    pub fn trace_type(&self) -> Option<SymbolId> {
        self.marker().map(TraceMarker::trace_type)
    }

    /// Trace duration in nanoseconds, measured from the marker's start time
    /// to the root's exit.
    #[must_use]
    pub fn duration_nanos(&self) -> Option<u64> {
        let exit = self.root().exit()?;
        match self.marker() {
            Some(marker) => Some(marker.duration_at(exit)),
            None => self.root().duration_nanos(),
        }
    }

    /// True if the trace refused records because its budget was spent.
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.root().flags().contains(RecordFlags::OVERFLOW)
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false; a tree has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up a record.
    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&TraceRecord> {
        self.records.get(id.index())
    }

    /// Retained children of `id`, in call order.
    pub fn children(&self, id: RecordId) -> impl Iterator<Item = &TraceRecord> + '_ {
        self.get(id)
            .map(TraceRecord::children)
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.get(*child))
    }

    /// Parent of `id`.
    #[must_use]
    pub fn parent(&self, id: RecordId) -> Option<&TraceRecord> {
        self.get(id)?.parent().and_then(|parent| self.get(parent))
    }

    /// Records in pre-order, paired with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &TraceRecord)> + '_ {
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| (RecordId::from_index(index), record))
    }

    /// Records that closed with a failure.
    pub fn failures(&self) -> impl Iterator<Item = &TraceRecord> + '_ {
        self.records.iter().filter(|r| r.outcome().is_failed())
    }

    /// Walks the tree depth-first, emitting visitor callbacks.
    pub fn walk<V: TraceVisitor + ?Sized>(&self, visitor: &mut V) {
        enum Step {
            Open(RecordId),
            Close(RecordId),
        }

        let mut steps = vec![Step::Open(RecordId::ROOT)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Open(id) => {
                    let Some(record) = self.get(id) else {
                        continue;
                    };
                    if let Some(marker) = record.marker() {
                        visitor.trace_begin(marker);
                    }
                    visitor.trace_enter(record);
                    visitor.trace_stats(record.call_count(), record.flags());
                    for (key, value) in record.attrs() {
                        visitor.new_attr(*key, value);
                    }
                    steps.push(Step::Close(id));
                    steps.extend(record.children().iter().rev().map(|c| Step::Open(*c)));
                }
                Step::Close(id) => {
                    let Some(record) = self.get(id) else {
                        continue;
                    };
                    match record.outcome() {
                        Outcome::Returned { exit } => visitor.trace_return(*exit),
                        Outcome::Failed { exit, error } => visitor.trace_error(error, *exit),
                        Outcome::Open => {}
                    }
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a TraceTree {
    type Item = &'a TraceRecord;
    type IntoIter = std::slice::Iter<'a, TraceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
