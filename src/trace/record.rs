//! Trace records: the nodes of a call tree.
//!
//! A record is created open when a method is entered and closed exactly once,
//! either by a clean return or by a captured failure. Closed records are never
//! modified again. Children are owned through [`RecordId`] indices into the
//! arena that holds the tree; the parent link is a plain index used for
//! navigation only, so trees contain no reference cycles.

use super::marker::TraceMarker;
use crate::types::{RecordId, SymbolId, Time};
use core::fmt;
use serde::Serialize;
use smallvec::SmallVec;
use std::error::Error;

/// Bit-set of per-record flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// No flags set.
    pub const EMPTY: Self = Self(0);
    /// The trace rooted at (or containing) this record hit its record budget.
    pub const OVERFLOW: Self = Self(0x01);
    /// This record roots a named trace.
    pub const TRACE_BEGIN: Self = Self(0x02);

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::OVERFLOW) {
            names.push("OVERFLOW");
        }
        if self.contains(Self::TRACE_BEGIN) {
            names.push("TRACE_BEGIN");
        }
        write!(f, "RecordFlags({})", names.join("|"))
    }
}

/// Attribute value attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Text value.
    Str(String),
    /// Signed integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A failure captured from the instrumented application.
///
/// This is domain data carried by a record, not an error of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedError {
    type_name: String,
    message: String,
    frames: Vec<String>,
    cause: Option<Box<CapturedError>>,
}

impl CapturedError {
    /// Creates a payload from an exception type name and message.
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            frames: Vec::new(),
            cause: None,
        }
    }

    /// Captures a Rust error and its `source()` chain.
    #[must_use]
    pub fn from_error<E: Error + 'static>(error: &E) -> Self {
        let mut captured = Self::new(std::any::type_name::<E>(), error.to_string());
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(err) = source {
            causes.push(Self::new("source", err.to_string()));
            source = err.source();
        }
        while let Some(cause) = causes.pop() {
            let inner = match causes.last_mut() {
                Some(outer) => outer,
                None => &mut captured,
            };
            inner.cause = Some(Box::new(cause));
        }
        captured
    }

    /// Appends a stack frame description.
    #[must_use]
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Sets the underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the exception type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the captured stack frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// Returns the underlying cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

/// How a record ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Outcome {
    /// The method is still executing.
    Open,
    /// The method returned normally.
    Returned {
        /// Exit timestamp.
        exit: Time,
    },
    /// The method failed with a captured error.
    Failed {
        /// Exit timestamp.
        exit: Time,
        /// The captured failure.
        error: Box<CapturedError>,
    },
}

impl Outcome {
    /// Returns the exit timestamp of a closed record.
    #[must_use]
    pub fn exit(&self) -> Option<Time> {
        match self {
            Self::Open => None,
            Self::Returned { exit } | Self::Failed { exit, .. } => Some(*exit),
        }
    }

    /// Returns true while the record is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns true if the record closed with a failure.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A node in a call tree.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    class_id: SymbolId,
    method_id: SymbolId,
    signature_id: SymbolId,
    entry: Time,
    outcome: Outcome,
    call_count: u64,
    flags: RecordFlags,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attrs: Vec<(SymbolId, AttrValue)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    marker: Option<Box<TraceMarker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<RecordId>,
    #[serde(skip_serializing_if = "SmallVec::is_empty")]
    children: SmallVec<[RecordId; 4]>,
}

impl TraceRecord {
    pub(crate) fn open(
        class_id: SymbolId,
        method_id: SymbolId,
        signature_id: SymbolId,
        entry: Time,
        parent: Option<RecordId>,
    ) -> Self {
        Self {
            class_id,
            method_id,
            signature_id,
            entry,
            outcome: Outcome::Open,
            call_count: 1,
            flags: RecordFlags::EMPTY,
            attrs: Vec::new(),
            marker: None,
            parent,
            children: SmallVec::new(),
        }
    }

    /// Interned class name.
    #[must_use]
    pub const fn class_id(&self) -> SymbolId {
        self.class_id
    }

    /// Interned method name.
    #[must_use]
    pub const fn method_id(&self) -> SymbolId {
        self.method_id
    }

    /// Interned method signature.
    #[must_use]
    pub const fn signature_id(&self) -> SymbolId {
        self.signature_id
    }

    /// Entry timestamp.
    #[must_use]
    pub const fn entry(&self) -> Time {
        self.entry
    }

    /// Exit timestamp, absent while open.
    #[must_use]
    pub fn exit(&self) -> Option<Time> {
        self.outcome.exit()
    }

    /// How the record ended.
    #[must_use]
    pub const fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// The captured failure, if the record failed.
    #[must_use]
    pub fn error(&self) -> Option<&CapturedError> {
        match &self.outcome {
            Outcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Time spent in the method in nanoseconds, absent while open.
    #[must_use]
    pub fn duration_nanos(&self) -> Option<u64> {
        self.exit().map(|exit| exit.duration_since(self.entry))
    }

    /// Number of invocations represented by this record and its subtree,
    /// retained or elided.
    #[must_use]
    pub const fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Record flags.
    #[must_use]
    pub const fn flags(&self) -> RecordFlags {
        self.flags
    }

    /// Attributes in insertion order.
    #[must_use]
    pub fn attrs(&self) -> &[(SymbolId, AttrValue)] {
        &self.attrs
    }

    /// Returns the most recently set value for `key`.
    #[must_use]
    pub fn attr(&self, key: SymbolId) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// The trace marker, present only on a trace root.
    #[must_use]
    pub fn marker(&self) -> Option<&TraceMarker> {
        self.marker.as_deref()
    }

    /// Parent record, absent for a root.
    #[must_use]
    pub const fn parent(&self) -> Option<RecordId> {
        self.parent
    }

    /// Retained children in call order.
    #[must_use]
    pub fn children(&self) -> &[RecordId] {
        &self.children
    }

    pub(crate) fn close(&mut self, outcome: Outcome) {
        debug_assert!(self.outcome.is_open(), "record closed twice");
        self.outcome = outcome;
    }

    pub(crate) fn push_attr(&mut self, key: SymbolId, value: AttrValue) {
        self.attrs.push((key, value));
    }

    pub(crate) fn add_calls(&mut self, calls: u64) {
        self.call_count = self.call_count.saturating_add(calls);
    }

    pub(crate) fn flags_mut(&mut self) -> &mut RecordFlags {
        &mut self.flags
    }

    pub(crate) fn marker_mut(&mut self) -> Option<&mut TraceMarker> {
        self.marker.as_deref_mut()
    }

    pub(crate) fn set_marker(&mut self, marker: TraceMarker) {
        self.marker = Some(Box::new(marker));
        self.flags.insert(RecordFlags::TRACE_BEGIN);
    }

    pub(crate) fn set_parent(&mut self, parent: Option<RecordId>) {
        self.parent = parent;
    }

    pub(crate) fn push_child(&mut self, child: RecordId) {
        self.children.push(child);
    }

    pub(crate) fn take_children(&mut self) -> SmallVec<[RecordId; 4]> {
        std::mem::take(&mut self.children)
    }
}
