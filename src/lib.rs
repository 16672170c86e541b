//! Calltrace: method-level call-tree tracing for instrumented applications.
//!
//! # Overview
//!
//! An instrumentation layer reports every method entry and exit of a thread
//! to a [`TraceBuilder`]. When the application marks an invocation as the
//! start of a named trace, the builder assembles the calls beneath it into a
//! bounded call tree and hands the finished tree to a [`TraceSink`].
//!
//! # Core Guarantees
//!
//! - **Bounded traces**: each trace instance retains at most its record
//!   budget; further records are elided into aggregate call counts
//! - **Noise reduction**: calls faster than the trace's minimum duration are
//!   folded into their parent's call count
//! - **Error visibility**: failed calls are never elided for being short
//! - **Exactly-once delivery**: every kept outermost trace reaches the sink
//!   once; short traces reach it never
//! - **Consistent rankings**: [`RankList`] readers always see a complete
//!   snapshot, rebuilt at most once per interval
//!
//! # Module Structure
//!
//! - [`types`]: Identifiers and timestamps
//! - [`symbol`]: String interning for class, method and attribute names
//! - [`trace`](mod@trace): Trace builder, records, finished trees and sinks
//! - [`rank`]: Time-windowed top-N rank lists
//! - [`time`]: Clock sources
//! - [`config`]: Tracer configuration and live settings
//! - [`tracing_compat`]: Optional tracing integration (requires `tracing-integration` feature)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod rank;
pub mod symbol;
pub mod time;
pub mod trace;
pub mod tracing_compat;
pub mod types;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use config::{ConfigError, TracerConfig, TracerSettings};
pub use rank::{RankList, RankLister, Rankable};
pub use symbol::SymbolRegistry;
pub use time::{TimeSource, VirtualClock, WallClock};
pub use trace::{
    AttrValue, BuilderStats, CapturedError, CollectingSink, NullSink, Outcome, QueueSink,
    RecordFlags, TraceBuilder, TraceMarker, TraceRecord, TraceSink, TraceState, TraceTree,
    TraceVisitor, Tracer,
};
pub use types::{RecordId, SymbolId, Time};
