//! Call-tree tracing.
//!
//! Instrumented code reports method entries and exits to a [`TraceBuilder`]
//! (usually through a [`Tracer`]). The builder assembles bounded call trees
//! for the spans marked with `begin` and hands finished trees to a
//! [`TraceSink`].
//!
//! - [`record`]: tree nodes, flags, attributes and captured failures
//! - [`marker`]: per-trace budget, threshold and lifecycle
//! - [`builder`]: the per-thread state machine
//! - [`tree`]: finished trees and depth-first visiting
//! - [`sink`]: trace destinations
//! - [`tracer`]: facade with per-thread builders

pub mod builder;
pub mod marker;
pub mod record;
pub mod sink;
pub mod tracer;
pub mod tree;

pub use builder::{BuilderStats, TraceBuilder};
pub use marker::{TraceMarker, TraceState};
pub use record::{AttrValue, CapturedError, Outcome, RecordFlags, TraceRecord};
pub use sink::{CollectingSink, NullSink, QueueSink, TraceSink};
pub use tracer::Tracer;
pub use tree::{TraceTree, TraceVisitor};
