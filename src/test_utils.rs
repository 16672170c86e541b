//! Test utilities for calltrace.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A visitor that records the callback sequence of a finished trace
//! - Builders wired to isolated settings
//!
//! # Example
//! ```
//! use calltrace::test_utils::{init_test_logging, isolated_builder};
//!
//! init_test_logging();
//! let (mut builder, sink) = isolated_builder(16, std::time::Duration::ZERO);
//! assert!(builder.is_idle());
//! assert!(sink.is_empty());
//! ```

use crate::config::{TracerConfig, TracerSettings};
use crate::trace::{
    AttrValue, CapturedError, CollectingSink, RecordFlags, TraceBuilder, TraceMarker, TraceRecord,
    TraceVisitor,
};
use crate::types::{SymbolId, Time};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Creates a builder with its own settings and an in-memory sink.
#[must_use]
pub fn isolated_builder(
    max_trace_records: usize,
    min_trace_time: Duration,
) -> (TraceBuilder, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let settings = Arc::new(TracerSettings::new(
        TracerConfig::default()
            .with_max_trace_records(max_trace_records)
            .with_min_trace_time(min_trace_time),
    ));
    let builder = TraceBuilder::with_settings(sink.clone(), settings);
    (builder, sink)
}

/// Shorthand for a millisecond timestamp.
#[must_use]
pub const fn ms(millis: u64) -> Time {
    Time::from_millis(millis)
}

/// Records the callback names a trace walk emits, in order.
#[derive(Debug, Default)]
pub struct ActionRecorder {
    actions: Vec<String>,
}

impl ActionRecorder {
    /// Recorded callback names.
    #[must_use]
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// Consumes the recorder, returning the callback names.
    #[must_use]
    pub fn into_actions(self) -> Vec<String> {
        self.actions
    }
}

impl TraceVisitor for ActionRecorder {
    fn trace_begin(&mut self, _marker: &TraceMarker) {
        self.actions.push("traceBegin".into());
    }

    fn trace_enter(&mut self, _record: &TraceRecord) {
        self.actions.push("traceEnter".into());
    }

    fn trace_stats(&mut self, _call_count: u64, _flags: RecordFlags) {
        self.actions.push("traceStats".into());
    }

    fn new_attr(&mut self, _key: SymbolId, _value: &AttrValue) {
        self.actions.push("newAttr".into());
    }

    fn trace_return(&mut self, _exit: Time) {
        self.actions.push("traceReturn".into());
    }

    fn trace_error(&mut self, _error: &CapturedError, _exit: Time) {
        self.actions.push("traceError".into());
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}
