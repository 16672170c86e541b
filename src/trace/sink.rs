//! Destinations for finished traces.
//!
//! The builder hands every kept outermost trace to a [`TraceSink`] exactly
//! once, synchronously, on the thread that closed the trace's root. Sinks
//! that need to do slow work should hand the tree off (see [`QueueSink`]).

use super::tree::TraceTree;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives finished traces.
pub trait TraceSink: Send + Sync {
    /// Takes ownership of a finished trace.
    fn submit(&self, trace: TraceTree);
}

impl<F> TraceSink for F
where
    F: Fn(TraceTree) + Send + Sync,
{
    fn submit(&self, trace: TraceTree) {
        self(trace);
    }
}

/// Drops every trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn submit(&self, _trace: TraceTree) {}
}

/// Keeps every submitted trace in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    traces: Mutex<Vec<TraceTree>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<TraceTree> {
        std::mem::take(&mut *self.traces.lock())
    }

    /// Number of traces currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.lock().is_empty()
    }
}

impl TraceSink for CollectingSink {
    fn submit(&self, trace: TraceTree) {
        self.traces.lock().push(trace);
    }
}

/// Bounded lock-free hand-off to a consumer thread.
///
/// When the queue is full the incoming trace is dropped and counted; the
/// instrumented thread never blocks.
#[derive(Debug)]
pub struct QueueSink {
    queue: ArrayQueue<TraceTree>,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl QueueSink {
    /// Creates a queue holding at most `capacity` traces (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Takes the oldest queued trace.
    pub fn pop(&self) -> Option<TraceTree> {
        self.queue.pop()
    }

    /// Takes every queued trace, oldest first.
    pub fn drain(&self) -> Vec<TraceTree> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(trace) = self.queue.pop() {
            out.push(trace);
        }
        out
    }

    /// Number of traces waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no trace is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Traces accepted into the queue since creation.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Traces dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TraceSink for QueueSink {
    fn submit(&self, trace: TraceTree) {
        match self.queue.push(trace) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                crate::tracing_compat::debug!(
                    capacity = self.queue.capacity(),
                    "trace queue full, dropping trace"
                );
            }
        }
    }
}
