//! Tracer facade.
//!
//! A [`Tracer`] bundles the pieces an instrumentation layer needs: the sink,
//! a symbol registry, the settings, and one [`TraceBuilder`] per thread.
//!
//! Each thread reaches its builders through a thread-local list of slots, one
//! per tracer it has used. A slot is shared between that list and the tracer
//! that created it: the thread finds its builder without locking any shared
//! table, and the tracer can retire every slot it owns when it is dropped.
//! Retiring drops the builder, its open records and its sink reference, even
//! on threads that never call into the tracer again. Retired slots are pruned
//! from a thread's list the next time that thread creates a slot.

use super::builder::{SettingsSource, TraceBuilder};
use super::record::{AttrValue, CapturedError};
use super::sink::TraceSink;
use crate::config::TracerSettings;
use crate::symbol::SymbolRegistry;
use crate::tracing_compat::trace;
use crate::types::{SymbolId, Time};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One thread's builder for one tracer.
struct LocalSlot {
    tracer: u64,
    retired: AtomicBool,
    /// Only ever locked by the owning thread, or by the tracer while retiring.
    builder: Mutex<Option<TraceBuilder>>,
}

impl LocalSlot {
    fn new(tracer: u64, builder: TraceBuilder) -> Self {
        Self {
            tracer,
            retired: AtomicBool::new(false),
            builder: Mutex::new(Some(builder)),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Drops the builder. A builder busy on its own thread (the tracer was
    /// dropped from inside a sink) is left for that thread to prune.
    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        if let Some(mut builder) = self.builder.try_lock() {
            builder.take();
        }
    }
}

thread_local! {
    static LOCAL_SLOTS: RefCell<Vec<Arc<LocalSlot>>> = const { RefCell::new(Vec::new()) };
}

static NEXT_TRACER_ID: AtomicU64 = AtomicU64::new(1);

/// Entry point for instrumented code.
///
/// # Example
///
/// ```
/// use calltrace::trace::{CollectingSink, Tracer};
/// use calltrace::types::Time;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let sink = Arc::new(CollectingSink::new());
/// let tracer = Tracer::new(sink.clone());
/// let class = tracer.symbols().intern("com.example.Service");
/// let method = tracer.symbols().intern("handle");
/// let sig = tracer.symbols().intern("()V");
/// let kind = tracer.symbols().intern("HTTP");
///
/// tracer.enter(class, method, sig, Time::from_millis(0));
/// tracer.begin(kind, Duration::ZERO, Time::from_millis(0));
/// tracer.exit(Time::from_millis(75));
///
/// assert_eq!(sink.len(), 1);
/// ```
pub struct Tracer {
    id: u64,
    sink: Arc<dyn TraceSink>,
    symbols: Arc<SymbolRegistry>,
    settings: SettingsSource,
    /// Slots created for this tracer, one per thread that used it.
    slots: Mutex<Vec<Weak<LocalSlot>>>,
}

impl core::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tracer")
            .field("id", &self.id)
            .field("symbols", &self.symbols.len())
            .field("threads", &self.live_threads())
            .finish_non_exhaustive()
    }
}

impl Tracer {
    /// Creates a tracer using the process-wide settings.
    #[must_use]
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self::from_source(sink, SettingsSource::Global)
    }

    /// Creates a tracer bound to its own settings.
    #[must_use]
    pub fn with_settings(sink: Arc<dyn TraceSink>, settings: Arc<TracerSettings>) -> Self {
        Self::from_source(sink, SettingsSource::Shared(settings))
    }

    fn from_source(sink: Arc<dyn TraceSink>, settings: SettingsSource) -> Self {
        Self {
            id: NEXT_TRACER_ID.fetch_add(1, Ordering::Relaxed),
            sink,
            symbols: Arc::new(SymbolRegistry::new()),
            settings,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Shares an existing symbol registry.
    #[must_use]
    pub fn with_symbols(mut self, symbols: Arc<SymbolRegistry>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Process-unique id of this tracer.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The symbol registry.
    #[must_use]
    pub fn symbols(&self) -> &Arc<SymbolRegistry> {
        &self.symbols
    }

    /// The settings new traces read their budget and threshold from.
    #[must_use]
    pub fn settings(&self) -> &TracerSettings {
        self.settings.get()
    }

    /// Creates a detached builder feeding this tracer's sink, for callers
    /// that manage their own execution contexts.
    #[must_use]
    pub fn builder(&self) -> TraceBuilder {
        TraceBuilder::from_source(Arc::clone(&self.sink), self.settings.clone())
    }

    /// Number of threads currently holding a builder for this tracer.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    /// Runs `f` with the calling thread's builder for this tracer, creating
    /// it on first use.
    ///
    /// Returns `None` when called reentrantly on the same thread (for example
    /// from an instrumented sink) or while the thread is being torn down.
    pub fn with_local_builder<R>(&self, f: impl FnOnce(&mut TraceBuilder) -> R) -> Option<R> {
        let slot = self.local_slot()?;
        let Some(mut builder) = slot.builder.try_lock() else {
            trace!(tracer = self.id, "reentrant tracer call skipped");
            return None;
        };
        builder.as_mut().map(f)
    }

    /// Finds or creates the calling thread's slot.
    fn local_slot(&self) -> Option<Arc<LocalSlot>> {
        LOCAL_SLOTS
            .try_with(|cell| {
                let mut slots = cell.try_borrow_mut().ok()?;
                if let Some(slot) = slots.iter().find(|slot| slot.tracer == self.id) {
                    return Some(Arc::clone(slot));
                }
                slots.retain(|slot| !slot.is_retired());
                let slot = Arc::new(LocalSlot::new(self.id, self.builder()));
                let mut owned = self.slots.lock();
                owned.retain(|slot| slot.strong_count() > 0);
                owned.push(Arc::downgrade(&slot));
                drop(owned);
                slots.push(Arc::clone(&slot));
                trace!(tracer = self.id, threads = slots.len(), "local builder created");
                Some(slot)
            })
            .ok()
            .flatten()
    }

    /// Drops the calling thread's builder for this tracer, discarding any
    /// open records. Returns true if one existed.
    pub fn release_local_builder(&self) -> bool {
        LOCAL_SLOTS
            .try_with(|cell| {
                let Ok(mut slots) = cell.try_borrow_mut() else {
                    return false;
                };
                let before = slots.len();
                slots.retain(|slot| slot.tracer != self.id);
                slots.len() != before
            })
            .unwrap_or(false)
    }

    /// Records a method entry on the calling thread.
    pub fn enter(
        &self,
        class_id: SymbolId,
        method_id: SymbolId,
        signature_id: SymbolId,
        timestamp: Time,
    ) {
        self.with_local_builder(|b| b.enter(class_id, method_id, signature_id, timestamp));
    }

    /// Begins a trace at the calling thread's innermost open record.
    pub fn begin(&self, trace_type: SymbolId, min_duration: Duration, timestamp: Time) {
        self.with_local_builder(|b| b.begin(trace_type, min_duration, timestamp));
    }

    /// Begins a trace with the configured default minimum duration.
    pub fn begin_default(&self, trace_type: SymbolId, timestamp: Time) {
        self.with_local_builder(|b| b.begin_default(trace_type, timestamp));
    }

    /// Records a normal return on the calling thread.
    pub fn exit(&self, timestamp: Time) {
        self.with_local_builder(|b| b.exit(timestamp));
    }

    /// Records a failure on the calling thread.
    pub fn error(&self, error: CapturedError, timestamp: Time) {
        self.with_local_builder(|b| b.error(error, timestamp));
    }

    /// Attaches an attribute to the calling thread's innermost open record.
    pub fn set_attr(&self, key: SymbolId, value: impl Into<AttrValue>, timestamp: Time) {
        let value = value.into();
        self.with_local_builder(|b| b.set_attr(key, value, timestamp));
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().drain(..).filter_map(|slot| slot.upgrade()) {
            slot.retire();
        }
        self.release_local_builder();
    }
}
