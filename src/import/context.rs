//! Run-scoped state shared by the orchestrator and all workers

use super::counter::{CounterDelta, ImportCounters};
use super::progress::{ImportObserver, NoopObserver};
use crate::concurrent::{Interrupt, InterruptKind, InterruptSignal};
use crate::config::LogLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunState {
    Preparing = 0,
    Parsing = 1,
    XlinkResolving = 2,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Parsing,
            2 => RunState::XlinkResolving,
            _ => RunState::Preparing,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Preparing => f.write_str("PREPARING"),
            RunState::Parsing => f.write_str("PARSING"),
            RunState::XlinkResolving => f.write_str("XLINK_RESOLVING"),
        }
    }
}

/// Run statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportStats {
    pub files_total: usize,
    pub files_imported: usize,
    pub files_failed: usize,
    /// Files whose pools all terminated and whose cache tables were dropped
    pub files_cleaned_up: usize,
    pub chunks_imported: u64,
    pub chunks_failed: u64,
    pub xlinks_emitted: u64,
    pub xlinks_resolved: u64,
    pub xlinks_unresolved: u64,
    pub duplicate_ids: u64,
    pub validation_errors: u64,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Default)]
struct RunCounters {
    files_cleaned_up: AtomicU64,
    chunks_imported: AtomicU64,
    chunks_failed: AtomicU64,
    xlinks_emitted: AtomicU64,
    xlinks_resolved: AtomicU64,
    xlinks_unresolved: AtomicU64,
    duplicate_ids: AtomicU64,
    validation_errors: AtomicU64,
}

/// Shared state of one run: interrupt, phase, counters and observer
pub struct ImportContext {
    interrupt: InterruptSignal,
    state: AtomicU8,
    counters: ImportCounters,
    observer: Arc<dyn ImportObserver>,
    run: RunCounters,
}

impl ImportContext {
    pub fn new(observer: Arc<dyn ImportObserver>) -> Self {
        Self {
            interrupt: InterruptSignal::new(),
            state: AtomicU8::new(RunState::Preparing as u8),
            counters: ImportCounters::new(),
            observer,
            run: RunCounters::default(),
        }
    }

    // ========================================================================
    // Interrupt and phase
    // ========================================================================

    pub fn interrupt_signal(&self) -> &InterruptSignal {
        &self.interrupt
    }

    /// Raise the run's interrupt. Only the first call is acted upon.
    pub fn interrupt(&self, kind: InterruptKind, message: Option<String>, level: LogLevel) -> bool {
        let acted = self.interrupt.raise(kind, message, level);
        if acted {
            debug!("Interrupt ({}) received in state {}", kind, self.state());
        }
        acted
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    pub fn interrupt_cause(&self) -> Option<Interrupt> {
        self.interrupt.cause()
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Enter a phase. Ignored once the run is interrupted.
    pub fn set_state(&self, state: RunState) -> bool {
        if self.is_interrupted() {
            return false;
        }
        self.state.store(state as u8, Ordering::SeqCst);
        true
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn observer(&self) -> &dyn ImportObserver {
        self.observer.as_ref()
    }

    pub fn status(&self, message: &str) {
        self.observer.status(message);
    }

    /// Add a chunk's counts to the aggregates and forward them
    pub fn publish_counters(&self, delta: &CounterDelta) {
        self.counters.add(delta);
        self.run.chunks_imported.fetch_add(1, Ordering::Relaxed);
        self.observer.counters_updated(delta);
    }

    pub fn counters(&self) -> &ImportCounters {
        &self.counters
    }

    pub fn chunk_failed(&self) {
        self.run.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn xlinks_emitted(&self, count: usize) {
        self.run
            .xlinks_emitted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn xlink_resolved(&self) {
        self.run.xlinks_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn xlink_unresolved(&self) {
        self.run.xlinks_unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_id(&self) {
        self.run.duplicate_ids.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_errors(&self, count: u64) {
        self.run
            .validation_errors
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn file_cleaned_up(&self) {
        self.run.files_cleaned_up.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the run counters into `stats`
    pub fn fill_stats(&self, stats: &mut ImportStats) {
        let run = &self.run;
        stats.files_cleaned_up = run.files_cleaned_up.load(Ordering::Relaxed) as usize;
        stats.chunks_imported = run.chunks_imported.load(Ordering::Relaxed);
        stats.chunks_failed = run.chunks_failed.load(Ordering::Relaxed);
        stats.xlinks_emitted = run.xlinks_emitted.load(Ordering::Relaxed);
        stats.xlinks_resolved = run.xlinks_resolved.load(Ordering::Relaxed);
        stats.xlinks_unresolved = run.xlinks_unresolved.load(Ordering::Relaxed);
        stats.duplicate_ids = run.duplicate_ids.load(Ordering::Relaxed);
        stats.validation_errors = run.validation_errors.load(Ordering::Relaxed);
    }
}

impl Default for ImportContext {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver))
    }
}

/// Cloneable handle for stopping a run from another thread
#[derive(Clone)]
pub struct InterruptHandle {
    context: Arc<ImportContext>,
}

impl InterruptHandle {
    pub fn new(context: Arc<ImportContext>) -> Self {
        Self { context }
    }

    /// Request the run to stop. Returns `true` if this request was acted upon.
    pub fn interrupt(&self, kind: InterruptKind, message: Option<String>) -> bool {
        let level = match kind {
            InterruptKind::UserAbort => LogLevel::Info,
            _ => LogLevel::Error,
        };
        self.context.interrupt(kind, message, level)
    }

    pub fn is_interrupted(&self) -> bool {
        self.context.is_interrupted()
    }
}
