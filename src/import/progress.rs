//! Progress reporting for imports

use super::counter::CounterDelta;
use super::importer::ImportOutcome;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Receives progress notifications of one run.
///
/// Callbacks may be invoked concurrently from worker threads.
pub trait ImportObserver: Send + Sync {
    /// A file is about to be imported
    fn file_started(&self, _name: &str, _remaining: usize) {}

    /// Phase transitions and other status text
    fn status(&self, _message: &str) {}

    /// Toggle indeterminate progress (no meaningful position)
    fn indeterminate(&self, _on: bool) {}

    /// Counts of a freshly committed chunk
    fn counters_updated(&self, _delta: &CounterDelta) {}
}

/// Observer that ignores everything
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ImportObserver for NoopObserver {}

/// Console progress using indicatif
pub struct ConsoleProgress {
    /// Progress bar (None if running in quiet mode)
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
    features: AtomicU64,
    geometries: AtomicU64,
}

impl ConsoleProgress {
    pub fn new(quiet: bool) -> Self {
        let progress_bar = if !quiet {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {prefix} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            progress_bar,
            start_time: Instant::now(),
            features: AtomicU64::new(0),
            geometries: AtomicU64::new(0),
        }
    }

    /// Features counted so far
    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Relaxed)
    }

    /// Geometries counted so far
    pub fn geometries(&self) -> u64 {
        self.geometries.load(Ordering::Relaxed)
    }

    fn refresh(&self) {
        if let Some(ref pb) = self.progress_bar {
            let elapsed = self.start_time.elapsed().as_secs_f64();
            let features = self.features();
            let rate = if elapsed > 0.0 {
                features as f64 / elapsed
            } else {
                0.0
            };
            pb.set_message(format!(
                "{} features, {} geometries ({:.1} features/s)",
                features,
                self.geometries(),
                rate
            ));
        }
    }

    /// Finish the progress bar
    pub fn finish(&self, outcome: &ImportOutcome) {
        if let Some(ref pb) = self.progress_bar {
            if outcome.completed {
                pb.finish_with_message(format!(
                    "Done! {} features, {} geometries",
                    outcome.counters.total_features(),
                    outcome.counters.total_geometries()
                ));
            } else {
                pb.abandon_with_message("Cancelled");
            }
        }
    }

    /// Print summary to console
    pub fn print_summary(&self, outcome: &ImportOutcome) {
        let stats = &outcome.stats;

        println!("\nImport Summary");
        println!("==============");
        println!("Files imported:      {}/{}", stats.files_imported, stats.files_total);
        println!("Files failed:        {}", stats.files_failed);
        println!("Chunks imported:     {}", stats.chunks_imported);
        println!("Chunks failed:       {}", stats.chunks_failed);
        println!("XLinks emitted:      {}", stats.xlinks_emitted);
        println!("XLinks resolved:     {}", stats.xlinks_resolved);
        println!("XLinks unresolved:   {}", stats.xlinks_unresolved);
        println!("Duplicate gml:ids:   {}", stats.duplicate_ids);
        println!("Validation errors:   {}", stats.validation_errors);
        println!("Elapsed time:        {:.1}s", stats.elapsed_seconds);

        if !outcome.counters.features.is_empty() {
            println!("\nFeatures");
            for (class, count) in &outcome.counters.features {
                println!("  {:<28} {}", class, count);
            }
        }
        if !outcome.counters.geometries.is_empty() {
            println!("\nGeometries");
            for (class, count) in &outcome.counters.geometries {
                println!("  {:<28} {}", class, count);
            }
        }
    }
}

impl ImportObserver for ConsoleProgress {
    fn file_started(&self, name: &str, remaining: usize) {
        if let Some(ref pb) = self.progress_bar {
            pb.set_prefix(format!("{} ({} remaining)", name, remaining));
        }
    }

    fn status(&self, message: &str) {
        if let Some(ref pb) = self.progress_bar {
            pb.set_message(message.to_string());
        }
    }

    fn indeterminate(&self, on: bool) {
        if let Some(ref pb) = self.progress_bar {
            if on {
                pb.enable_steady_tick(Duration::from_millis(120));
            } else {
                pb.disable_steady_tick();
            }
        }
    }

    fn counters_updated(&self, delta: &CounterDelta) {
        self.features
            .fetch_add(delta.features.values().sum(), Ordering::Relaxed);
        self.geometries
            .fetch_add(delta.geometries.values().sum(), Ordering::Relaxed);
        self.refresh();
    }
}
