//! Bulk import of CityGML documents
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Importer                               │
//! │        (phases, index lifecycle, interrupt, per-file sessions)      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────────┐
//! │  ChunkReader    │───▶│ Feature import  │───▶│ Xlink registration  │
//! │  (CityGML)      │    │ pool (rows)     │    │ pool (cache tables) │
//! └─────────────────┘    └─────────────────┘    └─────────────────────┘
//!                                                          │
//!                                              end of file ▼
//!                        ┌─────────────────┐    ┌─────────────────────┐
//!                        │ Xlink resolver  │◀───│   Xlink splitter    │
//!                        │ pool (patches)  │    │   (kind by kind)    │
//!                        └─────────────────┘    └─────────────────────┘
//! ```

mod citygml;
mod context;
mod counter;
mod filter;
mod importer;
mod progress;
mod scanner;
mod source;
mod transform;
mod worker;

pub use citygml::{CityGmlReader, CityGmlSource};
pub use context::{ImportContext, ImportStats, InterruptHandle, RunState};
pub use counter::{CounterDelta, CounterSnapshot, ImportCounters};
pub use filter::{ElementCounter, FilterDecision, InputFilter};
pub use importer::{ImportOutcome, Importer, ImporterBuilder};
pub use progress::{ConsoleProgress, ImportObserver, NoopObserver};
pub use scanner::{DirectoryScanner, DEFAULT_EXTENSIONS};
pub use source::{ChunkReader, DocumentSource, ImportError};
pub use transform::AffineTransformer;
pub use worker::{FeatureImportWorker, FeatureImportWorkerFactory};
