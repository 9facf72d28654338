//! Import orchestrator that runs the multi-phase bulk load

use super::citygml::CityGmlSource;
use super::context::{ImportContext, ImportStats, InterruptHandle, RunState};
use super::counter::CounterSnapshot;
use super::filter::{ElementCounter, FilterDecision, InputFilter};
use super::progress::{ImportObserver, NoopObserver};
use super::scanner::DirectoryScanner;
use super::source::{ChunkReader, DocumentSource, ImportError};
use super::transform::AffineTransformer;
use super::worker::FeatureImportWorkerFactory;
use crate::cache::{CacheTableStore, UidCache, UidCacheManager, UidCacheType};
use crate::concurrent::{Interrupt, PoolError, PoolSizeAdaptation, WorkerPool};
use crate::config::{DatabaseConfig, ImportConfig, IndexMode};
use crate::database::{DatabaseAdapter, IndexStatus, IndexStatusInfo, IndexType};
use crate::types::Chunk;
use crate::xlink::{Xlink, XlinkRegistrationFactory, XlinkResolverFactory, XlinkSplitter};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Result of a run that was not aborted by an error
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    /// False when the run was interrupted
    pub completed: bool,
    #[serde(skip)]
    pub interrupt: Option<Interrupt>,
    pub stats: ImportStats,
    pub counters: CounterSnapshot,
}

/// Bulk importer for one run over a set of input paths
pub struct Importer {
    config: ImportConfig,
    database_config: DatabaseConfig,
    database: Arc<dyn DatabaseAdapter>,
    source: Arc<dyn DocumentSource>,
    filter: InputFilter,
    scanner: DirectoryScanner,
    context: Arc<ImportContext>,
}

impl Importer {
    /// Handle for stopping the run from another thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(Arc::clone(&self.context))
    }

    pub fn context(&self) -> &Arc<ImportContext> {
        &self.context
    }

    /// Import all documents found below `inputs`.
    ///
    /// An interrupt is not an error: the run ends with
    /// `ImportOutcome { completed: false, .. }` after all cleanup has run.
    pub fn run(&self, inputs: &[PathBuf]) -> Result<ImportOutcome, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", run_id = %run_id);
        let _guard = span.enter();

        let start_time = Instant::now();
        let mut stats = ImportStats::default();
        info!("Starting import of {} input path(s)", inputs.len());

        // ====================================================================
        // PREPARING
        // ====================================================================

        self.context.set_state(RunState::Preparing);
        self.check_workspace()?;
        self.deactivate_indexes()?;

        let transformer = if self.config.affine_transformation.enabled {
            let transformer = AffineTransformer::new(&self.config.affine_transformation.matrix)?;
            info!("Applying affine transformation to all coordinates");
            Some(transformer)
        } else {
            None
        };

        self.context.status("Scanning input files");
        self.context.observer().indeterminate(true);
        let files = self
            .scanner
            .scan(inputs, self.context.interrupt_signal());
        self.context.observer().indeterminate(false);
        let files = files?;

        if self.context.is_interrupted() {
            return Ok(self.outcome(stats, start_time));
        }
        if files.is_empty() {
            return Err(ImportError::NoInputFiles);
        }
        stats.files_total = files.len();
        info!("Found {} file(s) to import", files.len());

        // ====================================================================
        // PARSING / XLINK_RESOLVING, per file
        // ====================================================================

        let mut counter = ElementCounter::from_config(&self.config.filter);
        for (n, path) in files.iter().enumerate() {
            if self.context.is_interrupted() {
                break;
            }
            if counter.is_exhausted() {
                debug!("Last element reached, skipping remaining files");
                break;
            }

            let name = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            self.context.observer().file_started(&name, files.len() - n - 1);
            info!("Importing file {}", path.display());

            match self.import_file(path, transformer.as_ref(), &mut counter) {
                Ok(()) if !self.context.is_interrupted() => stats.files_imported += 1,
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Failed to import {}: {}", path.display(), e);
                    stats.files_failed += 1;
                }
            }
        }

        // ====================================================================
        // Finish
        // ====================================================================

        if !self.context.is_interrupted() {
            self.reactivate_indexes()?;
        }

        let outcome = self.outcome(stats, start_time);
        for (class, count) in &outcome.counters.features {
            info!("Imported {} {} feature(s)", count, class);
        }
        for (class, count) in &outcome.counters.geometries {
            info!("Imported {} {} geometries", count, class);
        }
        if outcome.completed {
            info!(
                "Import finished in {:.1}s: {} of {} file(s) imported",
                outcome.stats.elapsed_seconds,
                outcome.stats.files_imported,
                outcome.stats.files_total
            );
        } else {
            warn!("Import was interrupted");
        }
        Ok(outcome)
    }

    fn outcome(&self, mut stats: ImportStats, start_time: Instant) -> ImportOutcome {
        self.context.fill_stats(&mut stats);
        stats.elapsed_seconds = start_time.elapsed().as_secs_f64();
        ImportOutcome {
            completed: !self.context.is_interrupted(),
            interrupt: self.context.interrupt_cause(),
            stats,
            counters: self.context.counters().snapshot(),
        }
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    fn check_workspace(&self) -> Result<(), ImportError> {
        if !self.database.has_versioning_support() || self.database_config.is_default_workspace() {
            return Ok(());
        }
        let workspace = &self.database_config.workspace;
        if !self.database.workspace_exists(workspace)? {
            return Err(ImportError::WorkspaceNotFound(workspace.clone()));
        }
        info!("Importing into workspace '{}'", workspace);
        Ok(())
    }

    fn index_mode(&self, index_type: IndexType) -> IndexMode {
        match index_type {
            IndexType::Spatial => self.config.indexes.spatial,
            IndexType::Normal => self.config.indexes.normal,
        }
    }

    fn deactivate_indexes(&self) -> Result<(), ImportError> {
        for index_type in IndexType::ALL {
            if self.index_mode(index_type).deactivates() {
                self.context
                    .status(&format!("Deactivating {} indexes", index_type));
                let info = self.database.drop_indexes(index_type)?;
                check_indexes(&info, IndexStatus::Dropped, "deactivate")?;
            } else {
                let info = self.database.index_status(index_type)?;
                for index in &info.indexes {
                    info!("{} index {}", index_type, index);
                }
            }
        }
        Ok(())
    }

    /// Recreate every index type configured for it. A failing type does not
    /// stop the others; the first failure is returned once all have run.
    fn reactivate_indexes(&self) -> Result<(), ImportError> {
        let mut failures = Vec::new();
        for index_type in IndexType::ALL {
            if !self.index_mode(index_type).reactivates() {
                continue;
            }
            self.context
                .status(&format!("Activating {} indexes", index_type));
            let result = self
                .database
                .create_indexes(index_type)
                .map_err(ImportError::from)
                .and_then(|info| check_indexes(&info, IndexStatus::Valid, "activate"));
            if let Err(e) = result {
                error!("{}", e);
                failures.push(e);
            }
        }

        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Per-file import
    // ========================================================================

    fn import_file(
        &self,
        path: &Path,
        transformer: Option<&AffineTransformer>,
        counter: &mut ElementCounter,
    ) -> Result<(), ImportError> {
        self.context.set_state(RunState::Parsing);
        let mut session = FileSession::open(
            &self.config,
            Arc::clone(&self.database),
            transformer,
            Arc::clone(&self.context),
        )?;

        let mut reader = self.source.open(path, &self.filter)?;
        let read_result = self.feed(reader.as_mut(), &session, counter);

        // Drain the main pass even when reading failed
        session.features.shutdown_and_wait();
        reader.close();
        session.registration.shutdown_and_wait();

        let validation_errors = reader.validation_errors();
        if validation_errors > 0 {
            warn!(
                "{} validation error(s) in {}",
                validation_errors,
                path.display()
            );
            self.context.validation_errors(validation_errors);
        }

        if self.context.set_state(RunState::XlinkResolving) {
            self.context.status("Resolving XLinks");
            session.resolve_xlinks()?;
        }

        read_result
    }

    /// Stream chunks into the feature pool through the element counter
    fn feed(
        &self,
        reader: &mut dyn ChunkReader,
        session: &FileSession,
        counter: &mut ElementCounter,
    ) -> Result<(), ImportError> {
        while !self.context.is_interrupted() {
            match reader.next_chunk() {
                Ok(Some(chunk)) => match counter.next() {
                    FilterDecision::Skip => continue,
                    FilterDecision::Stop => break,
                    FilterDecision::Accept => session.features.add_work(chunk)?,
                },
                Ok(None) => break,
                Err(ImportError::InvalidChunk(reason)) => match counter.next() {
                    FilterDecision::Skip => continue,
                    FilterDecision::Stop => break,
                    FilterDecision::Accept => {
                        warn!("Skipping malformed chunk: {}", reason);
                        self.context.chunk_failed();
                    }
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Fail with a summary of every index whose status is not `expected`
fn check_indexes(
    info: &IndexStatusInfo,
    expected: IndexStatus,
    operation: &'static str,
) -> Result<(), ImportError> {
    for index in &info.indexes {
        if index.status == expected {
            info!("{} index {}", info.index_type, index);
        } else {
            error!(
                "{} index {}{}",
                info.index_type,
                index,
                index
                    .error_message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            );
        }
    }

    let failures = info.failures(expected);
    if failures.is_empty() {
        return Ok(());
    }
    let failures = failures
        .iter()
        .map(|index| {
            format!(
                "{}({}): {}",
                index.table,
                index.column,
                index
                    .error_message
                    .clone()
                    .unwrap_or_else(|| index.status.to_string())
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    Err(ImportError::IndexOperation {
        index_type: info.index_type,
        operation,
        failures,
    })
}

// ============================================================================
// File session
// ============================================================================

/// Resources of one file: cache tables, identifier caches and pools.
///
/// Dropping the session force-stops any pool still running and drops the
/// cache tables, whatever path the file took.
struct FileSession {
    config: ImportConfig,
    database: Arc<dyn DatabaseAdapter>,
    context: Arc<ImportContext>,
    // Field order is drop order: pools and caches release their table
    // handles before the store removes its directory
    features: WorkerPool<Chunk>,
    resolver: Option<WorkerPool<Xlink>>,
    registration: Arc<WorkerPool<Vec<Xlink>>>,
    caches: Arc<UidCacheManager>,
    store: Arc<CacheTableStore>,
}

impl FileSession {
    fn open(
        config: &ImportConfig,
        database: Arc<dyn DatabaseAdapter>,
        transformer: Option<&AffineTransformer>,
        context: Arc<ImportContext>,
    ) -> Result<Self, ImportError> {
        let uid = &config.uid_cache;
        let store = Arc::new(CacheTableStore::new(uid.directory.as_deref())?);

        let mut caches = UidCacheManager::new()
            .with_cache(UidCache::new(UidCacheType::Feature, &uid.feature, uid.batch_size, &store)?)
            .with_cache(UidCache::new(UidCacheType::Geometry, &uid.geometry, uid.batch_size, &store)?);
        if config.appearance.import_appearance && config.appearance.import_texture_files {
            caches = caches.with_cache(UidCache::new(
                UidCacheType::TextureImage,
                &uid.texture_image,
                uid.batch_size,
                &store,
            )?);
        }
        let caches = Arc::new(caches);

        let threads = &config.thread_pool;
        let registration = Arc::new(WorkerPool::new(
            "xlink-registration",
            threads.min_threads,
            threads.max_threads,
            PoolSizeAdaptation::Aggressive,
            XlinkRegistrationFactory::new(Arc::clone(&store), Arc::clone(&context)),
            threads.queue_size(),
        ));
        registration.prestart_core_workers();

        let features = WorkerPool::new(
            "feature-import",
            threads.min_threads,
            threads.max_threads,
            PoolSizeAdaptation::Aggressive,
            FeatureImportWorkerFactory::new(
                Arc::clone(&database),
                Arc::clone(&caches),
                Arc::clone(&registration),
                transformer.cloned(),
                Arc::clone(&context),
            ),
            threads.queue_size(),
        );

        let session = Self {
            config: config.clone(),
            database,
            context,
            features,
            resolver: None,
            registration,
            caches,
            store,
        };

        let started = session.features.prestart_core_workers();
        if started == 0 {
            return Err(ImportError::NoWorkers(session.features.name().to_string()));
        }
        debug!("Started {} feature import worker(s)", started);
        Ok(session)
    }

    /// Replay the file's xlinks through the resolver pool
    fn resolve_xlinks(&mut self) -> Result<(), ImportError> {
        let threads = &self.config.thread_pool;
        let resolver = self.resolver.insert(WorkerPool::new(
            "xlink-resolver",
            threads.min_threads,
            threads.max_threads,
            PoolSizeAdaptation::Aggressive,
            XlinkResolverFactory::new(
                Arc::clone(&self.database),
                Arc::clone(&self.caches),
                Arc::clone(&self.context),
            ),
            threads.queue_size(),
        ));
        if resolver.prestart_core_workers() == 0 {
            return Err(PoolError::NoWorkers(resolver.name().to_string()).into());
        }

        let splitter = XlinkSplitter::new(&self.store, resolver, self.context.interrupt_signal());
        let result = splitter.start_query();
        resolver.shutdown_and_wait();

        let stats = result?;
        if stats.total() > 0 || stats.corrupt > 0 {
            info!(
                "Replayed {} xlink(s) ({} unreadable)",
                stats.total(),
                stats.corrupt
            );
        }
        Ok(())
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        let mut clean = true;

        if !self.features.is_terminated() {
            self.features.shutdown_now();
        }
        if !self.registration.is_terminated() {
            self.registration.shutdown_now();
        }
        if let Some(ref resolver) = self.resolver {
            if !resolver.is_terminated() {
                resolver.shutdown_now();
            }
            clean &= resolver.is_terminated();
        }
        clean &= self.features.is_terminated() && self.registration.is_terminated();

        if let Err(e) = self.store.drop_all() {
            warn!("Failed to drop cache tables at {:?}: {}", self.store.path(), e);
            clean = false;
        }

        if clean {
            self.context.file_cleaned_up();
        } else {
            warn!("File resources were not fully released");
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Importer`]
pub struct ImporterBuilder {
    database: Arc<dyn DatabaseAdapter>,
    config: ImportConfig,
    database_config: DatabaseConfig,
    source: Option<Arc<dyn DocumentSource>>,
    observer: Arc<dyn ImportObserver>,
    scanner: DirectoryScanner,
}

impl ImporterBuilder {
    /// Create a new builder with default settings
    pub fn new(database: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            database,
            config: ImportConfig::default(),
            database_config: DatabaseConfig::default(),
            source: None,
            observer: Arc::new(NoopObserver),
            scanner: DirectoryScanner::default(),
        }
    }

    /// Set import configuration
    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set target database configuration
    pub fn with_database_config(mut self, config: DatabaseConfig) -> Self {
        self.database_config = config;
        self
    }

    /// Set the document source (CityGML by default)
    pub fn with_source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the progress observer
    pub fn with_observer(mut self, observer: Arc<dyn ImportObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the directory scanner
    pub fn with_scanner(mut self, scanner: DirectoryScanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Build the importer
    pub fn build(self) -> Result<Importer, ImportError> {
        let filter = InputFilter::from_config(&self.config.filter, &self.config.appearance)?;
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(CityGmlSource::new(self.config.validation.clone())));

        Ok(Importer {
            config: self.config,
            database_config: self.database_config,
            database: self.database,
            source,
            filter,
            scanner: self.scanner,
            context: Arc::new(ImportContext::new(self.observer)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{IndexInfo, MemoryDatabase};

    #[test]
    fn test_builder_rejects_unknown_feature_class() {
        let mut config = ImportConfig::default();
        config.filter.feature_classes = vec!["Spaceport".into()];
        let result = ImporterBuilder::new(Arc::new(MemoryDatabase::new()))
            .with_config(config)
            .build();
        assert!(matches!(result, Err(ImportError::Config(_))));
    }

    #[test]
    fn test_missing_workspace_is_fatal() {
        let db = MemoryDatabase::new().with_versioning(["LIVE", "staging"]);
        let importer = ImporterBuilder::new(Arc::new(db))
            .with_database_config(DatabaseConfig {
                workspace: "archive".into(),
                ..DatabaseConfig::default()
            })
            .build()
            .unwrap();

        let err = importer.run(&[PathBuf::from("missing.gml")]).unwrap_err();
        assert!(matches!(err, ImportError::WorkspaceNotFound(ref ws) if ws == "archive"));
    }

    #[test]
    fn test_check_indexes_lists_failed_tables() {
        let info = IndexStatusInfo {
            index_type: IndexType::Normal,
            indexes: vec![
                IndexInfo {
                    name: "cityobject_gmlid_inx".into(),
                    table: "cityobject".into(),
                    column: "gmlid".into(),
                    status: IndexStatus::Valid,
                    error_message: None,
                },
                IndexInfo {
                    name: "tex_image_uri_inx".into(),
                    table: "tex_image".into(),
                    column: "uri".into(),
                    status: IndexStatus::Errored,
                    error_message: Some("disk full".into()),
                },
            ],
        };

        let err = check_indexes(&info, IndexStatus::Valid, "activate").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to activate normal indexes: tex_image(uri): disk full"
        );
    }

    #[test]
    fn test_no_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let importer = ImporterBuilder::new(Arc::new(MemoryDatabase::new()))
            .build()
            .unwrap();
        let err = importer.run(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, ImportError::NoInputFiles));
    }
}
