//! Feature import workers
//!
//! Each worker owns one database connection and writes a whole chunk in a
//! single transaction. References that cannot be resolved inside the chunk
//! or through the identifier caches are written with the foreign key unset
//! and emitted as xlinks once the transaction has committed.

use super::context::ImportContext;
use super::counter::CounterDelta;
use super::source::ImportError;
use super::transform::AffineTransformer;
use crate::cache::{UidCacheManager, UidCacheType};
use crate::concurrent::{InterruptKind, Worker, WorkerFactory, WorkerPool};
use crate::config::LogLevel;
use crate::database::{
    schema, DatabaseAdapter, DatabaseConnection, DatabaseError, Row, Value,
};
use crate::types::{Chunk, ChunkReference, SurrogateId, XlinkKind};
use crate::xlink::{self, Xlink};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Identifier to register once the chunk has committed
#[derive(Debug)]
struct Registration {
    cache: UidCacheType,
    local_id: String,
    id: SurrogateId,
    type_tag: String,
}

/// Rows written for one chunk, waiting for commit
#[derive(Debug, Default)]
struct ChunkWrite {
    registrations: Vec<Registration>,
    xlinks: Vec<Xlink>,
}

/// Ids assigned inside the current chunk, for local resolution
#[derive(Debug, Default)]
struct LocalIds {
    features: HashMap<String, SurrogateId>,
    geometries: HashMap<String, SurrogateId>,
}

impl LocalIds {
    fn get(&self, cache: UidCacheType, local_id: &str) -> Option<SurrogateId> {
        match cache {
            UidCacheType::Feature => self.features.get(local_id).copied(),
            UidCacheType::Geometry => self.geometries.get(local_id).copied(),
            UidCacheType::TextureImage => None,
        }
    }
}

pub struct FeatureImportWorker {
    connection: Box<dyn DatabaseConnection>,
    caches: Arc<UidCacheManager>,
    xlink_pool: Arc<WorkerPool<Vec<Xlink>>>,
    transformer: Option<AffineTransformer>,
    context: Arc<ImportContext>,
    /// Texture URIs claimed by the open transaction
    reserved: Vec<String>,
}

impl FeatureImportWorker {
    pub fn new(
        connection: Box<dyn DatabaseConnection>,
        caches: Arc<UidCacheManager>,
        xlink_pool: Arc<WorkerPool<Vec<Xlink>>>,
        transformer: Option<AffineTransformer>,
        context: Arc<ImportContext>,
    ) -> Self {
        Self {
            connection,
            caches,
            xlink_pool,
            transformer,
            context,
            reserved: Vec::new(),
        }
    }

    /// Write all rows of a chunk inside the open transaction
    fn write_chunk(&mut self, chunk: &Chunk) -> Result<ChunkWrite, ImportError> {
        let mut write = ChunkWrite::default();
        let mut local = LocalIds::default();

        // Features: parents always precede their children
        let mut feature_ids: Vec<SurrogateId> = Vec::with_capacity(chunk.features.len());
        for feature in &chunk.features {
            let parent_id = feature
                .parent
                .map(|p| written(&feature_ids, p, "parent feature"))
                .transpose()?;
            let id = self.connection.insert(
                Row::new(schema::CITYOBJECT)
                    .with("gmlid", feature.gml_id.clone())
                    .with("objectclass", feature.class.as_str())
                    .with("parent_id", parent_id),
            )?;
            feature_ids.push(id);

            if let Some(ref gml_id) = feature.gml_id {
                local.features.entry(gml_id.clone()).or_insert(id);
                write.registrations.push(Registration {
                    cache: UidCacheType::Feature,
                    local_id: gml_id.clone(),
                    id,
                    type_tag: feature.class.as_str().to_string(),
                });
            }
        }

        // Geometries: enclosing geometries also precede nested ones
        let mut geometry_ids: Vec<SurrogateId> = Vec::with_capacity(chunk.geometries.len());
        for geometry in &chunk.geometries {
            let mut coordinates = geometry.coordinates().ok_or_else(|| {
                ImportError::InvalidChunk(format!(
                    "{} '{}' has {} ordinates for dimension {}",
                    geometry.class,
                    geometry.gml_id.as_deref().unwrap_or("<no gml:id>"),
                    geometry.ordinates.len(),
                    geometry.dimension
                ))
            })?;
            if let Some(ref transformer) = self.transformer {
                transformer.transform_all(&mut coordinates);
            }

            let parent_id = geometry
                .parent
                .map(|p| written(&geometry_ids, p, "parent geometry"))
                .transpose()?;
            let owner = written(&feature_ids, geometry.feature, "geometry owner")?;
            let value = if coordinates.is_empty() {
                Value::Null
            } else {
                Value::Geometry(coordinates)
            };
            let id = self.connection.insert(
                Row::new(schema::SURFACE_GEOMETRY)
                    .with("gmlid", geometry.gml_id.clone())
                    .with("geometry_type", geometry.class.as_str())
                    .with("parent_id", parent_id)
                    .with("cityobject_id", owner)
                    .with("geometry", value),
            )?;
            geometry_ids.push(id);

            if let Some(ref gml_id) = geometry.gml_id {
                local.geometries.entry(gml_id.clone()).or_insert(id);
                write.registrations.push(Registration {
                    cache: UidCacheType::Geometry,
                    local_id: gml_id.clone(),
                    id,
                    type_tag: geometry.class.as_str().to_string(),
                });
            }
        }

        // Texture images are shared between appearances
        if let Some(textures) = self.caches.cache(UidCacheType::TextureImage) {
            for uri in &chunk.texture_images {
                if !textures.reserve(uri)? {
                    continue;
                }
                self.reserved.push(uri.clone());
                let id = self
                    .connection
                    .insert(Row::new(schema::TEX_IMAGE).with("uri", uri.as_str()))?;
                write.registrations.push(Registration {
                    cache: UidCacheType::TextureImage,
                    local_id: uri.clone(),
                    id,
                    type_tag: "TextureImage".to_string(),
                });
            }
        }

        for reference in &chunk.references {
            let owner = written(&feature_ids, reference.feature, "reference owner")?;
            let geometry = reference
                .geometry
                .map(|g| written(&geometry_ids, g, "reference geometry"))
                .transpose()?;
            if let Some(xlink) = self.write_reference(reference, owner, geometry, &local)? {
                write.xlinks.push(xlink);
            }
        }

        Ok(write)
    }

    /// Insert the row carrying a reference, resolving its target if possible
    fn write_reference(
        &mut self,
        reference: &ChunkReference,
        owner: SurrogateId,
        geometry: Option<SurrogateId>,
        local: &LocalIds,
    ) -> Result<Option<Xlink>, ImportError> {
        let cache = xlink::cache_type(reference.kind);
        let target = match local.get(cache, &reference.target) {
            Some(id) => Some(id),
            None => self
                .caches
                .lookup(cache, &reference.target)?
                .map(|entry| entry.id),
        };

        let (table, column) = xlink::target_column(reference.kind);
        let mut row = Row::new(table)
            .with("cityobject_id", owner)
            .with("property", reference.property.as_str())
            .with(column, target);
        if reference.kind == XlinkKind::SurfaceGeometry {
            row = row.with("parent_id", geometry);
        }

        let id = self.connection.insert(row)?;
        Ok(match target {
            Some(_) => None,
            None => Some(Xlink::new(reference.kind, id, reference.target.clone())),
        })
    }

    /// Register identifiers of a committed chunk. The first entry wins.
    fn register(&self, registrations: Vec<Registration>) {
        for r in registrations {
            let Some(cache) = self.caches.cache(r.cache) else {
                continue;
            };
            match cache.put(&r.local_id, r.id, &r.type_tag) {
                Ok(true) => {}
                // Concurrent appearances may share an image
                Ok(false) if r.cache == UidCacheType::TextureImage => {
                    debug!("Texture image '{}' already registered", r.local_id);
                }
                Ok(false) => {
                    error!(
                        "Duplicate {} gml:id '{}' ({}); keeping the first occurrence",
                        r.cache, r.local_id, r.type_tag
                    );
                    self.context.duplicate_id();
                }
                Err(e) => error!("Failed to cache {} id '{}': {}", r.cache, r.local_id, e),
            }
        }
    }

    fn rollback(&mut self) {
        if let Err(e) = self.connection.rollback() {
            warn!("Rollback failed: {}", e);
        }
        let reserved = std::mem::take(&mut self.reserved);
        if let Some(textures) = self.caches.cache(UidCacheType::TextureImage) {
            for uri in &reserved {
                textures.release(uri);
            }
        }
    }
}

/// Id of a row written earlier in the same chunk
fn written(ids: &[SurrogateId], index: usize, what: &str) -> Result<SurrogateId, ImportError> {
    ids.get(index).copied().ok_or_else(|| {
        ImportError::InvalidChunk(format!(
            "{} index {} is out of range ({} written)",
            what,
            index,
            ids.len()
        ))
    })
}

impl Worker<Chunk> for FeatureImportWorker {
    fn do_work(&mut self, chunk: Chunk) {
        let written = self.write_chunk(&chunk).and_then(|write| {
            self.connection.commit()?;
            Ok(write)
        });

        match written {
            Ok(write) => {
                self.register(write.registrations);
                self.reserved.clear();
                self.context.publish_counters(&CounterDelta::from_chunk(&chunk));

                if !write.xlinks.is_empty() {
                    let count = write.xlinks.len();
                    if let Err(e) = self.xlink_pool.add_work(write.xlinks) {
                        warn!("Dropped {} xlinks of {}: {}", count, describe(&chunk), e);
                    }
                }
            }
            Err(e) => {
                self.rollback();
                self.context.chunk_failed();
                if let ImportError::Database(DatabaseError::Connection(ref msg)) = e {
                    self.context.interrupt(
                        InterruptKind::DatabaseFailure,
                        Some(format!("Aborting import: {}", msg)),
                        LogLevel::Error,
                    );
                } else {
                    error!("Failed to import {}: {}", describe(&chunk), e);
                }
            }
        }
    }

    fn recover(&mut self) {
        self.rollback();
        self.context.chunk_failed();
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.connection.commit() {
            warn!("Final commit of feature worker failed: {}", e);
        }
    }
}

fn describe(chunk: &Chunk) -> String {
    match chunk.gml_id() {
        Some(id) => format!("{} '{}'", chunk.class(), id),
        None => chunk.class().to_string(),
    }
}

pub struct FeatureImportWorkerFactory {
    database: Arc<dyn DatabaseAdapter>,
    caches: Arc<UidCacheManager>,
    xlink_pool: Arc<WorkerPool<Vec<Xlink>>>,
    transformer: Option<AffineTransformer>,
    context: Arc<ImportContext>,
}

impl FeatureImportWorkerFactory {
    pub fn new(
        database: Arc<dyn DatabaseAdapter>,
        caches: Arc<UidCacheManager>,
        xlink_pool: Arc<WorkerPool<Vec<Xlink>>>,
        transformer: Option<AffineTransformer>,
        context: Arc<ImportContext>,
    ) -> Self {
        Self {
            database,
            caches,
            xlink_pool,
            transformer,
            context,
        }
    }
}

impl WorkerFactory<Chunk> for FeatureImportWorkerFactory {
    fn create_worker(&self) -> Option<Box<dyn Worker<Chunk>>> {
        match self.database.connect() {
            Ok(connection) => Some(Box::new(FeatureImportWorker::new(
                connection,
                Arc::clone(&self.caches),
                Arc::clone(&self.xlink_pool),
                self.transformer.clone(),
                Arc::clone(&self.context),
            ))),
            Err(e) => {
                warn!("Failed to open a connection for a feature worker: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheTableStore, UidCache};
    use crate::config::UidCacheSettings;
    use crate::concurrent::PoolSizeAdaptation;
    use crate::database::MemoryDatabase;
    use crate::types::{FeatureClass, GeometryClass};
    use crate::xlink::XlinkRegistrationFactory;

    struct Harness {
        db: MemoryDatabase,
        store: Arc<CacheTableStore>,
        caches: Arc<UidCacheManager>,
        xlinks: Arc<WorkerPool<Vec<Xlink>>>,
        context: Arc<ImportContext>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(CacheTableStore::new(None).unwrap());
            let settings = UidCacheSettings::default();
            let caches = Arc::new(
                UidCacheManager::new()
                    .with_cache(UidCache::new(UidCacheType::Feature, &settings, 100, &store).unwrap())
                    .with_cache(UidCache::new(UidCacheType::Geometry, &settings, 100, &store).unwrap())
                    .with_cache(
                        UidCache::new(UidCacheType::TextureImage, &settings, 100, &store).unwrap(),
                    ),
            );
            let context = Arc::new(ImportContext::default());
            let xlinks = Arc::new(WorkerPool::new(
                "xlink-registration",
                1,
                1,
                PoolSizeAdaptation::Strict,
                XlinkRegistrationFactory::new(Arc::clone(&store), Arc::clone(&context)),
                4,
            ));
            xlinks.prestart_core_workers();
            Self {
                db: MemoryDatabase::new(),
                store,
                caches,
                xlinks,
                context,
            }
        }

        fn worker(&self, transformer: Option<AffineTransformer>) -> FeatureImportWorker {
            FeatureImportWorker::new(
                self.db.connect().unwrap(),
                Arc::clone(&self.caches),
                Arc::clone(&self.xlinks),
                transformer,
                Arc::clone(&self.context),
            )
        }
    }

    #[test]
    fn test_chunk_rows_and_local_resolution() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        let chunk = Chunk::new(FeatureClass::Building, Some("b1".into()))
            .with_geometry(GeometryClass::Polygon, Some("p1"), vec![0.0, 0.0, 0.0])
            .with_reference(XlinkKind::Basic, "generalizesTo", "b1");
        worker.do_work(chunk);

        let building = h.db.find_by_gml_id(schema::CITYOBJECT, "b1").unwrap();
        let member = &h.db.rows(schema::CITYOBJECT_MEMBER)[0];
        assert_eq!(member.int("member_id"), Some(building.id));
        assert_eq!(h.caches.lookup(UidCacheType::Feature, "b1").unwrap().unwrap().id, building.id);
        assert!(h.caches.lookup(UidCacheType::Geometry, "p1").unwrap().is_some());
    }

    #[test]
    fn test_forward_reference_emits_xlink() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        worker.do_work(
            Chunk::new(FeatureClass::Building, Some("b1".into()))
                .with_reference(XlinkKind::Basic, "generalizesTo", "b2"),
        );
        h.xlinks.join();

        let member = &h.db.rows(schema::CITYOBJECT_MEMBER)[0];
        assert_eq!(member.int("member_id"), None);

        let table = h.store.table(&xlink::table_name(XlinkKind::Basic)).unwrap();
        let stored: Vec<Xlink> = table.scan::<Xlink>().collect::<Result<_, _>>().unwrap();
        assert_eq!(stored, vec![Xlink::new(XlinkKind::Basic, member.id, "b2")]);
    }

    #[test]
    fn test_malformed_chunk_rolls_back() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        let chunk = Chunk::new(FeatureClass::Building, Some("bad".into()))
            .with_geometry(GeometryClass::Polygon, None, vec![0.0, 1.0]);
        worker.do_work(chunk);

        assert_eq!(h.db.row_count(schema::CITYOBJECT), 0);
        assert!(h.caches.lookup(UidCacheType::Feature, "bad").unwrap().is_none());

        let mut stats = crate::import::ImportStats::default();
        h.context.fill_stats(&mut stats);
        assert_eq!(stats.chunks_failed, 1);
        assert_eq!(stats.chunks_imported, 0);
    }

    #[test]
    fn test_duplicate_id_keeps_first() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        worker.do_work(Chunk::new(FeatureClass::Building, Some("dup".into())));
        worker.do_work(Chunk::new(FeatureClass::Road, Some("dup".into())));

        let entry = h.caches.lookup(UidCacheType::Feature, "dup").unwrap().unwrap();
        assert_eq!(entry.type_tag, "Building");

        let mut stats = crate::import::ImportStats::default();
        h.context.fill_stats(&mut stats);
        assert_eq!(stats.duplicate_ids, 1);
        assert_eq!(stats.chunks_imported, 2);
    }

    #[test]
    fn test_transformation_applied() {
        let h = Harness::new();
        let shift = AffineTransformer::new(&[
            1.0, 0.0, 0.0, 10.0, //
            0.0, 1.0, 0.0, 20.0, //
            0.0, 0.0, 1.0, 0.0,
        ])
        .unwrap();
        let mut worker = h.worker(Some(shift));

        worker.do_work(
            Chunk::new(FeatureClass::Building, Some("b1".into()))
                .with_geometry(GeometryClass::Point, Some("pt"), vec![1.0, 2.0, 3.0]),
        );

        let point = h.db.find_by_gml_id(schema::SURFACE_GEOMETRY, "pt").unwrap();
        assert_eq!(
            point.values["geometry"],
            Value::Geometry(vec![[11.0, 22.0, 3.0]])
        );
    }

    fn stats(h: &Harness) -> crate::import::ImportStats {
        let mut stats = crate::import::ImportStats::default();
        h.context.fill_stats(&mut stats);
        stats
    }

    #[test]
    fn test_out_of_range_reference_fails_chunk() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        let mut bad = Chunk::new(FeatureClass::Building, Some("bad".into()))
            .with_reference(XlinkKind::Basic, "generalizesTo", "elsewhere");
        bad.references[0].feature = 7;
        worker.do_work(bad);
        worker.do_work(Chunk::new(FeatureClass::Building, Some("good".into())));

        assert!(h.db.find_by_gml_id(schema::CITYOBJECT, "bad").is_none());
        assert!(h.db.find_by_gml_id(schema::CITYOBJECT, "good").is_some());
        assert_eq!(h.db.row_count(schema::CITYOBJECT), 1);
        assert_eq!(h.db.row_count(schema::CITYOBJECT_MEMBER), 0);
        assert!(h.caches.lookup(UidCacheType::Feature, "bad").unwrap().is_none());

        let stats = stats(&h);
        assert_eq!(stats.chunks_failed, 1);
        assert_eq!(stats.chunks_imported, 1);
    }

    #[test]
    fn test_out_of_range_geometry_parent_fails_chunk() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        let mut bad = Chunk::new(FeatureClass::Building, Some("b1".into()))
            .with_geometry(GeometryClass::Polygon, Some("p1"), vec![0.0, 0.0, 0.0]);
        bad.geometries[0].parent = Some(3);
        assert!(matches!(
            worker.write_chunk(&bad),
            Err(ImportError::InvalidChunk(_))
        ));
        worker.recover();

        worker.do_work(Chunk::new(FeatureClass::Road, Some("r1".into())));
        assert_eq!(h.db.row_count(schema::CITYOBJECT), 1);
        assert_eq!(h.db.row_count(schema::SURFACE_GEOMETRY), 0);
        assert_eq!(stats(&h).chunks_failed, 1);
    }

    #[test]
    fn test_recover_discards_open_transaction() {
        let h = Harness::new();
        let mut worker = h.worker(None);

        let mut chunk = Chunk::new(FeatureClass::Building, Some("b1".into()));
        chunk.texture_images.push("roof.png".into());
        worker.write_chunk(&chunk).unwrap();
        worker.recover();
        worker.do_work(Chunk::new(FeatureClass::Building, Some("b2".into())));

        assert!(h.db.find_by_gml_id(schema::CITYOBJECT, "b1").is_none());
        assert_eq!(h.db.row_count(schema::TEX_IMAGE), 0);
        let textures = h.caches.cache(UidCacheType::TextureImage).unwrap();
        assert!(textures.reserve("roof.png").unwrap());
        assert_eq!(stats(&h).chunks_failed, 1);
    }

    #[test]
    fn test_shared_texture_written_once() {
        let h = Harness::new();
        let mut first = h.worker(None);
        let mut second = h.worker(None);

        let mut a = Chunk::new(FeatureClass::Building, Some("b1".into()));
        a.texture_images.push("facade.jpg".into());
        let mut b = Chunk::new(FeatureClass::Building, Some("b2".into()));
        b.texture_images.push("facade.jpg".into());

        // Both transactions are open before either registers the image
        let write_a = first.write_chunk(&a).unwrap();
        let write_b = second.write_chunk(&b).unwrap();
        first.connection.commit().unwrap();
        second.connection.commit().unwrap();
        first.register(write_a.registrations);
        second.register(write_b.registrations);

        let images = h.db.rows(schema::TEX_IMAGE);
        assert_eq!(images.len(), 1);
        let entry = h.caches.lookup(UidCacheType::TextureImage, "facade.jpg").unwrap().unwrap();
        assert_eq!(entry.id, images[0].id);
        assert_eq!(stats(&h).duplicate_ids, 0);
    }
}
