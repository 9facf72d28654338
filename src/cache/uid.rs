//! Identifier caches: local id to surrogate id, spilling to the table store

use super::table::{CacheError, CacheTable, CacheTableStore};
use crate::config::UidCacheSettings;
use crate::types::SurrogateId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which objects a cache maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UidCacheType {
    Feature,
    Geometry,
    TextureImage,
}

impl UidCacheType {
    /// Name of the spill table for this cache
    pub fn table_name(&self) -> String {
        format!("gmlid_{}", self)
    }
}

impl fmt::Display for UidCacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UidCacheType::Feature => f.write_str("feature"),
            UidCacheType::Geometry => f.write_str("geometry"),
            UidCacheType::TextureImage => f.write_str("texture_image"),
        }
    }
}

/// A cached identifier mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidEntry {
    pub id: SurrogateId,
    /// Structural type of the object (feature or geometry class name)
    pub type_tag: String,
}

impl UidEntry {
    pub fn new(id: SurrogateId, type_tag: impl Into<String>) -> Self {
        Self {
            id,
            type_tag: type_tag.into(),
        }
    }
}

#[derive(Default)]
struct Partition {
    entries: HashMap<String, UidEntry>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
    /// Ids claimed by a writer whose mapping is not registered yet
    reserved: HashSet<String>,
}

/// Partitioned identifier cache.
///
/// Each partition holds at most `cache_size / partitions` entries in memory.
/// When a partition grows past that, its oldest `page_factor` share is moved
/// to the spill table in batches of `batch_size`. Entries are never removed
/// from the cache as a whole, and never overwritten.
pub struct UidCache {
    cache_type: UidCacheType,
    partitions: Vec<Mutex<Partition>>,
    partition_capacity: usize,
    page_factor: f32,
    batch_size: usize,
    table: CacheTable,
    spilled: AtomicUsize,
}

impl UidCache {
    pub fn new(
        cache_type: UidCacheType,
        settings: &UidCacheSettings,
        batch_size: usize,
        store: &CacheTableStore,
    ) -> Result<Self, CacheError> {
        let partitions = settings.partitions.max(1);
        let table = store.table(&cache_type.table_name())?;

        Ok(Self {
            cache_type,
            partitions: (0..partitions).map(|_| Mutex::new(Partition::default())).collect(),
            partition_capacity: (settings.cache_size / partitions).max(1),
            page_factor: settings.page_factor.clamp(f32::EPSILON, 1.0),
            batch_size: batch_size.max(1),
            table,
            spilled: AtomicUsize::new(0),
        })
    }

    pub fn cache_type(&self) -> UidCacheType {
        self.cache_type
    }

    /// Register a mapping. Returns `false` if the id is already known, in
    /// which case the existing entry is kept.
    pub fn put(&self, local_id: &str, id: SurrogateId, type_tag: &str) -> Result<bool, CacheError> {
        let mut partition = self.partition(local_id).lock();
        partition.reserved.remove(local_id);

        if partition.entries.contains_key(local_id) {
            return Ok(false);
        }
        if self.spilled.load(Ordering::Acquire) > 0
            && self.table.get::<UidEntry>(local_id)?.is_some()
        {
            return Ok(false);
        }

        partition
            .entries
            .insert(local_id.to_string(), UidEntry::new(id, type_tag));
        partition.order.push_back(local_id.to_string());

        if partition.entries.len() > self.partition_capacity {
            self.spill(&mut partition)?;
        }
        Ok(true)
    }

    /// Claim an id before its row is written. Returns `false` if the id is
    /// registered or claimed by someone else. A successful claim ends with
    /// [`put`](Self::put) or [`release`](Self::release).
    pub fn reserve(&self, local_id: &str) -> Result<bool, CacheError> {
        let mut partition = self.partition(local_id).lock();

        if partition.entries.contains_key(local_id) || partition.reserved.contains(local_id) {
            return Ok(false);
        }
        if self.spilled.load(Ordering::Acquire) > 0
            && self.table.get::<UidEntry>(local_id)?.is_some()
        {
            return Ok(false);
        }

        partition.reserved.insert(local_id.to_string());
        Ok(true)
    }

    /// Drop a claim whose row was never committed
    pub fn release(&self, local_id: &str) {
        self.partition(local_id).lock().reserved.remove(local_id);
    }

    /// Look up a mapping in memory, then in the spill table
    pub fn get(&self, local_id: &str) -> Result<Option<UidEntry>, CacheError> {
        if let Some(entry) = self.partition(local_id).lock().entries.get(local_id) {
            return Ok(Some(entry.clone()));
        }
        // Entries only ever move from memory to the table
        if self.spilled.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        self.table.get(local_id)
    }

    /// Number of entries, in memory and spilled
    pub fn len(&self) -> usize {
        self.in_memory() + self.spilled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries currently held in memory
    pub fn in_memory(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().entries.len()).sum()
    }

    /// Entries moved to the spill table
    pub fn spilled(&self) -> usize {
        self.spilled.load(Ordering::Acquire)
    }

    fn partition(&self, local_id: &str) -> &Mutex<Partition> {
        let mut hasher = DefaultHasher::new();
        local_id.hash(&mut hasher);
        let index = (hasher.finish() % self.partitions.len() as u64) as usize;
        &self.partitions[index]
    }

    fn spill(&self, partition: &mut Partition) -> Result<(), CacheError> {
        let count = ((partition.entries.len() as f32) * self.page_factor).ceil() as usize;
        let count = count.clamp(1, partition.order.len());
        let oldest: Vec<String> = partition.order.iter().take(count).cloned().collect();

        for ids in oldest.chunks(self.batch_size) {
            let page: Vec<(String, UidEntry)> = ids
                .iter()
                .filter_map(|id| partition.entries.get(id).map(|e| (id.clone(), e.clone())))
                .collect();

            // An entry must never be absent from both memory and the table
            self.table.insert_all(&page)?;
            self.spilled.fetch_add(page.len(), Ordering::Release);
            for id in ids {
                partition.entries.remove(id);
                partition.order.pop_front();
            }
        }

        debug!(
            "Spilled {} {} identifiers to the cache table",
            count, self.cache_type
        );
        Ok(())
    }
}

/// The identifier caches of one file
#[derive(Default, Clone)]
pub struct UidCacheManager {
    caches: HashMap<UidCacheType, Arc<UidCache>>,
}

impl UidCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: UidCache) -> Self {
        self.caches.insert(cache.cache_type(), Arc::new(cache));
        self
    }

    pub fn cache(&self, cache_type: UidCacheType) -> Option<&UidCache> {
        self.caches.get(&cache_type).map(Arc::as_ref)
    }

    /// Look up an id in the given cache. A missing cache resolves nothing.
    pub fn lookup(
        &self,
        cache_type: UidCacheType,
        local_id: &str,
    ) -> Result<Option<UidEntry>, CacheError> {
        match self.cache(cache_type) {
            Some(cache) => cache.get(local_id),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn settings(cache_size: usize, partitions: usize, page_factor: f32) -> UidCacheSettings {
        UidCacheSettings {
            cache_size,
            page_factor,
            partitions,
        }
    }

    #[test]
    fn test_put_get_and_duplicate() {
        let store = CacheTableStore::new(None).unwrap();
        let cache = UidCache::new(UidCacheType::Feature, &settings(100, 4, 0.85), 10, &store).unwrap();

        assert!(cache.put("b1", 1, "Building").unwrap());
        assert!(!cache.put("b1", 2, "Building").unwrap());
        assert_eq!(cache.get("b1").unwrap(), Some(UidEntry::new(1, "Building")));
        assert_eq!(cache.get("b2").unwrap(), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_spills_oldest_first() {
        let store = CacheTableStore::new(None).unwrap();
        let cache = UidCache::new(UidCacheType::Geometry, &settings(4, 1, 0.5), 1, &store).unwrap();

        for i in 0..5 {
            assert!(cache.put(&format!("g{}", i), i, "Polygon").unwrap());
        }
        // Five entries in a partition of four: ceil(5 * 0.5) = 3 spilled
        assert_eq!(cache.spilled(), 3);
        assert_eq!(cache.in_memory(), 2);

        for i in 0..5 {
            assert_eq!(cache.get(&format!("g{}", i)).unwrap().map(|e| e.id), Some(i));
        }
        assert_eq!(
            store.table("gmlid_geometry").unwrap().get::<UidEntry>("g0").unwrap(),
            Some(UidEntry::new(0, "Polygon"))
        );

        // Duplicates are detected against spilled entries too
        assert!(!cache.put("g0", 99, "Polygon").unwrap());
        assert_eq!(cache.get("g0").unwrap().map(|e| e.id), Some(0));
    }

    #[test]
    fn test_concurrent_puts_keep_one_entry_per_id() {
        let store = CacheTableStore::new(None).unwrap();
        let cache = Arc::new(
            UidCache::new(UidCacheType::Feature, &settings(64, 8, 0.85), 16, &store).unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut won = 0_i64;
                    for i in 0..500 {
                        if cache.put(&format!("f{}", i), t * 1000 + i, "Building").unwrap() {
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();

        let total: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 500);
        assert_eq!(cache.len(), 500);
        for i in 0..500 {
            let entry = cache.get(&format!("f{}", i)).unwrap().unwrap();
            assert_eq!(entry.id % 1000, i);
        }
    }

    #[test]
    fn test_reserve_until_put_or_release() {
        let store = CacheTableStore::new(None).unwrap();
        let cache =
            UidCache::new(UidCacheType::TextureImage, &settings(10, 2, 0.5), 5, &store).unwrap();

        assert!(cache.reserve("roof.png").unwrap());
        assert!(!cache.reserve("roof.png").unwrap());
        assert_eq!(cache.get("roof.png").unwrap(), None);

        cache.release("roof.png");
        assert!(cache.reserve("roof.png").unwrap());

        assert!(cache.put("roof.png", 3, "TextureImage").unwrap());
        assert!(!cache.reserve("roof.png").unwrap());
        cache.release("roof.png");
        assert!(!cache.reserve("roof.png").unwrap());
        assert_eq!(cache.get("roof.png").unwrap().map(|e| e.id), Some(3));
    }

    #[test]
    fn test_concurrent_reserve_has_one_winner() {
        let store = CacheTableStore::new(None).unwrap();
        let cache = Arc::new(
            UidCache::new(UidCacheType::TextureImage, &settings(64, 4, 0.85), 16, &store).unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    (0..100)
                        .filter(|i| cache.reserve(&format!("img{}.jpg", i)).unwrap())
                        .count()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_manager_lookup_without_cache() {
        let store = CacheTableStore::new(None).unwrap();
        let feature = UidCache::new(UidCacheType::Feature, &settings(10, 1, 0.5), 5, &store).unwrap();
        feature.put("b1", 7, "Building").unwrap();
        let manager = UidCacheManager::new().with_cache(feature);

        assert_eq!(
            manager.lookup(UidCacheType::Feature, "b1").unwrap().map(|e| e.id),
            Some(7)
        );
        assert_eq!(manager.lookup(UidCacheType::TextureImage, "b1").unwrap(), None);
    }
}
