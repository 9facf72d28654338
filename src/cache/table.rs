//! Cache table store
//!
//! Uses a sled embedded database inside a private temporary directory. Each
//! table is a sled tree; identifier spill pages are keyed by local id,
//! cross-reference records by a generated monotonic id so a full scan returns
//! them in append order.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the cache table store and the identifier caches
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One table of the store
#[derive(Clone)]
pub struct CacheTable {
    name: String,
    db: sled::Db,
    tree: sled::Tree,
}

impl CacheTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append records in one batch. Returns the number written.
    pub fn append<T: Serialize>(&self, records: &[T]) -> Result<usize, CacheError> {
        let mut batch = sled::Batch::default();
        for record in records {
            let key = self.db.generate_id()?;
            batch.insert(key.to_be_bytes().to_vec(), bincode::serialize(record)?);
        }
        self.tree.apply_batch(batch)?;
        Ok(records.len())
    }

    /// Write keyed entries in one batch, replacing existing keys
    pub fn insert_all<T: Serialize>(&self, entries: &[(String, T)]) -> Result<usize, CacheError> {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(key.as_bytes(), bincode::serialize(value)?);
        }
        self.tree.apply_batch(batch)?;
        Ok(entries.len())
    }

    /// Look up a keyed entry
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.tree.get(key.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Full scan in key order
    pub fn scan<T: DeserializeOwned>(&self) -> impl Iterator<Item = Result<T, CacheError>> {
        self.tree.iter().values().map(|value| -> Result<T, CacheError> {
            let data = value?;
            Ok(bincode::deserialize(&data)?)
        })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Per-file backing store for spilled cache pages and xlink records
///
/// The directory is removed once the store and every table handle taken from
/// it have been dropped.
pub struct CacheTableStore {
    db: sled::Db,
    tables: DashMap<String, CacheTable>,
    path: PathBuf,
    // Declared last: removed after the sled handles above are closed
    _dir: TempDir,
}

impl CacheTableStore {
    /// Create a store in a fresh temporary directory below `base`, or below
    /// the system temp dir when `base` is `None`
    pub fn new(base: Option<&Path>) -> Result<Self, CacheError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("geoload-cache-");
        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };

        let path = dir.path().to_path_buf();
        let db = sled::Config::new()
            .path(path.join("tables.sled"))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        debug!("Opened cache table store at {:?}", path);

        Ok(Self {
            db,
            tables: DashMap::new(),
            path,
            _dir: dir,
        })
    }

    /// Directory holding the store's files
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a table, creating it on first use
    pub fn table(&self, name: &str) -> Result<CacheTable, CacheError> {
        if let Some(table) = self.tables.get(name) {
            return Ok(table.clone());
        }

        let entry = self.tables.entry(name.to_string());
        let table = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let tree = self.db.open_tree(name)?;
                let table = CacheTable {
                    name: name.to_string(),
                    db: self.db.clone(),
                    tree,
                };
                e.insert(table.clone());
                table
            }
        };
        Ok(table)
    }

    /// Names of the tables created so far
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Total number of records across all tables
    pub fn record_count(&self) -> usize {
        self.tables.iter().map(|t| t.value().len()).sum()
    }

    /// Drop every table. Returns the number of tables dropped.
    pub fn drop_all(&self) -> Result<usize, CacheError> {
        let names = self.table_names();
        for name in &names {
            self.tables.remove(name);
            self.db.drop_tree(name.as_bytes())?;
        }
        self.db.flush()?;
        debug!("Dropped {} cache tables", names.len());
        Ok(names.len())
    }
}

impl Drop for CacheTableStore {
    fn drop(&mut self) {
        if let Err(e) = self.drop_all() {
            warn!("Failed to clean up cache tables at {:?}: {}", self.path, e);
        }
    }
}
