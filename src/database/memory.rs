//! In-process database adapter
//!
//! Rows live in a shared map; every connection buffers its writes until
//! commit so a rolled-back chunk leaves nothing behind. Index state is kept
//! per table and faults can be injected for index operations.

use super::{
    schema, DatabaseAdapter, DatabaseConnection, DatabaseError, IndexInfo, IndexStatus,
    IndexStatusInfo, IndexType, Patch, Row, Value,
};
use crate::types::SurrogateId;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A committed row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: SurrogateId,
    pub table: String,
    pub values: BTreeMap<String, Value>,
}

impl StoredRow {
    /// Integer value of a column, `None` when unset or not an integer
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.values.get(column) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Text value of a column
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.values.get(column) {
            Some(Value::Text(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IndexOp {
    Drop,
    Create,
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<SurrogateId, StoredRow>,
    patches: Vec<Patch>,
}

struct Inner {
    next_id: AtomicI64,
    tables: RwLock<Tables>,
    indexes: Mutex<BTreeMap<IndexType, Vec<IndexInfo>>>,
    faults: Mutex<HashMap<(IndexOp, IndexType, String), String>>,
    versioning: bool,
    workspaces: HashSet<String>,
    max_connections: usize,
    open_connections: AtomicUsize,
    connections_opened: AtomicUsize,
}

/// In-memory implementation of [`DatabaseAdapter`]
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Create an unversioned database with all indexes valid
    pub fn new() -> Self {
        Self::build(false, HashSet::new(), usize::MAX)
    }

    /// Enable versioning with the given existing workspaces
    pub fn with_versioning<I, S>(self, workspaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let workspaces = workspaces.into_iter().map(Into::into).collect();
        Self::build(true, workspaces, self.inner.max_connections)
    }

    /// Limit the number of simultaneously open connections
    pub fn with_max_connections(self, max_connections: usize) -> Self {
        Self::build(
            self.inner.versioning,
            self.inner.workspaces.clone(),
            max_connections,
        )
    }

    fn build(versioning: bool, workspaces: HashSet<String>, max_connections: usize) -> Self {
        let mut indexes = BTreeMap::new();
        indexes.insert(
            IndexType::Spatial,
            vec![
                index_info("cityobject_envelope_spx", schema::CITYOBJECT, "envelope"),
                index_info("surface_geom_spx", schema::SURFACE_GEOMETRY, "geometry"),
                index_info("implicit_geom_spx", schema::IMPLICIT_GEOMETRY, "relative_geometry"),
            ],
        );
        indexes.insert(
            IndexType::Normal,
            vec![
                index_info("cityobject_gmlid_inx", schema::CITYOBJECT, "gmlid"),
                index_info("surface_geom_gmlid_inx", schema::SURFACE_GEOMETRY, "gmlid"),
                index_info("surface_geom_parent_inx", schema::SURFACE_GEOMETRY, "parent_id"),
                index_info("tex_image_uri_inx", schema::TEX_IMAGE, "uri"),
            ],
        );

        Self {
            inner: Arc::new(Inner {
                next_id: AtomicI64::new(1),
                tables: RwLock::new(Tables::default()),
                indexes: Mutex::new(indexes),
                faults: Mutex::new(HashMap::new()),
                versioning,
                workspaces,
                max_connections,
                open_connections: AtomicUsize::new(0),
                connections_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Make dropping indexes of `index_type` on `table` fail
    pub fn fail_index_drop(&self, index_type: IndexType, table: &str, message: &str) {
        self.inner
            .faults
            .lock()
            .insert((IndexOp::Drop, index_type, table.to_string()), message.to_string());
    }

    /// Make creating indexes of `index_type` on `table` fail
    pub fn fail_index_creation(&self, index_type: IndexType, table: &str, message: &str) {
        self.inner.faults.lock().insert(
            (IndexOp::Create, index_type, table.to_string()),
            message.to_string(),
        );
    }

    /// All committed rows of a table in id order
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.inner
            .tables
            .read()
            .rows
            .values()
            .filter(|row| row.table == table)
            .cloned()
            .collect()
    }

    /// Number of committed rows in a table
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .rows
            .values()
            .filter(|row| row.table == table)
            .count()
    }

    /// A committed row by id
    pub fn row(&self, id: SurrogateId) -> Option<StoredRow> {
        self.inner.tables.read().rows.get(&id).cloned()
    }

    /// First committed row of `table` whose `gmlid` column equals `gml_id`
    pub fn find_by_gml_id(&self, table: &str, gml_id: &str) -> Option<StoredRow> {
        self.inner
            .tables
            .read()
            .rows
            .values()
            .find(|row| row.table == table && row.text("gmlid") == Some(gml_id))
            .cloned()
    }

    /// Every committed patch, in commit order
    pub fn patches(&self) -> Vec<Patch> {
        self.inner.tables.read().patches.clone()
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Connections opened since creation
    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    fn apply_index_op(
        &self,
        op: IndexOp,
        index_type: IndexType,
    ) -> Result<IndexStatusInfo, DatabaseError> {
        let faults = self.inner.faults.lock();
        let mut indexes = self.inner.indexes.lock();
        let list = indexes.entry(index_type).or_default();

        for index in list.iter_mut() {
            match faults.get(&(op, index_type, index.table.clone())) {
                Some(message) => {
                    index.status = IndexStatus::Errored;
                    index.error_message = Some(message.clone());
                }
                None => {
                    index.status = match op {
                        IndexOp::Drop => IndexStatus::Dropped,
                        IndexOp::Create => IndexStatus::Valid,
                    };
                    index.error_message = None;
                }
            }
        }

        Ok(IndexStatusInfo {
            index_type,
            indexes: list.clone(),
        })
    }
}

fn index_info(name: &str, table: &str, column: &str) -> IndexInfo {
    IndexInfo {
        name: name.to_string(),
        table: table.to_string(),
        column: column.to_string(),
        status: IndexStatus::Valid,
        error_message: None,
    }
}

impl DatabaseAdapter for MemoryDatabase {
    fn has_versioning_support(&self) -> bool {
        self.inner.versioning
    }

    fn workspace_exists(&self, name: &str) -> Result<bool, DatabaseError> {
        Ok(self.inner.workspaces.contains(name))
    }

    fn drop_indexes(&self, index_type: IndexType) -> Result<IndexStatusInfo, DatabaseError> {
        self.apply_index_op(IndexOp::Drop, index_type)
    }

    fn create_indexes(&self, index_type: IndexType) -> Result<IndexStatusInfo, DatabaseError> {
        self.apply_index_op(IndexOp::Create, index_type)
    }

    fn index_status(&self, index_type: IndexType) -> Result<IndexStatusInfo, DatabaseError> {
        let indexes = self.inner.indexes.lock();
        Ok(IndexStatusInfo {
            index_type,
            indexes: indexes.get(&index_type).cloned().unwrap_or_default(),
        })
    }

    fn connect(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError> {
        let inner = &self.inner;
        let acquired = inner
            .open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < inner.max_connections).then_some(open + 1)
            });
        if acquired.is_err() {
            return Err(DatabaseError::Connection(format!(
                "connection limit of {} reached",
                inner.max_connections
            )));
        }
        inner.connections_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            inserts: Vec::new(),
            updates: Vec::new(),
        }))
    }
}

/// Connection buffering one transaction
struct MemoryConnection {
    inner: Arc<Inner>,
    inserts: Vec<StoredRow>,
    updates: Vec<Patch>,
}

impl MemoryConnection {
    fn row_exists(&self, table: &str, id: SurrogateId) -> bool {
        self.inserts.iter().any(|r| r.id == id && r.table == table)
            || self
                .inner
                .tables
                .read()
                .rows
                .get(&id)
                .is_some_and(|r| r.table == table)
    }
}

impl DatabaseConnection for MemoryConnection {
    fn insert(&mut self, row: Row) -> Result<SurrogateId, DatabaseError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inserts.push(StoredRow {
            id,
            table: row.table.to_string(),
            values: row
                .values
                .into_iter()
                .map(|(column, value)| (column.to_string(), value))
                .collect(),
        });
        Ok(id)
    }

    fn update(&mut self, patch: &Patch) -> Result<(), DatabaseError> {
        if !self.row_exists(&patch.table, patch.row_id) {
            return Err(DatabaseError::MissingRow {
                table: patch.table.clone(),
                id: patch.row_id,
            });
        }
        self.updates.push(patch.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        let mut tables = self.inner.tables.write();

        // All or nothing: every patched row must exist once the inserts land
        if let Some(patch) = self.updates.iter().find(|patch| {
            !tables.rows.contains_key(&patch.row_id)
                && !self.inserts.iter().any(|row| row.id == patch.row_id)
        }) {
            return Err(DatabaseError::MissingRow {
                table: patch.table.clone(),
                id: patch.row_id,
            });
        }

        for row in self.inserts.drain(..) {
            tables.rows.insert(row.id, row);
        }
        for patch in self.updates.drain(..) {
            if let Some(row) = tables.rows.get_mut(&patch.row_id) {
                row.values
                    .insert(patch.column.clone(), Value::Int(patch.value));
            }
            tables.patches.push(patch);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.inserts.clear();
        self.updates.clear();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.inner.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}
