//! Database adapter seam
//!
//! The importer only talks to the target database through [`DatabaseAdapter`]
//! (workspace checks and index lifecycle) and per-worker
//! [`DatabaseConnection`]s (row writes). Concrete SQL dialects live outside
//! this crate; [`MemoryDatabase`] is a complete in-process implementation
//! used for dry runs and tests.

mod memory;

pub use memory::{MemoryDatabase, StoredRow};

use crate::types::{Coordinate, SurrogateId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised by a database adapter
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("No row {id} in table {table}")]
    MissingRow { table: String, id: SurrogateId },

    #[error("No open transaction")]
    NoTransaction,
}

// ============================================================================
// Index status
// ============================================================================

/// Index families managed around a bulk import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexType {
    Spatial,
    Normal,
}

impl IndexType {
    pub const ALL: [IndexType; 2] = [IndexType::Spatial, IndexType::Normal];
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::Spatial => f.write_str("spatial"),
            IndexType::Normal => f.write_str("normal"),
        }
    }
}

/// Status of a single index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexStatus {
    Valid,
    Dropped,
    Errored,
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexStatus::Valid => f.write_str("VALID"),
            IndexStatus::Dropped => f.write_str("DROPPED"),
            IndexStatus::Errored => f.write_str("ERROR"),
        }
    }
}

/// Status of one index on one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub column: String,
    pub status: IndexStatus,
    pub error_message: Option<String>,
}

impl fmt::Display for IndexInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}({}): {}",
            self.name, self.table, self.column, self.status
        )
    }
}

/// Per-table report returned by index operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatusInfo {
    pub index_type: IndexType,
    pub indexes: Vec<IndexInfo>,
}

impl IndexStatusInfo {
    /// Indexes whose status differs from `expected`
    pub fn failures(&self, expected: IndexStatus) -> Vec<&IndexInfo> {
        self.indexes
            .iter()
            .filter(|index| index.status != expected)
            .collect()
    }
}

// ============================================================================
// Rows
// ============================================================================

/// A column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Geometry(Vec<Coordinate>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row to insert. The adapter assigns the surrogate id.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: &'static str,
    pub values: BTreeMap<&'static str, Value>,
}

impl Row {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.values.insert(column, value.into());
        self
    }
}

/// A set-style update of one column on one row.
///
/// Applying the same patch twice leaves the row unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Patch {
    pub table: String,
    pub column: String,
    pub row_id: SurrogateId,
    pub value: SurrogateId,
}

// ============================================================================
// Adapter traits
// ============================================================================

/// A connection owned by a single worker
pub trait DatabaseConnection: Send {
    /// Insert a row inside the current transaction and return its id
    fn insert(&mut self, row: Row) -> Result<SurrogateId, DatabaseError>;

    /// Apply a set-style patch inside the current transaction
    fn update(&mut self, patch: &Patch) -> Result<(), DatabaseError>;

    /// Make all writes since the last commit/rollback visible
    fn commit(&mut self) -> Result<(), DatabaseError>;

    /// Discard all writes since the last commit/rollback
    fn rollback(&mut self) -> Result<(), DatabaseError>;
}

/// Operations the importer needs from the target database
pub trait DatabaseAdapter: Send + Sync {
    /// Whether the database supports versioned workspaces
    fn has_versioning_support(&self) -> bool;

    /// Whether the named workspace exists
    fn workspace_exists(&self, name: &str) -> Result<bool, DatabaseError>;

    /// Drop all indexes of a type, reporting per table
    fn drop_indexes(&self, index_type: IndexType) -> Result<IndexStatusInfo, DatabaseError>;

    /// (Re)create all indexes of a type, reporting per table
    fn create_indexes(&self, index_type: IndexType) -> Result<IndexStatusInfo, DatabaseError>;

    /// Current status of all indexes of a type
    fn index_status(&self, index_type: IndexType) -> Result<IndexStatusInfo, DatabaseError>;

    /// Open a connection for one worker
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>, DatabaseError>;
}

/// Table and column names written by the importer
pub mod schema {
    pub const CITYOBJECT: &str = "cityobject";
    pub const SURFACE_GEOMETRY: &str = "surface_geometry";
    pub const TEXTUREPARAM: &str = "textureparam";
    pub const IMPLICIT_GEOMETRY: &str = "implicit_geometry";
    pub const TEX_IMAGE: &str = "tex_image";
    pub const CITYOBJECT_MEMBER: &str = "cityobject_member";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_failures() {
        let info = IndexStatusInfo {
            index_type: IndexType::Spatial,
            indexes: vec![
                IndexInfo {
                    name: "cityobject_envelope_spx".into(),
                    table: "cityobject".into(),
                    column: "envelope".into(),
                    status: IndexStatus::Dropped,
                    error_message: None,
                },
                IndexInfo {
                    name: "surface_geom_spx".into(),
                    table: "surface_geometry".into(),
                    column: "geometry".into(),
                    status: IndexStatus::Errored,
                    error_message: Some("locked".into()),
                },
            ],
        };

        let failed = info.failures(IndexStatus::Dropped);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].table, "surface_geometry");
        assert_eq!(
            failed[0].to_string(),
            "surface_geom_spx on surface_geometry(geometry): ERROR"
        );
    }

    #[test]
    fn test_row_builder() {
        let row = Row::new(schema::CITYOBJECT)
            .with("gmlid", Some("b1"))
            .with("parent_id", None::<i64>);
        assert_eq!(row.values["gmlid"], Value::Text("b1".into()));
        assert_eq!(row.values["parent_id"], Value::Null);
    }
}
