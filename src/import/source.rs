//! Core traits and errors for the import pipeline

use super::filter::InputFilter;
use crate::cache::CacheError;
use crate::concurrent::PoolError;
use crate::database::{DatabaseError, IndexType};
use crate::types::Chunk;
use std::path::Path;
use thiserror::Error;

/// A lazy, forward-only sequence of chunks read from one document
pub trait ChunkReader: Send {
    /// Read the next chunk.
    ///
    /// `Ok(None)` means the document is exhausted. An
    /// [`ImportError::InvalidChunk`] affects only that chunk and reading may
    /// continue; any other error ends the document.
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ImportError>;

    /// Release the underlying input
    fn close(&mut self) {}

    /// Validation events reported so far
    fn validation_errors(&self) -> u64 {
        0
    }
}

/// Opens documents as chunk readers
pub trait DocumentSource: Send + Sync {
    fn open(&self, path: &Path, filter: &InputFilter) -> Result<Box<dyn ChunkReader>, ImportError>;
}

/// Errors that can occur during import
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Workspace '{0}' does not exist")]
    WorkspaceNotFound(String),

    #[error("Failed to {operation} {index_type} indexes: {failures}")]
    IndexOperation {
        index_type: IndexType,
        operation: &'static str,
        failures: String,
    },

    #[error("No input files found")]
    NoInputFiles,

    #[error("Could not start any worker for pool '{0}'")]
    NoWorkers(String),

    #[error("Invalid affine transformation: {0}")]
    Transformation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ImportError {
    /// Whether this error ends the whole run rather than the current file
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ImportError::WorkspaceNotFound(_)
                | ImportError::IndexOperation { .. }
                | ImportError::NoInputFiles
                | ImportError::NoWorkers(_)
                | ImportError::Transformation(_)
                | ImportError::Config(_)
        )
    }
}

impl From<quick_xml::Error> for ImportError {
    fn from(e: quick_xml::Error) -> Self {
        ImportError::XmlParse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ImportError::NoWorkers("feature-import".into()).is_fatal());
        assert!(ImportError::NoInputFiles.is_fatal());
        assert!(!ImportError::XmlParse("unexpected end".into()).is_fatal());
        assert!(!ImportError::InvalidChunk("bad ordinates".into()).is_fatal());
        assert!(!ImportError::Pool(PoolError::ShutDown("x".into())).is_fatal());
    }

    #[test]
    fn test_index_error_message() {
        let err = ImportError::IndexOperation {
            index_type: IndexType::Spatial,
            operation: "activate",
            failures: "surface_geometry(geometry): locked".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to activate spatial indexes: surface_geometry(geometry): locked"
        );
    }
}
