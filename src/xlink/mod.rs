//! Deferred cross-references
//!
//! A feature worker that cannot resolve a reference writes its row with the
//! foreign key unset and emits an [`Xlink`]. The registration pool persists
//! xlinks per kind; after the file's main pass the [`XlinkSplitter`] replays
//! them into the resolver pool, which patches the row once the target is
//! known.

mod registration;
mod resolver;
mod splitter;

pub use registration::{XlinkRegistrationFactory, XlinkRegistrationWorker};
pub use resolver::{XlinkResolverFactory, XlinkResolverWorker};
pub use splitter::{SplitterStats, XlinkSplitter, SPLITTER_CHECK_INTERVAL};

use crate::cache::UidCacheType;
use crate::database::{schema, Patch};
use crate::types::{LocalId, SurrogateId, XlinkKind};
use serde::{Deserialize, Serialize};

/// A reference waiting for its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xlink {
    pub kind: XlinkKind,
    /// Row holding the unset foreign key
    pub source_id: SurrogateId,
    /// Local id of the target object
    pub target: LocalId,
    pub table: String,
    pub column: String,
}

impl Xlink {
    pub fn new(kind: XlinkKind, source_id: SurrogateId, target: impl Into<LocalId>) -> Self {
        let (table, column) = target_column(kind);
        Self {
            kind,
            source_id,
            target: target.into(),
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    /// Cache the target id is looked up in
    pub fn cache_type(&self) -> UidCacheType {
        cache_type(self.kind)
    }

    /// The patch that resolves this xlink to `target_id`
    pub fn patch(&self, target_id: SurrogateId) -> Patch {
        Patch {
            table: self.table.clone(),
            column: self.column.clone(),
            row_id: self.source_id,
            value: target_id,
        }
    }
}

/// Cache table holding xlinks of a kind
pub fn table_name(kind: XlinkKind) -> String {
    format!("xlink_{}", kind)
}

/// Table and column that a reference of this kind fills in
pub fn target_column(kind: XlinkKind) -> (&'static str, &'static str) {
    match kind {
        XlinkKind::SurfaceGeometry => (schema::SURFACE_GEOMETRY, "xlink_id"),
        XlinkKind::LibraryObject => (schema::IMPLICIT_GEOMETRY, "relative_geometry_id"),
        XlinkKind::TextureAssociation => (schema::TEXTUREPARAM, "surface_geometry_id"),
        XlinkKind::Basic => (schema::CITYOBJECT_MEMBER, "member_id"),
    }
}

/// Cache the targets of this kind are registered in
pub fn cache_type(kind: XlinkKind) -> UidCacheType {
    match kind {
        XlinkKind::Basic => UidCacheType::Feature,
        XlinkKind::SurfaceGeometry | XlinkKind::LibraryObject | XlinkKind::TextureAssociation => {
            UidCacheType::Geometry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xlink_patch() {
        let xlink = Xlink::new(XlinkKind::Basic, 42, "b2");
        assert_eq!(xlink.table, "cityobject_member");
        assert_eq!(xlink.cache_type(), UidCacheType::Feature);

        let patch = xlink.patch(7);
        assert_eq!(patch.row_id, 42);
        assert_eq!(patch.column, "member_id");
        assert_eq!(patch.value, 7);
        assert_eq!(table_name(XlinkKind::TextureAssociation), "xlink_texture_association");
    }
}
