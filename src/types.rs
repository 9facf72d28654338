//! Core types shared by the import pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// Document-local identifier (the `gml:id` of an element)
pub type LocalId = String;

/// Database surrogate key
pub type SurrogateId = i64;

/// A coordinate tuple (x, y, z)
pub type Coordinate = [f64; 3];

// ============================================================================
// Structural type tags
// ============================================================================

/// Feature classes recognised by the chunk reader
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureClass {
    Building,
    BuildingPart,
    BuildingInstallation,
    Bridge,
    BridgePart,
    Tunnel,
    TunnelPart,
    Road,
    Railway,
    Track,
    Square,
    TinRelief,
    ReliefFeature,
    WaterBody,
    PlantCover,
    SolitaryVegetationObject,
    LandUse,
    CityFurniture,
    CityObjectGroup,
    GenericCityObject,
    Appearance,
    /// Any other element found directly below a member property
    Unknown(String),
}

impl FeatureClass {
    /// Map an element local name to a feature class.
    ///
    /// Returns `None` for names that are not features (so the reader can tell
    /// nested features apart from ordinary properties).
    pub fn from_local_name(name: &str) -> Option<Self> {
        let class = match name {
            "Building" => Self::Building,
            "BuildingPart" => Self::BuildingPart,
            "BuildingInstallation" => Self::BuildingInstallation,
            "Bridge" => Self::Bridge,
            "BridgePart" => Self::BridgePart,
            "Tunnel" => Self::Tunnel,
            "TunnelPart" => Self::TunnelPart,
            "Road" => Self::Road,
            "Railway" => Self::Railway,
            "Track" => Self::Track,
            "Square" => Self::Square,
            "TINRelief" => Self::TinRelief,
            "ReliefFeature" => Self::ReliefFeature,
            "WaterBody" => Self::WaterBody,
            "PlantCover" => Self::PlantCover,
            "SolitaryVegetationObject" => Self::SolitaryVegetationObject,
            "LandUse" => Self::LandUse,
            "CityFurniture" => Self::CityFurniture,
            "CityObjectGroup" => Self::CityObjectGroup,
            "GenericCityObject" => Self::GenericCityObject,
            "Appearance" => Self::Appearance,
            _ => return None,
        };
        Some(class)
    }

    /// Parse a class name as written in configuration files
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_local_name(name).or_else(|| match name.to_ascii_lowercase().as_str() {
            "building" => Some(Self::Building),
            "road" => Some(Self::Road),
            "railway" => Some(Self::Railway),
            "waterbody" => Some(Self::WaterBody),
            "landuse" => Some(Self::LandUse),
            "cityfurniture" => Some(Self::CityFurniture),
            "genericcityobject" => Some(Self::GenericCityObject),
            "appearance" => Some(Self::Appearance),
            _ => None,
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Building => "Building",
            Self::BuildingPart => "BuildingPart",
            Self::BuildingInstallation => "BuildingInstallation",
            Self::Bridge => "Bridge",
            Self::BridgePart => "BridgePart",
            Self::Tunnel => "Tunnel",
            Self::TunnelPart => "TunnelPart",
            Self::Road => "Road",
            Self::Railway => "Railway",
            Self::Track => "Track",
            Self::Square => "Square",
            Self::TinRelief => "TINRelief",
            Self::ReliefFeature => "ReliefFeature",
            Self::WaterBody => "WaterBody",
            Self::PlantCover => "PlantCover",
            Self::SolitaryVegetationObject => "SolitaryVegetationObject",
            Self::LandUse => "LandUse",
            Self::CityFurniture => "CityFurniture",
            Self::CityObjectGroup => "CityObjectGroup",
            Self::GenericCityObject => "GenericCityObject",
            Self::Appearance => "Appearance",
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for FeatureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geometry classes recognised by the chunk reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GeometryClass {
    Point,
    MultiPoint,
    LineString,
    MultiCurve,
    Polygon,
    Triangle,
    MultiSurface,
    CompositeSurface,
    TriangulatedSurface,
    Solid,
    CompositeSolid,
    MultiSolid,
}

impl GeometryClass {
    pub fn from_local_name(name: &str) -> Option<Self> {
        let class = match name {
            "Point" => Self::Point,
            "MultiPoint" => Self::MultiPoint,
            "LineString" => Self::LineString,
            "MultiCurve" => Self::MultiCurve,
            "Polygon" => Self::Polygon,
            "Triangle" => Self::Triangle,
            "MultiSurface" => Self::MultiSurface,
            "CompositeSurface" => Self::CompositeSurface,
            "TriangulatedSurface" | "TIN" => Self::TriangulatedSurface,
            "Solid" => Self::Solid,
            "CompositeSolid" => Self::CompositeSolid,
            "MultiSolid" => Self::MultiSolid,
            _ => return None,
        };
        Some(class)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Point => "Point",
            Self::MultiPoint => "MultiPoint",
            Self::LineString => "LineString",
            Self::MultiCurve => "MultiCurve",
            Self::Polygon => "Polygon",
            Self::Triangle => "Triangle",
            Self::MultiSurface => "MultiSurface",
            Self::CompositeSurface => "CompositeSurface",
            Self::TriangulatedSurface => "TriangulatedSurface",
            Self::Solid => "Solid",
            Self::CompositeSolid => "CompositeSolid",
            Self::MultiSolid => "MultiSolid",
        }
    }
}

impl fmt::Display for GeometryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// Kind of a cross-reference, which decides the cache it resolves against
/// and the row it patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum XlinkKind {
    /// Reuse of a geometry defined elsewhere (`surfaceMember xlink:href`)
    SurfaceGeometry,
    /// Implicit geometry pointing at a library object
    LibraryObject,
    /// Appearance-to-surface texture association (`app:target`)
    TextureAssociation,
    /// Feature-to-feature reference (`generalizesTo`, `groupMember`, ...)
    Basic,
}

impl XlinkKind {
    /// Kinds in the order the splitter replays them
    pub const ALL: [XlinkKind; 4] = [
        XlinkKind::SurfaceGeometry,
        XlinkKind::LibraryObject,
        XlinkKind::TextureAssociation,
        XlinkKind::Basic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SurfaceGeometry => "surface_geometry",
            Self::LibraryObject => "library_object",
            Self::TextureAssociation => "texture_association",
            Self::Basic => "basic",
        }
    }
}

impl fmt::Display for XlinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature found inside a chunk. Index 0 is the top-level feature.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFeature {
    pub class: FeatureClass,
    pub gml_id: Option<LocalId>,
    /// Index of the enclosing feature within the same chunk
    pub parent: Option<usize>,
}

/// A geometry found inside a chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGeometry {
    pub class: GeometryClass,
    pub gml_id: Option<LocalId>,
    /// Owning feature index
    pub feature: usize,
    /// Enclosing geometry index, `None` for a root geometry
    pub parent: Option<usize>,
    /// Flat ordinate list as read from `gml:pos` / `gml:posList`
    pub ordinates: Vec<f64>,
    /// Coordinate dimension declared for the ordinates
    pub dimension: usize,
}

impl ChunkGeometry {
    /// Group ordinates into 3D coordinates. 2D input gets `z = 0`.
    ///
    /// Returns `None` when the ordinate count does not match the dimension.
    pub fn coordinates(&self) -> Option<Vec<Coordinate>> {
        let dim = self.dimension;
        if !(2..=3).contains(&dim) || self.ordinates.len() % dim != 0 {
            return None;
        }
        Some(
            self.ordinates
                .chunks(dim)
                .map(|c| [c[0], c[1], if dim == 3 { c[2] } else { 0.0 }])
                .collect(),
        )
    }
}

/// An `xlink:href` style reference found inside a chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReference {
    pub kind: XlinkKind,
    /// Target identifier without the leading `#`
    pub target: LocalId,
    /// Feature that holds the reference
    pub feature: usize,
    /// Geometry that holds the reference, if it sits inside a geometry
    pub geometry: Option<usize>,
    /// Local name of the referencing property
    pub property: String,
}

/// One independently importable unit of a document
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub features: Vec<ChunkFeature>,
    pub geometries: Vec<ChunkGeometry>,
    pub references: Vec<ChunkReference>,
    /// Texture image URIs found inside appearances
    pub texture_images: Vec<String>,
}

impl Chunk {
    /// Create a chunk with a single top-level feature
    pub fn new(class: FeatureClass, gml_id: Option<String>) -> Self {
        Self {
            features: vec![ChunkFeature {
                class,
                gml_id,
                parent: None,
            }],
            geometries: Vec::new(),
            references: Vec::new(),
            texture_images: Vec::new(),
        }
    }

    /// Structural type of the top-level feature
    pub fn class(&self) -> &FeatureClass {
        &self.features[0].class
    }

    /// `gml:id` of the top-level feature
    pub fn gml_id(&self) -> Option<&str> {
        self.features[0].gml_id.as_deref()
    }

    /// Add a root geometry to the top-level feature
    pub fn with_geometry(
        mut self,
        class: GeometryClass,
        gml_id: Option<&str>,
        ordinates: Vec<f64>,
    ) -> Self {
        self.geometries.push(ChunkGeometry {
            class,
            gml_id: gml_id.map(str::to_string),
            feature: 0,
            parent: None,
            ordinates,
            dimension: 3,
        });
        self
    }

    /// Add a feature reference from the top-level feature
    pub fn with_reference(mut self, kind: XlinkKind, property: &str, target: &str) -> Self {
        self.references.push(ChunkReference {
            kind,
            target: target.trim_start_matches('#').to_string(),
            feature: 0,
            geometry: None,
            property: property.to_string(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_class_names() {
        assert_eq!(FeatureClass::from_local_name("Building"), Some(FeatureClass::Building));
        assert_eq!(FeatureClass::from_local_name("TINRelief"), Some(FeatureClass::TinRelief));
        assert_eq!(FeatureClass::from_local_name("boundedBy"), None);
        assert_eq!(FeatureClass::parse("waterbody"), Some(FeatureClass::WaterBody));
        assert_eq!(FeatureClass::Unknown("Foo".into()).to_string(), "Foo");
    }

    #[test]
    fn test_geometry_coordinates() {
        let mut geom = ChunkGeometry {
            class: GeometryClass::Polygon,
            gml_id: None,
            feature: 0,
            parent: None,
            ordinates: vec![0.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            dimension: 3,
        };
        assert_eq!(
            geom.coordinates(),
            Some(vec![[0.0, 0.0, 1.0], [1.0, 0.0, 1.0]])
        );

        geom.dimension = 2;
        assert_eq!(geom.coordinates().map(|c| c.len()), Some(3));

        geom.ordinates.pop();
        assert_eq!(geom.coordinates(), None);
    }

    #[test]
    fn test_chunk_builder_strips_hash() {
        let chunk = Chunk::new(FeatureClass::Building, Some("b1".into()))
            .with_reference(XlinkKind::Basic, "generalizesTo", "#b2");
        assert_eq!(chunk.references[0].target, "b2");
        assert_eq!(chunk.gml_id(), Some("b1"));
        assert_eq!(chunk.class(), &FeatureClass::Building);
    }
}
