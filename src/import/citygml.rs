//! CityGML document reader
//!
//! Streams a CityGML document (optionally bzip2 compressed) and yields one
//! chunk per `cityObjectMember`, `featureMember` or `appearanceMember`.

use super::filter::InputFilter;
use super::source::{ChunkReader, DocumentSource, ImportError};
use crate::config::ValidationConfig;
use crate::types::{
    Chunk, ChunkFeature, ChunkGeometry, ChunkReference, FeatureClass, GeometryClass, XlinkKind,
};
use bzip2::read::BzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const MEMBER_ELEMENTS: &[&str] = &["cityObjectMember", "featureMember", "appearanceMember"];

/// Opens CityGML documents
#[derive(Debug, Clone, Default)]
pub struct CityGmlSource {
    validation: ValidationConfig,
}

impl CityGmlSource {
    pub fn new(validation: ValidationConfig) -> Self {
        Self { validation }
    }
}

impl DocumentSource for CityGmlSource {
    fn open(&self, path: &Path, filter: &InputFilter) -> Result<Box<dyn ChunkReader>, ImportError> {
        Ok(Box::new(CityGmlReader::open(
            path,
            filter.clone(),
            self.validation.clone(),
        )?))
    }
}

/// Reader abstraction for different compression formats
enum XmlInput {
    /// Bzip2 compressed
    Bzip2(Reader<BufReader<BzDecoder<File>>>),
    /// Uncompressed XML
    Plain(Reader<BufReader<File>>),
    Closed,
}

impl XmlInput {
    fn read_event<'a>(&mut self, buf: &'a mut Vec<u8>) -> Result<Event<'a>, quick_xml::Error> {
        buf.clear();
        match self {
            XmlInput::Bzip2(reader) => reader.read_event_into(buf),
            XmlInput::Plain(reader) => reader.read_event_into(buf),
            XmlInput::Closed => Ok(Event::Eof),
        }
    }
}

/// Streaming chunk reader over one CityGML document
pub struct CityGmlReader {
    path: PathBuf,
    input: XmlInput,
    filter: InputFilter,
    validation: ValidationConfig,
    validation_errors: u64,
}

impl CityGmlReader {
    pub fn open(
        path: impl AsRef<Path>,
        filter: InputFilter,
        validation: ValidationConfig,
    ) -> Result<Self, ImportError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let is_bz2 = path.extension().map(|e| e == "bz2").unwrap_or(false);

        let input = if is_bz2 {
            let decoder = BzDecoder::new(file);
            let mut reader = Reader::from_reader(BufReader::with_capacity(1024 * 1024, decoder));
            reader.trim_text(true);
            XmlInput::Bzip2(reader)
        } else {
            let mut reader = Reader::from_reader(BufReader::with_capacity(1024 * 1024, file));
            reader.trim_text(true);
            XmlInput::Plain(reader)
        };

        Ok(Self {
            path,
            input,
            filter,
            validation,
            validation_errors: 0,
        })
    }

    /// Read events until one member element is complete
    fn read_member(&mut self) -> Result<Option<ChunkBuilder>, ImportError> {
        let mut buf = Vec::with_capacity(8192);
        let mut builder: Option<ChunkBuilder> = None;

        loop {
            let event = self.input.read_event(&mut buf)?;

            match event {
                Event::Start(ref e) => {
                    let name = local_name(e);
                    match builder {
                        Some(ref mut b) => b.open(e, &name, false)?,
                        None if MEMBER_ELEMENTS.contains(&name.as_str()) => {
                            builder = Some(ChunkBuilder::default());
                        }
                        None => {}
                    }
                }
                Event::Empty(ref e) => {
                    if let Some(ref mut b) = builder {
                        let name = local_name(e);
                        b.open(e, &name, true)?;
                    }
                }
                Event::Text(ref e) => {
                    if let Some(ref mut b) = builder {
                        if b.capturing() {
                            let text = e.unescape()?;
                            b.text(&text);
                        }
                    }
                }
                Event::CData(ref e) => {
                    if let Some(ref mut b) = builder {
                        if b.capturing() {
                            b.text(&String::from_utf8_lossy(e));
                        }
                    }
                }
                Event::End(_) => {
                    if let Some(ref mut b) = builder {
                        if b.depth() == 0 {
                            return Ok(builder);
                        }
                        b.close();
                    }
                }
                Event::Eof => {
                    if builder.is_some() {
                        return Err(ImportError::XmlParse(
                            "unexpected end of document inside a feature member".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    /// Log and count the problems of one chunk
    fn report_validation(&mut self, gml_id: Option<&str>, problems: &[String]) {
        if !self.validation.enabled || problems.is_empty() {
            return;
        }
        let reported = if self.validation.report_one_error_per_feature {
            &problems[..1]
        } else {
            problems
        };
        for problem in reported {
            error!(
                "Validation error in {} (feature '{}'): {}",
                self.path.display(),
                gml_id.unwrap_or("<no gml:id>"),
                problem
            );
        }
        self.validation_errors += reported.len() as u64;
    }
}

impl ChunkReader for CityGmlReader {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, ImportError> {
        loop {
            let Some(builder) = self.read_member()? else {
                return Ok(None);
            };
            let ChunkBuilder {
                chunk,
                problems,
                malformed,
                ..
            } = builder;

            // Empty member or member holding only a reference
            let Some(chunk) = chunk else {
                continue;
            };

            // Filtered chunks are neither validated nor rejected
            if !self.filter.accept(chunk.class()) {
                debug!("Skipping {} by input filter", chunk.class());
                continue;
            }

            self.report_validation(chunk.gml_id(), &problems);

            if let Some(reason) = malformed {
                return Err(ImportError::InvalidChunk(format!(
                    "{} '{}': {}",
                    chunk.class(),
                    chunk.gml_id().unwrap_or("<no gml:id>"),
                    reason
                )));
            }
            return Ok(Some(chunk));
        }
    }

    fn close(&mut self) {
        self.input = XmlInput::Closed;
    }

    fn validation_errors(&self) -> u64 {
        self.validation_errors
    }
}

// ============================================================================
// Chunk assembly
// ============================================================================

/// What text content of an element is collected for
#[derive(Debug)]
enum Capture {
    Ordinates { geometry: usize, dimension: usize },
    TextureTarget,
    ImageUri,
}

#[derive(Debug)]
enum Frame {
    Feature(usize),
    Geometry(usize),
    Capture(Capture),
    Other,
}

/// Builds one chunk from the events inside a member element
#[derive(Debug, Default)]
struct ChunkBuilder {
    chunk: Option<Chunk>,
    stack: Vec<Frame>,
    text: String,
    /// Validation problems in document order
    problems: Vec<String>,
    /// Set when the chunk cannot be imported
    malformed: Option<String>,
}

impl ChunkBuilder {
    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn capturing(&self) -> bool {
        matches!(self.stack.last(), Some(Frame::Capture(_)))
    }

    fn text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(text);
    }

    fn current_feature(&self) -> usize {
        self.stack
            .iter()
            .rev()
            .find_map(|f| match f {
                Frame::Feature(i) => Some(*i),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Innermost geometry below the innermost feature
    fn current_geometry(&self) -> Option<usize> {
        for frame in self.stack.iter().rev() {
            match frame {
                Frame::Geometry(i) => return Some(*i),
                Frame::Feature(_) => return None,
                _ => {}
            }
        }
        None
    }

    fn open(&mut self, e: &BytesStart<'_>, name: &str, empty: bool) -> Result<(), ImportError> {
        let attrs = Attributes::read(e)?;
        let feature = self.current_feature();
        let geometry = self.current_geometry();

        let frame = match self.chunk {
            None => {
                let class = FeatureClass::from_local_name(name)
                    .unwrap_or_else(|| FeatureClass::Unknown(name.to_string()));
                if attrs.gml_id.is_none() {
                    self.problems.push(format!("{} has no gml:id", class));
                }
                self.chunk = Some(Chunk::new(class, attrs.gml_id.clone()));
                Frame::Feature(0)
            }
            Some(ref mut chunk) => {
                if let Some(class) = FeatureClass::from_local_name(name) {
                    if attrs.gml_id.is_none() {
                        self.problems.push(format!("nested {} has no gml:id", class));
                    }
                    chunk.features.push(ChunkFeature {
                        class,
                        gml_id: attrs.gml_id.clone(),
                        parent: Some(feature),
                    });
                    Frame::Feature(chunk.features.len() - 1)
                } else if let Some(class) = GeometryClass::from_local_name(name) {
                    let dimension = attrs
                        .dimension
                        .or_else(|| geometry.map(|p| chunk.geometries[p].dimension))
                        .unwrap_or(3);
                    chunk.geometries.push(ChunkGeometry {
                        class,
                        gml_id: attrs.gml_id.clone(),
                        feature,
                        parent: geometry,
                        ordinates: Vec::new(),
                        dimension,
                    });
                    Frame::Geometry(chunk.geometries.len() - 1)
                } else {
                    self.property(name, &attrs)
                }
            }
        };

        if let Some(href) = attrs.href {
            self.reference(name, &href);
        }

        if !empty {
            if matches!(frame, Frame::Capture(_)) {
                self.text.clear();
            }
            self.stack.push(frame);
        }
        Ok(())
    }

    /// Frame for an element that is neither feature nor geometry
    fn property(&mut self, name: &str, attrs: &Attributes) -> Frame {
        match name {
            "pos" | "posList" => match self.current_geometry() {
                Some(geometry) => {
                    let dimension = attrs.dimension.unwrap_or_else(|| {
                        self.chunk
                            .as_ref()
                            .map(|c| c.geometries[geometry].dimension)
                            .unwrap_or(3)
                    });
                    Frame::Capture(Capture::Ordinates {
                        geometry,
                        dimension,
                    })
                }
                None => Frame::Other,
            },
            "target" => match attrs.uri {
                Some(ref uri) => {
                    self.add_reference(XlinkKind::TextureAssociation, name, uri, None);
                    Frame::Other
                }
                None => Frame::Capture(Capture::TextureTarget),
            },
            "imageURI" => Frame::Capture(Capture::ImageUri),
            _ => Frame::Other,
        }
    }

    fn close(&mut self) {
        let Some(Frame::Capture(capture)) = self.stack.pop() else {
            return;
        };
        let text = std::mem::take(&mut self.text);

        match capture {
            Capture::Ordinates {
                geometry,
                dimension,
            } => self.ordinates(geometry, dimension, &text),
            Capture::TextureTarget => {
                let target = text.trim();
                if !target.is_empty() {
                    self.add_reference(XlinkKind::TextureAssociation, "target", target, None);
                }
            }
            Capture::ImageUri => {
                let uri = text.trim();
                if let Some(ref mut chunk) = self.chunk {
                    if !uri.is_empty() && !chunk.texture_images.iter().any(|u| u == uri) {
                        chunk.texture_images.push(uri.to_string());
                    }
                }
            }
        }
    }

    fn ordinates(&mut self, geometry: usize, dimension: usize, text: &str) {
        let mut values = Vec::new();
        for token in text.split_whitespace() {
            match token.parse::<f64>() {
                Ok(v) => values.push(v),
                Err(_) => {
                    let reason = format!("unparsable ordinate '{}'", token);
                    self.problems.push(reason.clone());
                    self.malformed.get_or_insert(reason);
                    return;
                }
            }
        }
        if dimension == 0 || values.len() % dimension != 0 {
            self.problems.push(format!(
                "{} ordinates do not match dimension {}",
                values.len(),
                dimension
            ));
        }

        if let Some(ref mut chunk) = self.chunk {
            let geom = &mut chunk.geometries[geometry];
            geom.dimension = dimension;
            geom.ordinates.extend(values);
        }
    }

    /// Classify an `xlink:href` found on element `name`
    fn reference(&mut self, name: &str, href: &str) {
        let geometry = self.current_geometry();
        let kind = if name == "relativeGMLGeometry" {
            XlinkKind::LibraryObject
        } else if geometry.is_some() || name.starts_with("lod") {
            XlinkKind::SurfaceGeometry
        } else {
            XlinkKind::Basic
        };
        self.add_reference(kind, name, href, geometry);
    }

    fn add_reference(&mut self, kind: XlinkKind, property: &str, target: &str, geometry: Option<usize>) {
        let feature = self.current_feature();
        let target = target.trim().trim_start_matches('#');
        if let Some(ref mut chunk) = self.chunk {
            if target.is_empty() {
                self.problems.push(format!("empty reference in {}", property));
                return;
            }
            chunk.references.push(ChunkReference {
                kind,
                target: target.to_string(),
                feature,
                geometry,
                property: property.to_string(),
            });
        }
    }
}

/// The attributes the reader cares about
#[derive(Debug, Default)]
struct Attributes {
    gml_id: Option<String>,
    href: Option<String>,
    uri: Option<String>,
    dimension: Option<usize>,
}

impl Attributes {
    fn read(e: &BytesStart<'_>) -> Result<Self, ImportError> {
        let mut attrs = Self::default();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| ImportError::XmlParse(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            let value = attr.unescape_value()?.to_string();
            match key.as_str() {
                "id" => attrs.gml_id = Some(value),
                "href" => attrs.href = Some(value),
                "uri" => attrs.uri = Some(value),
                "srsDimension" => attrs.dimension = value.trim().parse().ok(),
                _ => {}
            }
        }
        Ok(attrs)
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DOCUMENT: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<core:CityModel xmlns:core="http://www.opengis.net/citygml/2.0"
    xmlns:bldg="http://www.opengis.net/citygml/building/2.0"
    xmlns:app="http://www.opengis.net/citygml/appearance/2.0"
    xmlns:gml="http://www.opengis.net/gml"
    xmlns:xlink="http://www.w3.org/1999/xlink">
  <core:cityObjectMember>
    <bldg:Building gml:id="b1">
      <bldg:lod2Solid>
        <gml:Solid gml:id="s1">
          <gml:exterior>
            <gml:CompositeSurface>
              <gml:surfaceMember>
                <gml:Polygon gml:id="p1">
                  <gml:exterior><gml:LinearRing>
                    <gml:posList srsDimension="3">0 0 0 1 0 0 1 1 0 0 0 0</gml:posList>
                  </gml:LinearRing></gml:exterior>
                </gml:Polygon>
              </gml:surfaceMember>
              <gml:surfaceMember xlink:href="#p9"/>
            </gml:CompositeSurface>
          </gml:exterior>
        </gml:Solid>
      </bldg:lod2Solid>
      <bldg:consistsOfBuildingPart>
        <bldg:BuildingPart gml:id="bp1"/>
      </bldg:consistsOfBuildingPart>
      <core:generalizesTo xlink:href="#b2"/>
    </bldg:Building>
  </core:cityObjectMember>
  <core:cityObjectMember>
    <bldg:Building gml:id="b2"/>
  </core:cityObjectMember>
  <app:appearanceMember>
    <app:Appearance gml:id="a1">
      <app:surfaceDataMember>
        <app:ParameterizedTexture>
          <app:imageURI>tex/roof.png</app:imageURI>
          <app:target uri="#p1"/>
        </app:ParameterizedTexture>
      </app:surfaceDataMember>
    </app:Appearance>
  </app:appearanceMember>
</core:CityModel>"##;

    fn write_doc(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn read_all(reader: &mut CityGmlReader) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_splits_members_into_chunks() {
        let file = write_doc(DOCUMENT);
        let mut reader =
            CityGmlReader::open(file.path(), InputFilter::new(None, true), ValidationConfig::default())
                .unwrap();
        let chunks = read_all(&mut reader);

        assert_eq!(chunks.len(), 3);
        let b1 = &chunks[0];
        assert_eq!(b1.gml_id(), Some("b1"));
        assert_eq!(b1.features.len(), 2);
        assert_eq!(b1.features[1].class, FeatureClass::BuildingPart);
        assert_eq!(b1.features[1].parent, Some(0));

        let classes: Vec<_> = b1.geometries.iter().map(|g| g.class).collect();
        assert_eq!(
            classes,
            vec![GeometryClass::Solid, GeometryClass::CompositeSurface, GeometryClass::Polygon]
        );
        assert_eq!(b1.geometries[2].parent, Some(1));
        assert_eq!(b1.geometries[2].ordinates.len(), 12);

        let refs: Vec<_> = b1
            .references
            .iter()
            .map(|r| (r.kind, r.target.as_str(), r.geometry))
            .collect();
        assert_eq!(
            refs,
            vec![
                (XlinkKind::SurfaceGeometry, "p9", Some(1)),
                (XlinkKind::Basic, "b2", None),
            ]
        );

        let appearance = &chunks[2];
        assert_eq!(appearance.class(), &FeatureClass::Appearance);
        assert_eq!(appearance.texture_images, vec!["tex/roof.png".to_string()]);
        assert_eq!(appearance.references[0].kind, XlinkKind::TextureAssociation);
        assert_eq!(appearance.references[0].target, "p1");
    }

    #[test]
    fn test_filter_drops_appearances() {
        let file = write_doc(DOCUMENT);
        let mut reader = CityGmlReader::open(
            file.path(),
            InputFilter::new(None, false),
            ValidationConfig::default(),
        )
        .unwrap();
        let chunks = read_all(&mut reader);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.class() == &FeatureClass::Building));
    }

    #[test]
    fn test_unparsable_ordinates_reject_chunk_only() {
        let doc = r#"<CityModel xmlns:gml="http://www.opengis.net/gml">
  <cityObjectMember><Building gml:id="x"><lod1Solid><gml:Solid><gml:exterior><gml:Polygon>
    <gml:posList>0 0 zero</gml:posList></gml:Polygon></gml:exterior></gml:Solid></lod1Solid></Building></cityObjectMember>
  <cityObjectMember><Building gml:id="y"/></cityObjectMember>
</CityModel>"#;
        let file = write_doc(doc);
        let mut reader = CityGmlReader::open(
            file.path(),
            InputFilter::new(None, true),
            ValidationConfig {
                enabled: true,
                report_one_error_per_feature: true,
            },
        )
        .unwrap();

        assert!(matches!(reader.next_chunk(), Err(ImportError::InvalidChunk(_))));
        assert_eq!(reader.next_chunk().unwrap().unwrap().gml_id(), Some("y"));
        assert!(reader.next_chunk().unwrap().is_none());
        assert_eq!(reader.validation_errors(), 1);
    }

    #[test]
    fn test_filtered_malformed_chunk_is_skipped() {
        let doc = r#"<CityModel xmlns:gml="http://www.opengis.net/gml">
  <cityObjectMember><Building gml:id="x"><lod1Solid><gml:Solid><gml:exterior><gml:Polygon>
    <gml:posList>0 0 zero</gml:posList></gml:Polygon></gml:exterior></gml:Solid></lod1Solid></Building></cityObjectMember>
  <cityObjectMember><Road gml:id="r1"/></cityObjectMember>
</CityModel>"#;
        let file = write_doc(doc);
        let roads_only = std::collections::HashSet::from([FeatureClass::Road]);
        let mut reader = CityGmlReader::open(
            file.path(),
            InputFilter::new(Some(roads_only), true),
            ValidationConfig {
                enabled: true,
                report_one_error_per_feature: true,
            },
        )
        .unwrap();

        let chunks = read_all(&mut reader);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].gml_id(), Some("r1"));
        assert_eq!(reader.validation_errors(), 0);
    }

    #[test]
    fn test_validation_counts_all_errors_when_requested() {
        let doc = r#"<CityModel xmlns:gml="http://www.opengis.net/gml">
  <cityObjectMember><Building><consistsOfBuildingPart><BuildingPart/></consistsOfBuildingPart></Building></cityObjectMember>
</CityModel>"#;
        let file = write_doc(doc);
        let mut reader = CityGmlReader::open(
            file.path(),
            InputFilter::new(None, true),
            ValidationConfig {
                enabled: true,
                report_one_error_per_feature: false,
            },
        )
        .unwrap();

        assert!(reader.next_chunk().unwrap().is_some());
        assert_eq!(reader.validation_errors(), 2);
    }

    #[test]
    fn test_truncated_document_is_an_error() {
        let file = write_doc("<CityModel><cityObjectMember><Building gml:id=\"b\">");
        let mut reader = CityGmlReader::open(
            file.path(),
            InputFilter::new(None, true),
            ValidationConfig::default(),
        )
        .unwrap();
        assert!(matches!(reader.next_chunk(), Err(ImportError::XmlParse(_))));
    }
}
