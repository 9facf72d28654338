//! Input file discovery

use super::source::ImportError;
use crate::concurrent::InterruptSignal;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File name suffixes picked up when scanning directories
pub const DEFAULT_EXTENSIONS: &[&str] = &[".gml", ".xml", ".citygml", ".gml.bz2", ".xml.bz2"];

/// Recursive, sorted, stoppable file enumeration
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    extensions: Vec<String>,
    recursive: bool,
}

impl Default for DirectoryScanner {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            recursive: true,
        }
    }
}

impl DirectoryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    fn matches(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Expand the inputs into an ordered file list.
    ///
    /// Files given explicitly are taken as they are; directories are walked
    /// in file name order. Stops early once `interrupt` is raised.
    pub fn scan(
        &self,
        inputs: &[PathBuf],
        interrupt: &InterruptSignal,
    ) -> Result<Vec<PathBuf>, ImportError> {
        let mut files = Vec::new();

        for input in inputs {
            if interrupt.is_raised() {
                break;
            }

            if input.is_file() {
                files.push(input.clone());
                continue;
            }
            if !input.is_dir() {
                warn!("Input path {:?} does not exist", input);
                continue;
            }

            let walker = WalkDir::new(input)
                .max_depth(if self.recursive { usize::MAX } else { 1 })
                .sort_by_file_name();
            for entry in walker {
                if interrupt.is_raised() {
                    debug!("File scan stopped");
                    break;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable path: {}", e);
                        continue;
                    }
                };
                if entry.file_type().is_file() && self.matches(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        }

        debug!("Found {} input files", files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::InterruptKind;
    use crate::config::LogLevel;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::write(path, b"<CityModel/>").unwrap();
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("b.gml"));
        touch(&dir.path().join("a.xml"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("sub/c.gml.bz2"));

        let files = DirectoryScanner::new()
            .scan(&[dir.path().to_path_buf()], &InterruptSignal::new())
            .unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.xml", "b.gml", "sub/c.gml.bz2"]);
    }

    #[test]
    fn test_non_recursive_and_explicit_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("a.gml"));
        touch(&dir.path().join("sub/b.gml"));
        let explicit = dir.path().join("data.custom");
        touch(&explicit);

        let files = DirectoryScanner::new()
            .with_recursive(false)
            .scan(
                &[dir.path().to_path_buf(), explicit.clone()],
                &InterruptSignal::new(),
            )
            .unwrap();
        assert_eq!(files, vec![dir.path().join("a.gml"), explicit]);
    }

    #[test]
    fn test_interrupted_scan_stops() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("a.gml"));
        let signal = InterruptSignal::new();
        signal.raise(InterruptKind::UserAbort, None, LogLevel::Info);

        let files = DirectoryScanner::new()
            .scan(&[dir.path().to_path_buf()], &signal)
            .unwrap();
        assert!(files.is_empty());
    }
}
