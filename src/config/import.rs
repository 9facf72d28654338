//! Importer configuration: worker pools, identifier caches, indexes, filters

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Import pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Worker pool sizing
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,
    /// Identifier cache sizing
    #[serde(default)]
    pub uid_cache: UidCacheConfig,
    /// Index handling around the bulk load
    #[serde(default)]
    pub indexes: IndexConfig,
    /// Element ordinal and feature class filters
    #[serde(default)]
    pub filter: FilterConfig,
    /// Appearance and texture import switches
    #[serde(default)]
    pub appearance: AppearanceConfig,
    /// Affine coordinate transformation
    #[serde(default)]
    pub affine_transformation: AffineTransformationConfig,
    /// Document validation
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Worker pool sizing shared by the feature, registration and resolver pools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Workers started up front
    pub min_threads: usize,
    /// Upper bound the pool may grow to
    pub max_threads: usize,
    /// Queue capacity is `max_threads * queue_multiplier`
    pub queue_multiplier: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            min_threads: cores,
            max_threads: cores * 2,
            queue_multiplier: 2,
        }
    }
}

impl ThreadPoolConfig {
    pub fn queue_size(&self) -> usize {
        self.max_threads.saturating_mul(self.queue_multiplier).max(1)
    }
}

/// Sizing of one identifier cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UidCacheSettings {
    /// Entries held in memory before spilling
    pub cache_size: usize,
    /// Fraction of a full partition spilled at once (0.0, 1.0]
    pub page_factor: f32,
    /// Number of independently locked partitions
    pub partitions: usize,
}

impl Default for UidCacheSettings {
    fn default() -> Self {
        Self {
            cache_size: 200_000,
            page_factor: 0.85,
            partitions: 10,
        }
    }
}

/// Identifier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UidCacheConfig {
    pub feature: UidCacheSettings,
    pub geometry: UidCacheSettings,
    pub texture_image: UidCacheSettings,
    /// Entries written per batch when a page is spilled
    pub batch_size: usize,
    /// Directory for spill tables (system temp dir when unset)
    pub directory: Option<PathBuf>,
}

impl Default for UidCacheConfig {
    fn default() -> Self {
        Self {
            feature: UidCacheSettings::default(),
            geometry: UidCacheSettings::default(),
            texture_image: UidCacheSettings {
                cache_size: 200_000,
                page_factor: 0.9,
                partitions: 10,
            },
            batch_size: 1000,
            directory: None,
        }
    }
}

/// How an index type is handled around the import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// Leave indexes as they are
    #[default]
    Unchanged,
    /// Drop before the import, leave dropped
    Deactivate,
    /// Drop before the import, recreate afterwards
    DeactivateActivate,
}

impl IndexMode {
    pub fn deactivates(&self) -> bool {
        matches!(self, Self::Deactivate | Self::DeactivateActivate)
    }

    pub fn reactivates(&self) -> bool {
        matches!(self, Self::DeactivateActivate)
    }
}

/// Index handling for spatial and normal indexes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub spatial: IndexMode,
    #[serde(default)]
    pub normal: IndexMode,
}

/// Element filters applied while reading
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// First element (1-based, across all files) to import
    pub first_element: Option<u64>,
    /// Last element (1-based, across all files) to import
    pub last_element: Option<u64>,
    /// Feature classes to import (empty = all)
    #[serde(default)]
    pub feature_classes: Vec<String>,
}

/// Appearance import switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppearanceConfig {
    pub import_appearance: bool,
    pub import_texture_files: bool,
}

impl Default for AppearanceConfig {
    fn default() -> Self {
        Self {
            import_appearance: true,
            import_texture_files: true,
        }
    }
}

/// Affine transformation applied to every coordinate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffineTransformationConfig {
    pub enabled: bool,
    /// Row-major 3x4 matrix `[m00 m01 m02 t0 m10 m11 m12 t1 m20 m21 m22 t2]`
    pub matrix: [f64; 12],
}

impl Default for AffineTransformationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            matrix: [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        }
    }
}

/// Document validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    /// Stop reporting for a feature after its first validation event
    pub report_one_error_per_feature: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_one_error_per_feature: true,
        }
    }
}
