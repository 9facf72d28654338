//! Configuration for geoload

mod database;
mod import;
mod logging;

pub use database::{DatabaseConfig, DEFAULT_WORKSPACE};
pub use import::{
    AffineTransformationConfig, AppearanceConfig, FilterConfig, ImportConfig, IndexConfig,
    IndexMode, ThreadPoolConfig, UidCacheConfig, UidCacheSettings, ValidationConfig,
};
pub use logging::{LogFormat, LogLevel, LoggingConfig};

use crate::types::FeatureClass;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target database
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Import pipeline
    #[serde(default)]
    pub import: ImportConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate all configuration fields.
    ///
    /// Collects every problem and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let import = &self.import;

        // Worker pools
        let pool = &import.thread_pool;
        if pool.min_threads == 0 {
            errors.push("min_threads must be positive".to_string());
        }
        if pool.max_threads < pool.min_threads {
            errors.push(format!(
                "max_threads ({}) must be >= min_threads ({})",
                pool.max_threads, pool.min_threads
            ));
        }
        if pool.queue_multiplier == 0 {
            errors.push("queue_multiplier must be positive".to_string());
        }

        // Identifier caches
        for (name, cache) in [
            ("feature", &import.uid_cache.feature),
            ("geometry", &import.uid_cache.geometry),
            ("texture_image", &import.uid_cache.texture_image),
        ] {
            if cache.partitions == 0 {
                errors.push(format!("{} cache partitions must be positive", name));
            }
            if cache.cache_size < cache.partitions {
                errors.push(format!(
                    "{} cache_size must be at least the number of partitions",
                    name
                ));
            }
            if !(cache.page_factor > 0.0 && cache.page_factor <= 1.0) {
                errors.push(format!(
                    "{} page_factor must be between 0.0 (exclusive) and 1.0",
                    name
                ));
            }
        }
        if import.uid_cache.batch_size == 0 {
            errors.push("uid cache batch_size must be positive".to_string());
        }

        // Element filter
        let filter = &import.filter;
        if filter.first_element == Some(0) || filter.last_element == Some(0) {
            errors.push("element ordinals are 1-based".to_string());
        }
        if let (Some(first), Some(last)) = (filter.first_element, filter.last_element) {
            if first > last {
                errors.push(format!(
                    "first_element ({}) must not exceed last_element ({})",
                    first, last
                ));
            }
        }
        for name in &filter.feature_classes {
            if FeatureClass::parse(name).is_none() {
                errors.push(format!("unknown feature class '{}'", name));
            }
        }

        // Database
        if self.database.workspace.trim().is_empty() {
            errors.push("workspace must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("max_connections must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.import.thread_pool = ThreadPoolConfig {
            min_threads: 2,
            max_threads: 4,
            queue_multiplier: 2,
        };
        config
    }

    #[test]
    fn default_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_thread_bounds() {
        let mut cfg = valid_config();
        cfg.import.thread_pool.max_threads = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be >= min_threads"));
    }

    #[test]
    fn validate_rejects_bad_page_factor() {
        let mut cfg = valid_config();
        cfg.import.uid_cache.geometry.page_factor = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("geometry page_factor"));
    }

    #[test]
    fn validate_rejects_inverted_ordinals() {
        let mut cfg = valid_config();
        cfg.import.filter.first_element = Some(5);
        cfg.import.filter.last_element = Some(3);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed last_element"));
    }

    #[test]
    fn validate_rejects_unknown_feature_class() {
        let mut cfg = valid_config();
        cfg.import.filter.feature_classes = vec!["Building".into(), "Spaceship".into()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown feature class 'Spaceship'"));
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let mut cfg = valid_config();
        cfg.import.thread_pool.min_threads = 0;
        cfg.import.uid_cache.batch_size = 0;
        cfg.database.workspace = " ".into();
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("min_threads must be positive"));
        assert!(msg.contains("batch_size must be positive"));
        assert!(msg.contains("workspace must not be empty"));
    }

    #[test]
    fn queue_size_is_twice_max_threads_by_default() {
        let cfg = valid_config();
        assert_eq!(cfg.import.thread_pool.queue_size(), 8);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut cfg = valid_config();
        cfg.import.indexes.spatial = IndexMode::DeactivateActivate;
        cfg.import.filter.last_element = Some(10);
        let text = cfg.to_toml().unwrap();
        assert!(text.contains("deactivate_activate"));

        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.import.indexes.spatial, IndexMode::DeactivateActivate);
        assert_eq!(parsed.import.filter.last_element, Some(10));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [import.indexes]
            normal = "deactivate"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.import.indexes.normal, IndexMode::Deactivate);
        assert_eq!(parsed.import.indexes.spatial, IndexMode::Unchanged);
        assert_eq!(parsed.database.workspace, DEFAULT_WORKSPACE);
    }
}
